//! treesync core library.
//!
//! This crate provides peer-to-peer synchronization of structured XML
//! repositories: a generic three-way tree merge that turns every divergence
//! into a change or conflict report, a file-type handler registry, and the
//! sync coordinator that commits, pulls, merges, pushes and rolls back.
//! Repository mechanics are reached through the [`vcs::VcsBackend`] trait.

pub mod config;
pub mod errors;
pub mod file_policy;
pub mod handlers;
pub mod merge;
pub mod models;
pub mod sync_engine;
pub mod vcs;
pub mod xml;

// Re-exports for convenience.
pub use config::SyncConfig;
pub use errors::CoreError;
pub use handlers::{FileTypeHandler, HandlerRegistry};
pub use merge::{MergeDriver, MergeResult, MergeSituation};
pub use sync_engine::{CancelHandle, SyncCoordinator};
pub use vcs::memory::{MemoryNetwork, MemoryRepository};
pub use vcs::VcsBackend;
pub use xml::{Document, Element};
