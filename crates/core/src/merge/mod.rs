//! Three-way merging.
//!
//! - [`matcher`] matches child elements across versions by identity.
//! - [`classifier`] decides change or conflict for one value triple.
//! - [`driver`] runs the recursive tree merge.
//! - [`text`] merges plain text files line by line.
//! - [`report`] and [`situation`] hold the data passed in and out.

pub mod classifier;
pub mod driver;
pub mod matcher;
pub mod report;
pub mod situation;
pub mod text;

pub use classifier::{classify, Classification, ValueLevel, Verdict};
pub use driver::{MergeDriver, MergeResult};
pub use matcher::{ElementKey, ElementMatcher, IdentityConfig, MatchedTriple};
pub use report::{
    ChangeKind, ChangeReport, ConflictKind, ConflictReport, FileMergeReport, MergeReports,
    ReportSink,
};
pub use situation::{ConflictHandlingMode, MergeOrder, MergeSituation, Side};
pub use text::TextMerger;
