//! Conflict classification.
//!
//! [`classify`] is a pure decision function over one value seen in the
//! ancestor, ours and theirs (`None` meaning absent). It is applied to whole
//! elements, to attributes and to text alike. It returns the value to keep
//! and a [`Verdict`] describing what happened, from which at most one report
//! is derived: a change or a conflict, never both.

use super::report::{ChangeKind, ConflictKind};
use super::situation::{ConflictHandlingMode, Side};

/// What kind of value was classified. Selects the conflict kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLevel {
    Attribute,
    Text,
    Element,
}

/// Which side(s) removed a value present in the ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remover {
    Ours,
    Theirs,
    Both,
}

/// The outcome of classifying one triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nobody changed it (or it is absent everywhere).
    Unchanged,
    /// Exactly one side changed it; that side's value is taken silently.
    FastForward(Side),
    /// Both sides made the same change.
    Convergent(ChangeKind),
    /// Both sides changed it differently; `winner` is kept.
    Divergent { winner: Side, both_added: bool },
    /// Removed, and nobody edited it.
    Deleted(Remover),
    /// One side edited it while the other removed it. The edit is kept.
    EditedVsDeleted { edited_by: Side },
    /// Added by one side only.
    Added(Side),
}

impl Verdict {
    /// The change report kind this verdict produces, if any.
    pub fn change_kind(&self) -> Option<ChangeKind> {
        match self {
            Self::Convergent(kind) => Some(*kind),
            Self::Deleted(_) => Some(ChangeKind::Deletion),
            Self::Added(_) => Some(ChangeKind::Addition),
            _ => None,
        }
    }

    /// The conflict report kind this verdict produces at `level`, if any.
    pub fn conflict_kind(&self, level: ValueLevel) -> Option<ConflictKind> {
        use ConflictKind::*;
        let kind = match self {
            Self::Divergent { both_added, .. } => match (level, *both_added) {
                (ValueLevel::Attribute, false) => BothEditedAttribute,
                (ValueLevel::Attribute, true) => BothAddedAttribute,
                (ValueLevel::Text, false) => BothEditedText,
                (ValueLevel::Text, true) => BothAddedText,
                (ValueLevel::Element, false) => BothEditedElement,
                (ValueLevel::Element, true) => BothAddedElement,
            },
            Self::EditedVsDeleted { edited_by } => match (level, *edited_by) {
                (ValueLevel::Attribute, Side::Ours) => EditedVsRemovedAttribute,
                (ValueLevel::Attribute, Side::Theirs) => RemovedVsEditedAttribute,
                (ValueLevel::Text, Side::Ours) => EditedVsRemovedText,
                (ValueLevel::Text, Side::Theirs) => RemovedVsEditedText,
                (ValueLevel::Element, Side::Ours) => EditedVsRemovedElement,
                (ValueLevel::Element, Side::Theirs) => RemovedVsEditedElement,
            },
            _ => return None,
        };
        Some(kind)
    }

    /// The side whose value was kept in a conflict.
    pub fn conflict_winner(&self) -> Option<Side> {
        match self {
            Self::Divergent { winner, .. } => Some(*winner),
            Self::EditedVsDeleted { edited_by } => Some(*edited_by),
            _ => None,
        }
    }
}

/// The value to keep plus the verdict that chose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification<'v, T: ?Sized> {
    pub value: Option<&'v T>,
    pub verdict: Verdict,
}

/// Classify one ancestor/ours/theirs triple.
pub fn classify<'v, T: PartialEq + ?Sized>(
    mode: ConflictHandlingMode,
    ancestor: Option<&'v T>,
    ours: Option<&'v T>,
    theirs: Option<&'v T>,
) -> Classification<'v, T> {
    let winner = match mode {
        ConflictHandlingMode::OursWins => Side::Ours,
        ConflictHandlingMode::TheirsWins => Side::Theirs,
    };
    let pick = |side: Side| match side {
        Side::Ours => ours,
        Side::Theirs => theirs,
    };

    let (value, verdict) = match (ancestor, ours, theirs) {
        (None, None, None) => (None, Verdict::Unchanged),
        (Some(a), Some(o), Some(t)) => {
            if o == a && t == a {
                (ours, Verdict::Unchanged)
            } else if o == t {
                (ours, Verdict::Convergent(ChangeKind::Edit))
            } else if o == a {
                (theirs, Verdict::FastForward(Side::Theirs))
            } else if t == a {
                (ours, Verdict::FastForward(Side::Ours))
            } else {
                (
                    pick(winner),
                    Verdict::Divergent {
                        winner,
                        both_added: false,
                    },
                )
            }
        }
        (None, Some(_), None) => (ours, Verdict::Added(Side::Ours)),
        (None, None, Some(_)) => (theirs, Verdict::Added(Side::Theirs)),
        (None, Some(o), Some(t)) => {
            if o == t {
                (ours, Verdict::Convergent(ChangeKind::Addition))
            } else {
                (
                    pick(winner),
                    Verdict::Divergent {
                        winner,
                        both_added: true,
                    },
                )
            }
        }
        (Some(_), None, None) => (None, Verdict::Deleted(Remover::Both)),
        (Some(a), Some(o), None) => {
            if o == a {
                (None, Verdict::Deleted(Remover::Theirs))
            } else {
                (ours, Verdict::EditedVsDeleted { edited_by: Side::Ours })
            }
        }
        (Some(a), None, Some(t)) => {
            if t == a {
                (None, Verdict::Deleted(Remover::Ours))
            } else {
                (
                    theirs,
                    Verdict::EditedVsDeleted {
                        edited_by: Side::Theirs,
                    },
                )
            }
        }
    };

    Classification { value, verdict }
}
