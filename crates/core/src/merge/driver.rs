//! The recursive three-way tree merge.
//!
//! [`MergeDriver::merge`] walks the three documents from the root. At each
//! element it classifies attributes and text, matches children with the
//! [`ElementMatcher`] and either recurses into children present on both
//! sides or classifies them as whole elements. The result is derived from
//! ours: ours' sibling order is kept, and elements only theirs has are
//! placed next to the neighbours they had in theirs.
//!
//! Atomic elements, reference containers and mixed content are classified
//! as single values and never recursed into, so interleaved text is never
//! reassembled from pieces of different versions.
//!
//! Structural divergence never fails a merge. Every divergence becomes a
//! report and the output is always fully resolved.

use tracing::{debug, info};

use super::classifier::{classify, Remover, ValueLevel, Verdict};
use super::matcher::{ElementKey, ElementMatcher, IdentityConfig, MatchedTriple};
use super::report::{ChangeKind, ChangeReport, ConflictReport, MergeReports, ReportSink};
use super::situation::{MergeSituation, Side};
use crate::xml::{Document, Element};

/// The output of one merge session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub document: Document,
    pub changes: Vec<ChangeReport>,
    pub conflicts: Vec<ConflictReport>,
}

impl MergeResult {
    /// Hand every report to `sink`, changes first, each in encounter order.
    pub fn report_to(&self, sink: &mut dyn ReportSink) {
        for change in &self.changes {
            sink.change_occurred(change.clone());
        }
        for conflict in &self.conflicts {
            sink.conflict_occurred(conflict.clone());
        }
    }
}

/// Ancestor, ours and theirs versions of one element.
type Versions<'e> = (Option<&'e Element>, Option<&'e Element>, Option<&'e Element>);

/// One merge session.
pub struct MergeDriver<'c> {
    identity: &'c IdentityConfig,
    situation: &'c MergeSituation,
    reports: MergeReports,
}

impl<'c> MergeDriver<'c> {
    /// Merge `ours` and `theirs` against their common `ancestor`.
    pub fn merge(
        ancestor: &Document,
        ours: &Document,
        theirs: &Document,
        identity: &IdentityConfig,
        situation: &MergeSituation,
    ) -> MergeResult {
        info!(
            root = %ours.root.name,
            alpha = %situation.alpha_user_id,
            beta = %situation.beta_user_id,
            mode = %situation.mode,
            "merging tree documents"
        );

        let mut driver = MergeDriver {
            identity,
            situation,
            reports: MergeReports::new(),
        };
        let path = ours.root.name.clone();
        let roots = (Some(&ancestor.root), Some(&ours.root), Some(&theirs.root));
        let root = if driver.merges_whole(roots) {
            driver
                .classify_element(&path, roots)
                .unwrap_or_else(|| ours.root.clone())
        } else {
            driver.merge_element(&path, Some(&ancestor.root), &ours.root, &theirs.root)
        };

        info!(
            changes = driver.reports.changes.len(),
            conflicts = driver.reports.conflicts.len(),
            "tree merge complete"
        );

        MergeResult {
            document: Document {
                declaration: ours.declaration.clone(),
                root,
            },
            changes: driver.reports.changes,
            conflicts: driver.reports.conflicts,
        }
    }

    /// Merge an element present on both sides.
    fn merge_element(
        &mut self,
        path: &str,
        ancestor: Option<&Element>,
        ours: &Element,
        theirs: &Element,
    ) -> Element {
        let mode = self.situation.mode;
        let mut result = Element::new(ours.name.clone());

        // Attributes: ours order, then theirs-only, then ancestor-only.
        let mut names: Vec<&str> = Vec::new();
        let sources = [Some(ours), Some(theirs), ancestor];
        for element in sources.into_iter().flatten() {
            for (name, _) in &element.attributes {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        for name in names {
            let o = ours.attribute(name);
            let t = theirs.attribute(name);
            let c = classify(mode, ancestor.and_then(|a| a.attribute(name)), o, t);
            self.record(
                ValueLevel::Attribute,
                &format!("{path}/@{name}"),
                c.verdict,
                o,
                t,
                str::to_string,
            );
            if let Some(value) = c.value {
                result.attributes.push((name.to_string(), value.to_string()));
            }
        }

        let o = ours.text.as_deref();
        let t = theirs.text.as_deref();
        let c = classify(mode, ancestor.and_then(|a| a.text.as_deref()), o, t);
        self.record(
            ValueLevel::Text,
            &format!("{path}/text()"),
            c.verdict,
            o,
            t,
            str::to_string,
        );
        result.text = c.value.map(str::to_string);

        result.children = self.merge_children(path, ancestor, ours, theirs);
        result
    }

    fn merge_children(
        &mut self,
        path: &str,
        ancestor: Option<&Element>,
        ours: &Element,
        theirs: &Element,
    ) -> Vec<Element> {
        let matcher = ElementMatcher::new(self.identity);
        let ancestor_children = ancestor.map(|a| a.children.as_slice()).unwrap_or(&[]);
        let triples = matcher.match_children(ancestor_children, &ours.children, &theirs.children);

        let mut merged: Vec<(ElementKey, Element)> = Vec::with_capacity(ours.children.len());
        let mut theirs_only: Vec<(ElementKey, Element)> = Vec::new();
        for triple in &triples {
            let child_path = format!("{path}/{}", triple.key.path_segment());
            if let Some(element) = self.merge_child(&child_path, triple) {
                if triple.ours.is_some() {
                    merged.push((triple.key.clone(), element));
                } else {
                    theirs_only.push((triple.key.clone(), element));
                }
            }
        }

        if !theirs_only.is_empty() {
            let theirs_order: Vec<ElementKey> = matcher
                .keys(&theirs.children)
                .into_iter()
                .map(|(key, _)| key)
                .collect();
            for (key, element) in theirs_only {
                let at = insertion_point(&merged, &theirs_order, &key);
                merged.insert(at, (key, element));
            }
        }

        merged.into_iter().map(|(_, element)| element).collect()
    }

    /// Decide the fate of one matched child. `None` means it is not in the result.
    fn merge_child(&mut self, path: &str, triple: &MatchedTriple<'_>) -> Option<Element> {
        let MatchedTriple {
            ancestor,
            ours,
            theirs,
            ..
        } = *triple;

        if let (Some(o), Some(t)) = (ours, theirs) {
            if ancestor == Some(o) && o == t {
                return Some(o.clone());
            }
            if !self.merges_whole((ancestor, ours, theirs)) {
                if ancestor.is_none() && o == t {
                    self.record(
                        ValueLevel::Element,
                        path,
                        Verdict::Convergent(ChangeKind::Addition),
                        ours,
                        theirs,
                        Element::to_xml_fragment,
                    );
                    return Some(o.clone());
                }
                if ancestor == Some(o) {
                    return Some(t.clone());
                }
                if ancestor == Some(t) {
                    return Some(o.clone());
                }
                return Some(self.merge_element(path, ancestor, o, t));
            }
        }

        self.classify_element(path, (ancestor, ours, theirs))
    }

    /// Classify whole elements as single values.
    fn classify_element(
        &mut self,
        path: &str,
        (ancestor, ours, theirs): Versions<'_>,
    ) -> Option<Element> {
        let c = classify(self.situation.mode, ancestor, ours, theirs);
        self.record(
            ValueLevel::Element,
            path,
            c.verdict,
            ours,
            theirs,
            Element::to_xml_fragment,
        );
        c.value.cloned()
    }

    fn merges_whole(
        &self,
        (ancestor, ours, theirs): Versions<'_>,
    ) -> bool {
        [ancestor, ours, theirs]
            .into_iter()
            .flatten()
            .any(|element| self.identity.merges_whole(element))
    }

    /// Turn a verdict into at most one report.
    fn record<V: ?Sized>(
        &mut self,
        level: ValueLevel,
        path: &str,
        verdict: Verdict,
        ours: Option<&V>,
        theirs: Option<&V>,
        render: impl Fn(&V) -> String,
    ) {
        let conflict = (verdict.conflict_kind(level), verdict.conflict_winner());
        if let (Some(kind), Some(winner)) = conflict {
            let value_of = |side: Side| {
                match side {
                    Side::Ours => ours,
                    Side::Theirs => theirs,
                }
                .map(&render)
                .unwrap_or_default()
            };
            let report = ConflictReport::new(
                kind,
                path,
                value_of(winner),
                value_of(winner.other()),
                winner,
                self.situation,
            );
            debug!(path, kind = %report.kind, winner = %winner, "conflict resolved by policy");
            self.reports.conflict_occurred(report);
        } else if let Some(kind) = verdict.change_kind() {
            let description = self.describe(level, verdict);
            debug!(path, kind = %kind, "change accepted");
            self.reports
                .change_occurred(ChangeReport::new(kind, path, description));
        }
    }

    fn describe(&self, level: ValueLevel, verdict: Verdict) -> String {
        let subject = match level {
            ValueLevel::Attribute => "attribute",
            ValueLevel::Text => "text",
            ValueLevel::Element => "element",
        };
        let alpha = &self.situation.alpha_user_id;
        let beta = &self.situation.beta_user_id;
        let user = |side: Side| self.situation.party(side).0;
        match verdict {
            Verdict::Convergent(ChangeKind::Addition) => {
                format!("{alpha} and {beta} both added the same {subject}")
            }
            Verdict::Convergent(_) => {
                format!("{alpha} and {beta} both changed the {subject} the same way")
            }
            Verdict::Added(side) => format!("{} added the {subject}", user(side)),
            Verdict::Deleted(Remover::Ours) => format!("{alpha} removed the {subject}"),
            Verdict::Deleted(Remover::Theirs) => format!("{beta} removed the {subject}"),
            Verdict::Deleted(Remover::Both) => {
                format!("{alpha} and {beta} both removed the {subject}")
            }
            _ => String::new(),
        }
    }
}

/// Where a theirs-only element goes in the ours-ordered result: after the
/// nearest preceding theirs sibling already placed, else before the nearest
/// following one, else at the end.
fn insertion_point(
    merged: &[(ElementKey, Element)],
    theirs_order: &[ElementKey],
    key: &ElementKey,
) -> usize {
    let position_of = |wanted: &ElementKey| merged.iter().position(|(k, _)| k == wanted);
    let Some(idx) = theirs_order.iter().position(|k| k == key) else {
        return merged.len();
    };
    if let Some(pos) = theirs_order[..idx].iter().rev().find_map(position_of) {
        return pos + 1;
    }
    if let Some(pos) = theirs_order[idx + 1..].iter().find_map(position_of) {
        return pos;
    }
    merged.len()
}
