//! Matching child elements across ancestor, ours and theirs.
//!
//! Elements are matched by semantic identity, an [`ElementKey`], rather than
//! by position. The key comes from the first identifying attribute found on
//! the element: a per-tag declared key if the [`IdentityConfig`] has one,
//! otherwise the first present attribute from an ordered candidate list
//! (`guid`, `id`, `ws` by default). Elements without any identifying
//! attribute fall back to their position among same-tag unkeyed siblings.
//!
//! Matching is a pure function of the three child lists, so re-running a
//! merge never produces different triples.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::xml::Element;

// ---------------------------------------------------------------------------
// Identity configuration
// ---------------------------------------------------------------------------

/// Per-format rules for identifying elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    /// Attribute names tried in order on tags without a declared key.
    pub key_candidates: Vec<String>,
    /// Declared key attribute per tag.
    pub keyed: BTreeMap<String, String>,
    /// Tags merged as one indivisible value.
    pub atomic: BTreeSet<String>,
    /// Child tags that make their parent atomic when every child of the
    /// parent carries one of them, e.g. `objsur` reference containers.
    pub atomic_containers: BTreeSet<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_candidates: vec!["guid".into(), "id".into(), "ws".into()],
            keyed: BTreeMap::new(),
            atomic: BTreeSet::new(),
            atomic_containers: BTreeSet::new(),
        }
    }
}

impl IdentityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ordered candidate list.
    pub fn with_candidates<I, S>(mut self, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_candidates = candidates.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the identifying attribute for a tag.
    pub fn with_key(mut self, tag: impl Into<String>, attribute: impl Into<String>) -> Self {
        self.keyed.insert(tag.into(), attribute.into());
        self
    }

    /// Mark a tag as atomic.
    pub fn with_atomic(mut self, tag: impl Into<String>) -> Self {
        self.atomic.insert(tag.into());
        self
    }

    /// Treat any element whose children are all `child_tag` as atomic.
    pub fn with_atomic_container(mut self, child_tag: impl Into<String>) -> Self {
        self.atomic_containers.insert(child_tag.into());
        self
    }

    pub fn is_atomic(&self, tag: &str) -> bool {
        self.atomic.contains(tag)
    }

    /// Whether `element` is merged as one value rather than recursed into:
    /// an atomic tag, a container of atomic-container children only, or
    /// mixed content.
    pub fn merges_whole(&self, element: &Element) -> bool {
        if self.is_atomic(&element.name) || element.has_mixed_content() {
            return true;
        }
        !element.children.is_empty()
            && element
                .children
                .iter()
                .all(|c| self.atomic_containers.contains(&c.name))
    }

    /// The identifying attribute name and value of `element`, if it has one.
    pub fn identity_of<'e>(&self, element: &'e Element) -> Option<(&str, &'e str)> {
        if let Some(attr) = self.keyed.get(&element.name) {
            if let Some(value) = element.attribute(attr) {
                return Some((attr.as_str(), value));
            }
        }
        self.key_candidates
            .iter()
            .find_map(|attr| element.attribute(attr).map(|v| (attr.as_str(), v)))
    }
}

// ---------------------------------------------------------------------------
// Keys and triples
// ---------------------------------------------------------------------------

/// Semantic identity of a child element under its parent.
///
/// `ordinal` disambiguates siblings that would otherwise share a key, so no
/// two siblings under one parent ever have the same `ElementKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementKey {
    pub tag: String,
    pub attribute: Option<String>,
    pub value: String,
    pub ordinal: usize,
}

impl ElementKey {
    /// Path segment for reports: `rt[@guid='x']`, `Gloss`, or `Run[2]`.
    pub fn path_segment(&self) -> String {
        let mut segment = self.tag.clone();
        if let Some(attr) = &self.attribute {
            segment.push_str(&format!("[@{attr}='{}']", self.value));
        }
        if self.ordinal > 0 {
            segment.push_str(&format!("[{}]", self.ordinal + 1));
        }
        segment
    }
}

/// One logical element as seen in the three versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedTriple<'a> {
    pub key: ElementKey,
    pub ancestor: Option<&'a Element>,
    pub ours: Option<&'a Element>,
    pub theirs: Option<&'a Element>,
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Stateless matcher bound to one identity configuration.
pub struct ElementMatcher<'c> {
    identity: &'c IdentityConfig,
}

impl<'c> ElementMatcher<'c> {
    pub fn new(identity: &'c IdentityConfig) -> Self {
        Self { identity }
    }

    /// Compute the key of every element in a child list, in order.
    pub fn keys<'a>(&self, children: &'a [Element]) -> Vec<(ElementKey, &'a Element)> {
        let mut seen: HashMap<(String, Option<String>, String), usize> = HashMap::new();
        children
            .iter()
            .map(|child| {
                let (attribute, value) = match self.identity.identity_of(child) {
                    Some((attr, value)) => (Some(attr.to_string()), value.to_string()),
                    None => (None, String::new()),
                };
                let slot = seen
                    .entry((child.name.clone(), attribute.clone(), value.clone()))
                    .or_insert(0);
                let ordinal = *slot;
                *slot += 1;
                let key = ElementKey {
                    tag: child.name.clone(),
                    attribute,
                    value,
                    ordinal,
                };
                (key, child)
            })
            .collect()
    }

    /// Match three child lists into triples.
    ///
    /// Every element present in at least one list appears in exactly one
    /// triple. Order: ours order first, then theirs-only elements in theirs
    /// order, then ancestor-only elements in ancestor order.
    pub fn match_children<'a>(
        &self,
        ancestor: &'a [Element],
        ours: &'a [Element],
        theirs: &'a [Element],
    ) -> Vec<MatchedTriple<'a>> {
        let ancestor_keys = self.keys(ancestor);
        let ours_keys = self.keys(ours);
        let theirs_keys = self.keys(theirs);

        let ancestor_map: HashMap<&ElementKey, &Element> =
            ancestor_keys.iter().map(|(k, e)| (k, *e)).collect();
        let ours_map: HashMap<&ElementKey, &Element> =
            ours_keys.iter().map(|(k, e)| (k, *e)).collect();
        let theirs_map: HashMap<&ElementKey, &Element> =
            theirs_keys.iter().map(|(k, e)| (k, *e)).collect();

        let mut triples = Vec::with_capacity(ours_keys.len().max(theirs_keys.len()));
        for (key, element) in &ours_keys {
            triples.push(MatchedTriple {
                key: key.clone(),
                ancestor: ancestor_map.get(key).copied(),
                ours: Some(*element),
                theirs: theirs_map.get(key).copied(),
            });
        }
        for (key, element) in &theirs_keys {
            if ours_map.contains_key(key) {
                continue;
            }
            triples.push(MatchedTriple {
                key: key.clone(),
                ancestor: ancestor_map.get(key).copied(),
                ours: None,
                theirs: Some(*element),
            });
        }
        for (key, element) in &ancestor_keys {
            if ours_map.contains_key(key) || theirs_map.contains_key(key) {
                continue;
            }
            triples.push(MatchedTriple {
                key: key.clone(),
                ancestor: Some(*element),
                ours: None,
                theirs: None,
            });
        }
        triples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt(guid: &str) -> Element {
        Element::new("rt").with_attribute("guid", guid)
    }

    #[test]
    fn test_matches_by_identity_despite_reordering() {
        let identity = IdentityConfig::new();
        let matcher = ElementMatcher::new(&identity);
        let ancestor = vec![rt("a"), rt("b")];
        let ours = vec![rt("b"), rt("a")];
        let theirs = vec![rt("a"), rt("b")];

        let triples = matcher.match_children(&ancestor, &ours, &theirs);
        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0].key.value, "b");
        for t in &triples {
            assert!(t.ancestor.is_some() && t.ours.is_some() && t.theirs.is_some());
            assert_eq!(t.ours, t.theirs);
        }
    }

    #[test]
    fn test_unmatched_slots_are_absent() {
        let identity = IdentityConfig::new();
        let matcher = ElementMatcher::new(&identity);
        let ancestor = vec![rt("old"), rt("gone")];
        let ours = vec![rt("old"), rt("mine")];
        let theirs = vec![rt("old"), rt("yours")];

        let triples = matcher.match_children(&ancestor, &ours, &theirs);
        let keys: Vec<&str> = triples.iter().map(|t| t.key.value.as_str()).collect();
        assert_eq!(keys, vec!["old", "mine", "yours", "gone"]);

        assert!(triples[1].ancestor.is_none() && triples[1].theirs.is_none());
        assert!(triples[2].ours.is_none());
        assert!(triples[3].ours.is_none() && triples[3].theirs.is_none());
    }

    #[test]
    fn test_candidate_order_and_declared_keys() {
        let identity = IdentityConfig::new().with_key("CustomField", "name");
        let both = Element::new("x").with_attribute("id", "i").with_attribute("guid", "g");
        assert_eq!(identity.identity_of(&both), Some(("guid", "g")));

        let field = Element::new("CustomField")
            .with_attribute("name", "Color")
            .with_attribute("id", "7");
        assert_eq!(identity.identity_of(&field), Some(("name", "Color")));

        let alt = Element::new("AUni").with_attribute("ws", "en");
        assert_eq!(identity.identity_of(&alt), Some(("ws", "en")));
        assert_eq!(identity.identity_of(&Element::new("Run")), None);
    }

    #[test]
    fn test_merges_whole_rules() {
        let identity = IdentityConfig::new()
            .with_atomic("AStr")
            .with_atomic_container("objsur");
        let objsur = |guid: &str| {
            Element::new("objsur")
                .with_attribute("t", "r")
                .with_attribute("guid", guid)
        };

        assert!(identity.merges_whole(&Element::new("AStr").with_attribute("ws", "en")));
        let refs = Element::new("Analyses")
            .with_child(objsur("a"))
            .with_child(objsur("b"));
        assert!(identity.merges_whole(&refs));
        let partial = Element::new("Analyses")
            .with_child(objsur("a"))
            .with_child(rt("x"));
        assert!(!identity.merges_whole(&partial));
        assert!(!identity.merges_whole(&Element::new("Analyses")));

        let mut span = Element::new("span").with_text("bar");
        span.tail = Some(" baz".into());
        let mixed = Element::new("text").with_text("foo ").with_child(span);
        assert!(identity.merges_whole(&mixed));
        assert!(!identity.merges_whole(&rt("plain").with_child(rt("child"))));
    }

    #[test]
    fn test_positional_fallback_and_duplicate_keys() {
        let identity = IdentityConfig::new();
        let matcher = ElementMatcher::new(&identity);
        let children = vec![
            Element::new("Run").with_text("one"),
            Element::new("Run").with_text("two"),
            rt("dup"),
            rt("dup"),
        ];
        let keys = matcher.keys(&children);
        assert_eq!(keys[0].0.ordinal, 0);
        assert_eq!(keys[1].0.ordinal, 1);
        assert_eq!(keys[1].0.path_segment(), "Run[2]");
        assert_eq!(keys[2].0.path_segment(), "rt[@guid='dup']");
        assert_eq!(keys[3].0.path_segment(), "rt[@guid='dup'][2]");

        let unique: std::collections::HashSet<_> = keys.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_matching_is_deterministic() {
        let identity = IdentityConfig::new();
        let matcher = ElementMatcher::new(&identity);
        let ancestor = vec![rt("a")];
        let ours = vec![rt("a"), rt("c")];
        let theirs = vec![rt("d"), rt("a")];
        let first = matcher.match_children(&ancestor, &ours, &theirs);
        let second = matcher.match_children(&ancestor, &ours, &theirs);
        assert_eq!(first, second);
    }
}
