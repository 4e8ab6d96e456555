//! Ordered, attribute-bearing tree documents.
//!
//! A [`Document`] is parsed with `quick-xml` into plain owned [`Element`]
//! values and written back with a deterministic serializer: double-quoted
//! attributes in stored order, two-space indentation, leaf text inline and
//! `<tag />` for empty elements. Parsing the output of [`Document::to_xml_string`]
//! yields an equal document.
//!
//! Whitespace-only text between child elements is formatting and is dropped.
//! Leaf text is kept exactly. Mixed content (significant text interleaved with
//! child elements) is kept exactly too: text before the first child lives in
//! the element's `text`, text after a child in that child's `tail`, and the
//! whole element is written on one line so no whitespace is introduced.

use std::path::Path;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::errors::DocumentError;

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

/// One element of a tree document.
#[derive(Debug, Clone, Default)]
pub struct Element {
    pub name: String,
    /// Attributes in document order.
    pub attributes: Vec<(String, String)>,
    /// Text content, `None` when the element has no significant text.
    /// With children present this is the text before the first child.
    pub text: Option<String>,
    pub children: Vec<Element>,
    /// Text between this element's end tag and the next sibling, only
    /// inside a mixed-content parent.
    pub tail: Option<String>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    /// Builder-style text setter.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing the value in place if it already exists.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    /// True when significant text is interleaved with child elements.
    pub fn has_mixed_content(&self) -> bool {
        !self.children.is_empty()
            && (self.text.is_some() || self.children.iter().any(|c| c.tail.is_some()))
    }

    /// First child with the given tag.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First descendant (depth-first, self excluded) whose `attr` equals `value`.
    pub fn find_by_attribute(&self, attr: &str, value: &str) -> Option<&Element> {
        for child in &self.children {
            if child.attribute(attr) == Some(value) {
                return Some(child);
            }
            if let Some(found) = child.find_by_attribute(attr, value) {
                return Some(found);
            }
        }
        None
    }

    /// Serialize this element alone, without declaration or trailing newline.
    pub fn to_xml_fragment(&self) -> String {
        let mut out = String::new();
        write_element(&mut out, self, 0);
        out.truncate(out.trim_end().len());
        out
    }
}

/// Equality ignores attribute order, matching how XML itself treats attributes.
impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.text == other.text
            && self.attributes.len() == other.attributes.len()
            && self
                .attributes
                .iter()
                .all(|(k, v)| other.attribute(k) == Some(v.as_str()))
            && self.children == other.children
            && self.tail == other.tail
    }
}

impl Eq for Element {}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A parsed tree document: optional XML declaration plus one root element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// The `<?xml ...?>` declaration exactly as it appeared, if any.
    pub declaration: Option<String>,
    pub root: Element,
}

impl Document {
    pub fn new(root: Element) -> Self {
        Self {
            declaration: Some(r#"<?xml version="1.0" encoding="utf-8"?>"#.to_string()),
            root,
        }
    }

    /// An empty document whose root has the same tag as `like`.
    ///
    /// Stands in for the ancestor of a file added on both sides.
    pub fn empty_like(like: &Document) -> Self {
        Self {
            declaration: like.declaration.clone(),
            root: Element::new(like.root.name.clone()),
        }
    }

    /// Parse a document from a string.
    pub fn parse(input: &str) -> Result<Self, DocumentError> {
        let declaration = input.trim_start().strip_prefix("<?xml").and_then(|rest| {
            rest.find("?>")
                .map(|end| format!("<?xml{}", &rest[..end + 2]))
        });

        let mut reader = Reader::from_str(input);
        let mut stack: Vec<PendingElement> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event().map_err(|e| DocumentError::Malformed {
                position: reader.buffer_position(),
                detail: e.to_string(),
            })?;
            match event {
                Event::Start(start) => {
                    if root.is_some() && stack.is_empty() {
                        return Err(malformed(&reader, "more than one root element"));
                    }
                    stack.push(PendingElement::new(element_from_start(&reader, &start)?));
                }
                Event::Empty(start) => {
                    let element = element_from_start(&reader, &start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.element.children.push(element),
                        None if root.is_none() => root = Some(element),
                        None => return Err(malformed(&reader, "more than one root element")),
                    }
                }
                Event::End(end) => {
                    let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                    let pending = stack
                        .pop()
                        .ok_or_else(|| malformed(&reader, &format!("unexpected </{name}>")))?;
                    if pending.element.name != name {
                        return Err(malformed(
                            &reader,
                            &format!("expected </{}>, found </{name}>", pending.element.name),
                        ));
                    }
                    let element = pending.finish();
                    match stack.last_mut() {
                        Some(parent) => parent.element.children.push(element),
                        None => root = Some(element),
                    }
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(|e| DocumentError::Malformed {
                        position: reader.buffer_position(),
                        detail: e.to_string(),
                    })?;
                    match stack.last_mut() {
                        Some(current) => current.push_text(&text),
                        None if text.trim().is_empty() => {}
                        None => return Err(malformed(&reader, "text outside the root element")),
                    }
                }
                Event::CData(data) => {
                    let data = data.into_inner();
                    if let Some(current) = stack.last_mut() {
                        current.push_text(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => break,
                // Declarations, comments, processing instructions and doctypes
                // carry no mergeable content.
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(DocumentError::Unclosed(open.element.name.clone()));
        }
        let root = root.ok_or(DocumentError::NoRoot)?;
        Ok(Self { declaration, root })
    }

    /// Read and parse a document from disk.
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Serialize the document deterministically.
    pub fn to_xml_string(&self) -> String {
        let mut out = String::new();
        if let Some(decl) = &self.declaration {
            out.push_str(decl);
            out.push('\n');
        }
        write_element(&mut out, &self.root, 0);
        out
    }

    /// Serialize and write the document to disk.
    pub fn save(&self, path: &Path) -> Result<(), DocumentError> {
        std::fs::write(path, self.to_xml_string())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

struct PendingElement {
    element: Element,
    text: String,
}

impl PendingElement {
    fn new(element: Element) -> Self {
        Self {
            element,
            text: String::new(),
        }
    }

    /// Text before the first child accumulates in `text`; later text is the
    /// tail of the most recent child.
    fn push_text(&mut self, text: &str) {
        match self.element.children.last_mut() {
            Some(child) => child.tail.get_or_insert_with(String::new).push_str(text),
            None => self.text.push_str(text),
        }
    }

    fn finish(mut self) -> Element {
        let significant = |text: &str| !text.trim().is_empty();
        let mixed = significant(&self.text)
            || self
                .element
                .children
                .iter()
                .any(|c| c.tail.as_deref().is_some_and(significant));

        if self.element.children.is_empty() || mixed {
            if !self.text.is_empty() {
                self.element.text = Some(self.text);
            }
        } else {
            for child in &mut self.element.children {
                child.tail = None;
            }
        }
        self.element
    }
}

fn element_from_start(
    reader: &Reader<&[u8]>,
    start: &BytesStart<'_>,
) -> Result<Element, DocumentError> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(|e| DocumentError::Malformed {
            position: reader.buffer_position(),
            detail: e.to_string(),
        })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| DocumentError::Malformed {
                position: reader.buffer_position(),
                detail: e.to_string(),
            })?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn malformed(reader: &Reader<&[u8]>, detail: &str) -> DocumentError {
    DocumentError::Malformed {
        position: reader.buffer_position(),
        detail: detail.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

fn write_element(out: &mut String, element: &Element, depth: usize) {
    let indent = "  ".repeat(depth);
    out.push_str(&indent);
    if element.children.is_empty() || element.has_mixed_content() {
        write_inline(out, element);
        out.push('\n');
        return;
    }

    write_start_tag(out, element);
    out.push_str(">\n");
    for child in &element.children {
        write_element(out, child, depth + 1);
    }
    out.push_str(&indent);
    write_end_tag(out, element);
    out.push('\n');
}

/// Write `element` and its subtree on one line, text and tails exactly.
fn write_inline(out: &mut String, element: &Element) {
    write_start_tag(out, element);
    if element.text.is_none() && element.children.is_empty() {
        out.push_str(" />");
        return;
    }
    out.push('>');
    if let Some(text) = &element.text {
        out.push_str(&escape(text.as_str()));
    }
    for child in &element.children {
        write_inline(out, child);
        if let Some(tail) = &child.tail {
            out.push_str(&escape(tail.as_str()));
        }
    }
    write_end_tag(out, element);
}

fn write_start_tag(out: &mut String, element: &Element) {
    out.push('<');
    out.push_str(&element.name);
    for (key, value) in &element.attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape(value.as_str()));
        out.push('"');
    }
}

fn write_end_tag(out: &mut String, element: &Element) {
    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<languageproject version="7000037">
  <rt class="LexEntry" guid="oldie">
    <Gloss>
      <AUni ws="en">dog</AUni>
      <AUni ws="es">perro</AUni>
    </Gloss>
  </rt>
  <rt class="LexSense" guid="sense1" ownerguid="oldie" />
</languageproject>
"#;

    #[test]
    fn test_parse_structure() {
        let doc = Document::parse(SAMPLE).unwrap();
        assert_eq!(
            doc.declaration.as_deref(),
            Some(r#"<?xml version="1.0" encoding="utf-8"?>"#)
        );
        assert_eq!(doc.root.name, "languageproject");
        assert_eq!(doc.root.attribute("version"), Some("7000037"));
        assert_eq!(doc.root.children.len(), 2);
        assert!(doc.root.text.is_none());

        let entry = &doc.root.children[0];
        assert_eq!(entry.attribute("guid"), Some("oldie"));
        let gloss = entry.child("Gloss").unwrap();
        assert_eq!(gloss.children[1].text.as_deref(), Some("perro"));

        let sense = doc.root.find_by_attribute("guid", "sense1").unwrap();
        assert_eq!(sense.attribute("ownerguid"), Some("oldie"));
    }

    #[test]
    fn test_write_is_stable() {
        let doc = Document::parse(SAMPLE).unwrap();
        let written = doc.to_xml_string();
        assert_eq!(written, SAMPLE);
        let reparsed = Document::parse(&written).unwrap();
        assert_eq!(reparsed, doc);
    }

    #[test]
    fn test_escaping() {
        let root = Element::new("range")
            .with_attribute("id", "a<b & \"c\"")
            .with_child(Element::new("label").with_text("x < y & z"));
        let doc = Document::new(root);
        let written = doc.to_xml_string();
        assert!(written.contains("&lt;"));
        let reparsed = Document::parse(&written).unwrap();
        assert_eq!(reparsed.root.attribute("id"), Some("a<b & \"c\""));
        assert_eq!(
            reparsed.root.children[0].text.as_deref(),
            Some("x < y & z")
        );
    }

    #[test]
    fn test_attribute_order_ignored_by_equality() {
        let a = Element::new("rt").with_attribute("a", "1").with_attribute("b", "2");
        let b = Element::new("rt").with_attribute("b", "2").with_attribute("a", "1");
        assert_eq!(a, b);
        let c = Element::new("rt").with_attribute("a", "1");
        assert_ne!(a, c);
    }

    #[test]
    fn test_leaf_text_preserved_exactly() {
        let doc = Document::parse("<r><t>  spaced  </t></r>").unwrap();
        assert_eq!(doc.root.children[0].text.as_deref(), Some("  spaced  "));
        assert!(doc.declaration.is_none());
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(matches!(
            Document::parse("<a><b></a>"),
            Err(DocumentError::Malformed { .. })
        ));
        assert!(Document::parse("<a><b></b>").is_err());
        assert!(matches!(Document::parse(""), Err(DocumentError::NoRoot)));
        assert!(Document::parse("<a/><b/>").is_err());
    }

    #[test]
    fn test_set_attribute_replaces_in_place() {
        let mut el = Element::new("rt").with_attribute("guid", "g1");
        el.set_attribute("guid", "g2");
        el.set_attribute("ownerguid", "o1");
        assert_eq!(el.attributes.len(), 2);
        assert_eq!(el.attributes[0], ("guid".to_string(), "g2".to_string()));
        assert_eq!(el.attribute("ownerguid"), Some("o1"));
    }

    #[test]
    fn test_mixed_content_round_trips_exactly() {
        let input = concat!(
            "<range id=\"r1\">\n",
            "  <text>foo <span lang=\"fr\">bar</span> baz</text>\n",
            "</range>\n",
        );
        let doc = Document::parse(input).unwrap();
        let text = doc.root.child("text").unwrap();
        assert!(text.has_mixed_content());
        assert_eq!(text.text.as_deref(), Some("foo "));
        assert_eq!(text.children[0].text.as_deref(), Some("bar"));
        assert_eq!(text.children[0].tail.as_deref(), Some(" baz"));
        assert!(!doc.root.has_mixed_content());

        assert_eq!(doc.to_xml_string(), input);
        assert_eq!(Document::parse(&doc.to_xml_string()).unwrap(), doc);
    }

    #[test]
    fn test_formatting_whitespace_between_children_is_dropped() {
        let doc = Document::parse("<r>\n  <a />\n  <b>x</b>\n</r>").unwrap();
        assert!(doc.root.text.is_none());
        assert!(doc.root.children.iter().all(|c| c.tail.is_none()));
        assert_eq!(doc.to_xml_string(), "<r>\n  <a />\n  <b>x</b>\n</r>\n");
    }

    #[test]
    fn test_empty_like_keeps_root_tag() {
        let doc = Document::parse(SAMPLE).unwrap();
        let empty = Document::empty_like(&doc);
        assert_eq!(empty.root.name, "languageproject");
        assert!(empty.root.children.is_empty());
        assert!(empty.root.attributes.is_empty());
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.fwdata");
        let doc = Document::parse(SAMPLE).unwrap();
        doc.save(&path).unwrap();
        assert_eq!(Document::load(&path).unwrap(), doc);
    }
}
