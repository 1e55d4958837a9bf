//! Typed markup tree for XHTML content documents.
//!
//! Text and attribute values are stored raw (still entity-escaped) so a
//! parse followed by a serialize never rewrites content it did not touch.
//! The strict parser rejects malformed input; the lenient parser goes
//! through an HTML5 tree builder and never fails.

use crate::error::MarkupError;
use log::debug;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;

/// Opening `<body>` tag of a content document.
static BODY_START_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<body(?:\s[^>]*)?>").expect("Invalid BODY_START_REGEX"));

/// Closing `</body>` tag of a content document.
static BODY_END_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</body\s*>").expect("Invalid BODY_END_REGEX"));

/// Matches an entity or character reference in raw text.
static ENTITY_REF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&([^;&<\s]*);").expect("Invalid ENTITY_REF_REGEX"));

static CHAR_REF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#(?:[0-9]+|x[0-9a-fA-F]+)$").expect("Invalid CHAR_REF_REGEX"));

/// Entities XML defines without a DTD.
const XML_ENTITIES: &[&str] = &["amp", "lt", "gt", "quot", "apos"];

static BODY_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("Invalid BODY_SELECTOR"));

/// HTML elements that never have content.
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Child-index path from a root element down to a node.
pub type NodePath = Vec<usize>;

/// A node in the markup tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    /// Raw text, entity references left as written.
    Text(String),
    /// Comments, CDATA sections and processing instructions, kept verbatim.
    Verbatim(String),
}

/// An element with its attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Tag name as written.
    pub name: String,
    /// Attributes in source order; keys are unique.
    pub attrs: Vec<(String, String)>,
    /// Child nodes in source order.
    pub children: Vec<Node>,
    /// Whether the element was written as `<name/>`.
    pub self_closing: bool,
}

impl Element {
    /// Creates an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
            self_closing: false,
        }
    }

    /// Returns true if the tag name is `name`, ignoring ASCII case.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Same tag name and the same set of attribute pairs.
    pub fn same_shape(&self, other: &Element) -> bool {
        if self.name != other.name || self.attrs.len() != other.attrs.len() {
            return false;
        }
        let mut ours: Vec<&(String, String)> = self.attrs.iter().collect();
        let mut theirs: Vec<&(String, String)> = other.attrs.iter().collect();
        ours.sort();
        theirs.sort();
        ours == theirs
    }

    /// Discards the current children and installs `children` in their place.
    pub fn replace_children(&mut self, children: Vec<Node>) {
        self.children = children;
    }

    /// Serializes the element including its own tag.
    pub fn outer_markup(&self) -> String {
        let mut out = String::new();
        self.write_outer(&mut out);
        out
    }

    /// Serializes only the children.
    pub fn inner_markup(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            child.write(&mut out);
        }
        out
    }

    fn write_outer(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            // Raw values may contain a literal double quote if the source used single quotes
            let quote = if value.contains('"') { '\'' } else { '"' };
            out.push('=');
            out.push(quote);
            out.push_str(value);
            out.push(quote);
        }
        if self.self_closing && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            child.write(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Concatenated raw text of all descendant text nodes.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out
    }

    /// Follows `path` from this element to a descendant element.
    pub fn element_at(&self, path: &[usize]) -> Option<&Element> {
        let mut current = self;
        for &index in path {
            match current.children.get(index)? {
                Node::Element(el) => current = el,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Mutable variant of [`Element::element_at`].
    pub fn element_at_mut(&mut self, path: &[usize]) -> Option<&mut Element> {
        let mut current = self;
        for &index in path {
            match current.children.get_mut(index)? {
                Node::Element(el) => current = el,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Returns the raw content of the text node at `path`.
    pub fn text_at_mut(&mut self, path: &[usize]) -> Option<&mut String> {
        let (last, parent) = path.split_last()?;
        match self.element_at_mut(parent)?.children.get_mut(*last)? {
            Node::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl Node {
    fn write(&self, out: &mut String) {
        match self {
            Node::Element(el) => el.write_outer(out),
            Node::Text(text) | Node::Verbatim(text) => out.push_str(text),
        }
    }
}

fn collect_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Element(el) => collect_text(&el.children, out),
            Node::Text(text) => out.push_str(text),
            Node::Verbatim(_) => {}
        }
    }
}

/// Returns true if the text has no visible characters.
pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

/// Returns the single top-level element of a fragment.
///
/// Whitespace and comments around the element are allowed; any other
/// top-level text or a second element means there is no sole element.
pub fn sole_element(nodes: Vec<Node>) -> Option<Element> {
    let mut found = None;
    for node in nodes {
        match node {
            Node::Element(el) => {
                if found.is_some() {
                    return None;
                }
                found = Some(el);
            }
            Node::Text(text) if is_blank(&text) => {}
            Node::Text(_) => return None,
            Node::Verbatim(_) => {}
        }
    }
    found
}

/// Escapes text for use as raw text node content.
pub fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Escapes text for use as a raw attribute value.
pub fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('"', "&quot;")
}

fn references_are_xml(raw: &str) -> bool {
    ENTITY_REF_REGEX.captures_iter(raw).all(|caps| {
        let name = &caps[1];
        XML_ENTITIES.contains(&name) || CHAR_REF_REGEX.is_match(name)
    })
}

/// Returns true if a text node or attribute value under `nodes` uses an
/// entity XML does not predefine, such as `&nbsp;`.
pub fn has_html_entities(nodes: &[Node]) -> bool {
    nodes.iter().any(|node| match node {
        Node::Text(text) => !references_are_xml(text),
        Node::Element(el) => {
            el.attrs.iter().any(|(_, value)| !references_are_xml(value))
                || has_html_entities(&el.children)
        }
        Node::Verbatim(_) => false,
    })
}

/// Parses markup from an untrusted source into nodes that serialize as
/// well-formed XML.
///
/// Input that is malformed, or that uses HTML named entities, goes through
/// the lenient parser, which decodes every entity to its character.
pub fn parse_untrusted(markup: &str) -> Vec<Node> {
    match parse_fragment(markup) {
        Ok(nodes) if !has_html_entities(&nodes) => nodes,
        Ok(_) => {
            debug!("fragment uses HTML entities, decoding with lenient parser");
            parse_fragment_lenient(markup)
        }
        Err(e) => {
            debug!("strict parse failed ({}), trying lenient", e);
            parse_fragment_lenient(markup)
        }
    }
}

/// Parses a well-formed markup fragment.
pub fn parse_fragment(markup: &str) -> Result<Vec<Node>, MarkupError> {
    let mut reader = Reader::from_str(markup);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();
    let mut roots: Vec<Node> = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| MarkupError::Malformed {
            position: reader.buffer_position() as u64,
            message: e.to_string(),
        })?;

        match event {
            Event::Start(e) => stack.push(element_from_start(&e, false, &reader)?),
            Event::Empty(e) => {
                let el = element_from_start(&e, true, &reader)?;
                push_node(&mut stack, &mut roots, Node::Element(el));
            }
            Event::End(e) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| MarkupError::UnexpectedEnd(lossy(e.name().as_ref())))?;
                push_node(&mut stack, &mut roots, Node::Element(el));
            }
            Event::Text(e) => push_text(&mut stack, &mut roots, &lossy(&e)),
            Event::GeneralRef(e) => {
                push_text(&mut stack, &mut roots, &format!("&{};", lossy(&e)));
            }
            Event::CData(e) => {
                let raw = format!("<![CDATA[{}]]>", lossy(&e));
                push_node(&mut stack, &mut roots, Node::Verbatim(raw));
            }
            Event::Comment(e) => {
                let raw = format!("<!--{}-->", lossy(&e));
                push_node(&mut stack, &mut roots, Node::Verbatim(raw));
            }
            Event::PI(e) => {
                let raw = format!("<?{}?>", lossy(&e));
                push_node(&mut stack, &mut roots, Node::Verbatim(raw));
            }
            Event::Decl(e) => {
                let raw = format!("<?{}?>", lossy(&e));
                push_node(&mut stack, &mut roots, Node::Verbatim(raw));
            }
            Event::DocType(e) => {
                let raw = format!("<!DOCTYPE {}>", lossy(&e).trim());
                push_node(&mut stack, &mut roots, Node::Verbatim(raw));
            }
            Event::Eof => break,
        }
    }

    if let Some(open) = stack.pop() {
        return Err(MarkupError::Unclosed(open.name));
    }

    Ok(roots)
}

/// Parses a fragment with an HTML5 parser. Never fails.
///
/// Tag and attribute names come back lowercased, and table parts outside
/// a table are dropped by the tree builder, so this is only a fallback.
pub fn parse_fragment_lenient(markup: &str) -> Vec<Node> {
    let html = Html::parse_fragment(markup);
    convert_element(html.root_element()).children
}

fn element_from_start(
    start: &BytesStart<'_>,
    self_closing: bool,
    reader: &Reader<&[u8]>,
) -> Result<Element, MarkupError> {
    let mut el = Element::new(lossy(start.name().as_ref()));
    el.self_closing = self_closing;
    for attr in start.attributes() {
        let attr = attr.map_err(|e| MarkupError::Malformed {
            position: reader.buffer_position() as u64,
            message: e.to_string(),
        })?;
        el.attrs.push((lossy(attr.key.as_ref()), lossy(&attr.value)));
    }
    Ok(el)
}

fn push_node(stack: &mut [Element], roots: &mut Vec<Node>, node: Node) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => roots.push(node),
    }
}

/// Appends text, merging with a preceding text node.
fn push_text(stack: &mut [Element], roots: &mut Vec<Node>, text: &str) {
    if text.is_empty() {
        return;
    }
    let siblings = match stack.last_mut() {
        Some(parent) => &mut parent.children,
        None => roots,
    };
    if let Some(Node::Text(previous)) = siblings.last_mut() {
        previous.push_str(text);
    } else {
        siblings.push(Node::Text(text.to_string()));
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn convert_element(element: ElementRef<'_>) -> Element {
    let value = element.value();
    let mut el = Element::new(value.name());
    el.attrs = value
        .attrs()
        .map(|(key, val)| (key.to_string(), escape_attr(val)))
        .collect();
    el.self_closing = VOID_TAGS.contains(&value.name());

    for child in element.children() {
        match child.value() {
            scraper::Node::Text(text) => {
                let raw = escape_text(text);
                if let Some(Node::Text(previous)) = el.children.last_mut() {
                    previous.push_str(&raw);
                } else {
                    el.children.push(Node::Text(raw));
                }
            }
            scraper::Node::Comment(comment) => {
                el.children
                    .push(Node::Verbatim(format!("<!--{}-->", &**comment)));
            }
            scraper::Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    el.children.push(Node::Element(convert_element(child_el)));
                }
            }
            _ => {}
        }
    }

    el
}

/// A content document split into verbatim prologue, parsed body, and
/// verbatim epilogue.
#[derive(Debug, Clone)]
pub struct MarkupDocument {
    prologue: String,
    body: Element,
    epilogue: String,
    lenient: bool,
}

impl MarkupDocument {
    /// Parses a document strictly. The body must be well-formed.
    pub fn parse(raw: &str) -> Result<Self, MarkupError> {
        let (start, end) = locate_body(raw)?;
        let nodes = parse_fragment(&raw[start..end])?;
        let body = sole_element(nodes)
            .filter(|el| el.is("body"))
            .ok_or(MarkupError::MissingBody)?;

        Ok(Self {
            prologue: raw[..start].to_string(),
            body,
            epilogue: raw[end..].to_string(),
            lenient: false,
        })
    }

    /// Parses a document with the HTML5 parser.
    ///
    /// Only fails when no body element can be located in the raw text.
    pub fn parse_lenient(raw: &str) -> Result<Self, MarkupError> {
        let (start, end) = locate_body(raw)?;
        let html = Html::parse_document(raw);
        let body = html
            .select(&BODY_SELECTOR)
            .next()
            .map(convert_element)
            .ok_or(MarkupError::MissingBody)?;

        Ok(Self {
            prologue: raw[..start].to_string(),
            body,
            epilogue: raw[end..].to_string(),
            lenient: true,
        })
    }

    /// The body element.
    pub fn body(&self) -> &Element {
        &self.body
    }

    /// Mutable access to the body element.
    pub fn body_mut(&mut self) -> &mut Element {
        &mut self.body
    }

    /// Whether the lenient parser produced this document.
    pub fn is_lenient(&self) -> bool {
        self.lenient
    }

    /// Serializes the document back to markup.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.prologue.len() + self.epilogue.len());
        out.push_str(&self.prologue);
        self.body.write_outer(&mut out);
        out.push_str(&self.epilogue);
        out
    }
}

/// Byte range covering `<body ...>` through `</body>`.
fn locate_body(raw: &str) -> Result<(usize, usize), MarkupError> {
    let start = BODY_START_REGEX
        .find(raw)
        .ok_or(MarkupError::MissingBody)?
        .start();
    let end = BODY_END_REGEX
        .find_iter(raw)
        .last()
        .map(|m| m.end())
        .filter(|&end| end > start)
        .ok_or(MarkupError::MissingBody)?;
    Ok((start, end))
}
