//! Block extraction and classification.
//!
//! Blocks are the block-level elements that act as the unit of translation.
//! Extraction yields every block in document order, nested ones included;
//! [`plan_blocks`] then decides how each one is handled.

use crate::markup::{Element, Node, NodePath, is_blank};

/// Tags that make an element a translation block.
pub const BLOCK_TAGS: &[&str] = &[
    "p", "div", "li", "blockquote", "section", "article", "aside", "header", "footer", "nav",
    "main", "figure", "figcaption", "h1", "h2", "h3", "h4", "h5", "h6", "dl", "dt", "dd", "table",
    "thead", "tbody", "tfoot", "tr", "td", "th", "caption", "pre",
];

/// Tags whose text content must never be altered.
pub const OPAQUE_TAGS: &[&str] = &["code", "pre", "samp", "kbd", "var"];

/// Raw-text elements, never translated either.
pub const RAW_TEXT_TAGS: &[&str] = &["script", "style"];

/// Returns true if `name` is a block tag.
pub fn is_block_tag(name: &str) -> bool {
    BLOCK_TAGS.iter().any(|tag| tag.eq_ignore_ascii_case(name))
}

/// Returns true if `name` is an opaque or raw-text tag.
pub fn is_opaque_tag(name: &str) -> bool {
    OPAQUE_TAGS
        .iter()
        .chain(RAW_TEXT_TAGS)
        .any(|tag| tag.eq_ignore_ascii_case(name))
}

/// Returns true if the element or any descendant is opaque.
pub fn is_opaque(el: &Element) -> bool {
    is_opaque_tag(&el.name)
        || el.children.iter().any(|child| match child {
            Node::Element(child) => is_opaque(child),
            _ => false,
        })
}

/// Paths of all block elements under `root`, depth-first in document order.
///
/// Descendants of a matched block are still visited.
pub fn extract_blocks(root: &Element) -> Vec<NodePath> {
    let mut blocks = Vec::new();
    let mut path = Vec::new();
    walk_blocks(root, &mut path, &mut blocks);
    blocks
}

fn walk_blocks(el: &Element, path: &mut NodePath, out: &mut Vec<NodePath>) {
    for (index, child) in el.children.iter().enumerate() {
        if let Node::Element(child) = child {
            path.push(index);
            if is_block_tag(&child.name) {
                out.push(path.clone());
            }
            walk_blocks(child, path, out);
            path.pop();
        }
    }
}

/// How a block takes part in translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    /// Leaf block sent to the oracle as a whole.
    Whole,
    /// Leaf block containing opaque content; only its other text is translated.
    Opaque,
    /// Block with nested blocks; only its loose text is translated here.
    Container,
    /// Block under an opaque ancestor; left alone.
    Skip,
}

/// A block with its role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBlock {
    pub path: NodePath,
    pub role: BlockRole,
}

/// Extracts and classifies all blocks under `root`.
pub fn plan_blocks(root: &Element) -> Vec<PlannedBlock> {
    extract_blocks(root)
        .into_iter()
        .map(|path| {
            let role = classify(root, &path);
            PlannedBlock { path, role }
        })
        .collect()
}

fn classify(root: &Element, path: &[usize]) -> BlockRole {
    // Walk down from the root checking proper ancestors
    let mut current = root;
    for &index in &path[..path.len().saturating_sub(1)] {
        match current.children.get(index) {
            Some(Node::Element(el)) => {
                if is_opaque_tag(&el.name) {
                    return BlockRole::Skip;
                }
                current = el;
            }
            _ => return BlockRole::Skip,
        }
    }

    let Some(el) = root.element_at(path) else {
        return BlockRole::Skip;
    };

    if is_opaque_tag(&el.name) {
        BlockRole::Opaque
    } else if has_block_descendant(el) {
        BlockRole::Container
    } else if is_opaque(el) {
        BlockRole::Opaque
    } else {
        BlockRole::Whole
    }
}

fn has_block_descendant(el: &Element) -> bool {
    el.children.iter().any(|child| match child {
        Node::Element(child) => is_block_tag(&child.name) || has_block_descendant(child),
        _ => false,
    })
}

/// Paths (relative to `root`) of translatable text nodes under `root`.
///
/// Text inside opaque elements and blank text are never returned. When
/// `stop_at_blocks` is set, nested block elements are not entered either.
pub fn translatable_text_paths(root: &Element, stop_at_blocks: bool) -> Vec<NodePath> {
    let mut paths = Vec::new();
    if is_opaque_tag(&root.name) {
        return paths;
    }
    let mut path = Vec::new();
    walk_text(root, stop_at_blocks, &mut path, &mut paths);
    paths
}

fn walk_text(el: &Element, stop_at_blocks: bool, path: &mut NodePath, out: &mut Vec<NodePath>) {
    for (index, child) in el.children.iter().enumerate() {
        path.push(index);
        match child {
            Node::Text(text) if !is_blank(text) => out.push(path.clone()),
            Node::Element(child) => {
                let enter =
                    !is_opaque_tag(&child.name) && !(stop_at_blocks && is_block_tag(&child.name));
                if enter {
                    walk_text(child, stop_at_blocks, path, out);
                }
            }
            _ => {}
        }
        path.pop();
    }
}
