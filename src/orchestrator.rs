//! Block translation orchestrator.
//!
//! Sends blocks to the translator in batches, validates that every returned
//! block kept its tag and attributes, and walks down the fallback ladder
//! when it did not:
//!
//! ```text
//! Pending -> BatchAttempted -> Accepted
//!                           -> SingleRetryAttempted -> Accepted
//!                                                   -> NodeFallback
//! ```
//!
//! A block's own element is never replaced; only its children are, and only
//! with content whose outer element matched the original shape. NodeFallback
//! rewrites individual text nodes and cannot touch structure.

use crate::blocks::{BlockRole, PlannedBlock, plan_blocks, translatable_text_paths};
use crate::config::{NodeFailurePolicy, Settings};
use crate::error::TranslationError;
use crate::markup::{Element, Node, NodePath, is_blank, parse_untrusted, sole_element};
use crate::translator::{RequestMode, TranslationRequest, Translator};
use crate::utils::{join_fragments, split_fragments};
use log::{debug, warn};

/// Samples of translated blocks kept for the run report.
const MAX_SAMPLES: usize = 3;

/// Where a block is on the fallback ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Pending,
    BatchAttempted,
    SingleRetryAttempted,
    Accepted,
    NodeFallback,
}

/// Counters for one document or a whole book.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationStats {
    /// Blocks found by extraction, nested ones included.
    pub blocks: usize,
    /// Blocks accepted from a batched request.
    pub accepted_in_batch: usize,
    /// Blocks accepted from their single-block retry.
    pub accepted_on_retry: usize,
    /// Blocks that ended in per-text-node translation.
    pub node_fallbacks: usize,
    /// Blocks with opaque content, translated per text node.
    pub opaque_blocks: usize,
    /// Blocks left alone (inside opaque content, or without text).
    pub skipped_blocks: usize,
    /// Text nodes rewritten by per-node translation.
    pub text_nodes_translated: usize,
    /// Text nodes left untranslated after a failure.
    pub text_node_failures: usize,
    /// Outer markup of the first few accepted blocks.
    pub samples: Vec<String>,
}

impl TranslationStats {
    /// Adds another set of counters to this one.
    pub fn merge(&mut self, other: &TranslationStats) {
        self.blocks += other.blocks;
        self.accepted_in_batch += other.accepted_in_batch;
        self.accepted_on_retry += other.accepted_on_retry;
        self.node_fallbacks += other.node_fallbacks;
        self.opaque_blocks += other.opaque_blocks;
        self.skipped_blocks += other.skipped_blocks;
        self.text_nodes_translated += other.text_nodes_translated;
        self.text_node_failures += other.text_node_failures;
        for sample in &other.samples {
            if self.samples.len() >= MAX_SAMPLES {
                break;
            }
            self.samples.push(sample.clone());
        }
    }

    fn record_sample(&mut self, el: &Element) {
        if self.samples.len() < MAX_SAMPLES {
            self.samples.push(el.outer_markup());
        }
    }
}

/// Translates the blocks of one document body in place.
pub struct BlockOrchestrator<'a> {
    translator: &'a Translator,
    settings: &'a Settings,
}

impl<'a> BlockOrchestrator<'a> {
    pub fn new(translator: &'a Translator, settings: &'a Settings) -> Self {
        Self {
            translator,
            settings,
        }
    }

    /// Translates every block under `body`, in document order.
    ///
    /// Only returns an error when a text node fails and the node failure
    /// policy is [`NodeFailurePolicy::Abort`].
    pub async fn translate_body(
        &self,
        body: &mut Element,
    ) -> Result<TranslationStats, TranslationError> {
        let mut stats = TranslationStats::default();
        let plan = plan_blocks(body);
        stats.blocks = plan.len();

        // Text directly in the body, outside any block
        let loose = translatable_text_paths(body, true);
        self.translate_text_nodes(body, &[], loose, &mut stats)
            .await?;

        let mut batch: Vec<PlannedBlock> = Vec::new();

        for block in plan {
            match block.role {
                BlockRole::Skip => stats.skipped_blocks += 1,
                BlockRole::Container => {
                    let loose = body
                        .element_at(&block.path)
                        .map(|el| translatable_text_paths(el, true))
                        .unwrap_or_default();
                    if !loose.is_empty() {
                        // Keep installation in document order
                        self.flush_batch(body, &mut batch, &mut stats).await?;
                        self.translate_text_nodes(body, &block.path, loose, &mut stats)
                            .await?;
                    }
                }
                BlockRole::Whole | BlockRole::Opaque => {
                    batch.push(block);
                    if batch.len() >= self.settings.batch_size {
                        self.flush_batch(body, &mut batch, &mut stats).await?;
                    }
                }
            }
        }

        self.flush_batch(body, &mut batch, &mut stats).await?;
        Ok(stats)
    }

    /// Runs one batch of leaf blocks through the ladder and empties `batch`.
    async fn flush_batch(
        &self,
        body: &mut Element,
        batch: &mut Vec<PlannedBlock>,
        stats: &mut TranslationStats,
    ) -> Result<(), TranslationError> {
        let batch = std::mem::take(batch);
        if batch.is_empty() {
            return Ok(());
        }

        // Blocks with nothing to translate stay out of the request
        let mut whole: Vec<&NodePath> = Vec::new();
        for block in &batch {
            if block.role != BlockRole::Whole {
                continue;
            }
            match body.element_at(&block.path) {
                Some(el) if !translatable_text_paths(el, false).is_empty() => {
                    whole.push(&block.path)
                }
                _ => {}
            }
        }

        let pieces = self.request_batch(body, &whole).await;

        let mut next_piece = 0;
        for block in &batch {
            match block.role {
                BlockRole::Opaque => {
                    stats.opaque_blocks += 1;
                    self.node_fallback(body, &block.path, stats).await?;
                }
                BlockRole::Whole if whole.contains(&&block.path) => {
                    let piece = pieces.as_ref().map(|p| p[next_piece].as_str());
                    next_piece += 1;
                    self.settle_block(body, &block.path, piece, stats).await?;
                }
                _ => stats.skipped_blocks += 1,
            }
        }

        Ok(())
    }

    /// Sends the blocks as one request and splits the answer.
    ///
    /// Returns `None` when the request failed or the answer did not split
    /// into exactly one piece per block.
    async fn request_batch(&self, body: &Element, paths: &[&NodePath]) -> Option<Vec<String>> {
        if paths.is_empty() {
            return None;
        }

        let fragments: Vec<String> = paths
            .iter()
            .filter_map(|path| body.element_at(path))
            .map(Element::outer_markup)
            .collect();
        let joined = join_fragments(&fragments, &self.settings.batch_delimiter);
        let mode = if fragments.len() == 1 {
            RequestMode::Block
        } else {
            RequestMode::Batch {
                segments: fragments.len(),
            }
        };

        let response = match self.translator.translate_fragment(&self.request(&joined, mode)).await {
            Ok(response) => response,
            Err(e) => {
                warn!("batch of {} blocks failed: {}", fragments.len(), e);
                return None;
            }
        };

        let pieces = split_fragments(&response, &self.settings.batch_delimiter);
        if pieces.len() != fragments.len() {
            debug!(
                "batch answer split into {} pieces, expected {}",
                pieces.len(),
                fragments.len()
            );
            return None;
        }
        Some(pieces)
    }

    /// Validates a block's batch piece, retrying alone and falling back to
    /// per-node translation as needed.
    async fn settle_block(
        &self,
        body: &mut Element,
        path: &[usize],
        piece: Option<&str>,
        stats: &mut TranslationStats,
    ) -> Result<(), TranslationError> {
        let Some(original) = body.element_at(path).cloned() else {
            return Ok(());
        };
        let mut state = BlockState::Pending;

        state = transition(path, state, BlockState::BatchAttempted);
        if let Some(children) = piece.and_then(|p| validated_children(&original, p)) {
            transition(path, state, BlockState::Accepted);
            install(body, path, children, stats);
            stats.accepted_in_batch += 1;
            return Ok(());
        }

        state = transition(path, state, BlockState::SingleRetryAttempted);
        let outer = original.outer_markup();
        match self
            .translator
            .translate_fragment(&self.request(&outer, RequestMode::Block))
            .await
        {
            Ok(response) => {
                if let Some(children) = validated_children(&original, &response) {
                    transition(path, state, BlockState::Accepted);
                    install(body, path, children, stats);
                    stats.accepted_on_retry += 1;
                    return Ok(());
                }
            }
            Err(e) => warn!("single-block retry failed: {}", e),
        }

        transition(path, state, BlockState::NodeFallback);
        stats.node_fallbacks += 1;
        self.node_fallback(body, path, stats).await
    }

    /// Translates every non-opaque text node under the block one by one.
    async fn node_fallback(
        &self,
        body: &mut Element,
        path: &[usize],
        stats: &mut TranslationStats,
    ) -> Result<(), TranslationError> {
        let texts = body
            .element_at(path)
            .map(|el| translatable_text_paths(el, false))
            .unwrap_or_default();
        self.translate_text_nodes(body, path, texts, stats).await
    }

    /// Translates text nodes given relative to the element at `base`.
    async fn translate_text_nodes(
        &self,
        body: &mut Element,
        base: &[usize],
        relative: Vec<NodePath>,
        stats: &mut TranslationStats,
    ) -> Result<(), TranslationError> {
        for rel in relative {
            let mut path = base.to_vec();
            path.extend(rel);
            self.translate_text_node(body, &path, stats).await?;
        }
        Ok(())
    }

    async fn translate_text_node(
        &self,
        body: &mut Element,
        path: &[usize],
        stats: &mut TranslationStats,
    ) -> Result<(), TranslationError> {
        let Some(raw) = body.text_at_mut(path).cloned() else {
            return Ok(());
        };
        if is_blank(&raw) {
            return Ok(());
        }

        let core = raw.trim();
        let leading = &raw[..raw.len() - raw.trim_start().len()];
        let trailing = &raw[raw.trim_end().len()..];
        let wrapped = format!("<span>{}</span>", core);

        match self
            .translator
            .translate_fragment(&self.request(&wrapped, RequestMode::Text))
            .await
        {
            Ok(response) => {
                let translated = plain_text(&response);
                let translated = translated.trim();
                if translated.is_empty() {
                    debug!("empty text translation, keeping original");
                    return Ok(());
                }
                if let Some(text) = body.text_at_mut(path) {
                    *text = format!("{}{}{}", leading, translated, trailing);
                    stats.text_nodes_translated += 1;
                }
                Ok(())
            }
            Err(e) => match self.settings.node_failure_policy {
                NodeFailurePolicy::Skip => {
                    warn!("leaving text node untranslated: {}", e);
                    stats.text_node_failures += 1;
                    Ok(())
                }
                NodeFailurePolicy::Abort => Err(e),
            },
        }
    }

    fn request<'r>(&'r self, fragment: &'r str, mode: RequestMode) -> TranslationRequest<'r> {
        TranslationRequest {
            fragment,
            source_lang: &self.settings.source_lang,
            target_lang: &self.settings.target_lang,
            mode,
        }
    }
}

fn transition(path: &[usize], from: BlockState, to: BlockState) -> BlockState {
    debug!("block {:?}: {:?} -> {:?}", path, from, to);
    to
}

fn install(body: &mut Element, path: &[usize], children: Vec<Node>, stats: &mut TranslationStats) {
    if let Some(el) = body.element_at_mut(path) {
        el.replace_children(children);
        stats.record_sample(el);
    }
}

/// Children of the answer's outer element, if it has the original's shape.
fn validated_children(original: &Element, response: &str) -> Option<Vec<Node>> {
    let candidate = sole_element(parse_untrusted(response))?;
    if candidate.same_shape(original) {
        Some(candidate.children)
    } else {
        debug!(
            "shape mismatch: expected <{}>, got <{}>",
            original.name, candidate.name
        );
        None
    }
}

/// Raw text of a fragment with all markup dropped.
fn plain_text(fragment: &str) -> String {
    let mut wrapper = Element::new("span");
    wrapper.replace_children(parse_untrusted(fragment));
    wrapper.text_content()
}
