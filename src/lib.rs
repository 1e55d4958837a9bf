//! epub-translate - structure-preserving EPUB translator.
//!
//! This library provides functionality for:
//! - Reading and writing EPUB containers without touching non-content entries
//! - Parsing XHTML content documents into a typed markup tree
//! - Translating block elements through an OpenAI-compatible API while
//!   keeping every tag and attribute intact

pub mod blocks;
pub mod config;
pub mod console;
pub mod driver;
pub mod epub;
pub mod error;
pub mod markup;
pub mod oracle;
pub mod orchestrator;
pub mod translator;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, NodeFailurePolicy, RunOptions, Settings};
pub use console::Console;
pub use driver::{BookDriver, BookReport};
pub use epub::{Document, EpubContainer};
pub use error::{ConfigError, EpubError, MarkupError, TranslationError};
pub use markup::{Element, MarkupDocument, Node};
pub use oracle::{OpenAiOracle, Oracle};
pub use orchestrator::{BlockOrchestrator, BlockState, TranslationStats};
pub use translator::{Translator, Usage};
