//! Book-level driver.
//!
//! Walks the content documents of an EPUB in manifest order, translates
//! each body with the [`BlockOrchestrator`], and writes the result back.

use crate::config::Settings;
use crate::console::Console;
use crate::epub::EpubContainer;
use crate::error::{MarkupError, Result};
use crate::markup::MarkupDocument;
use crate::orchestrator::{BlockOrchestrator, TranslationStats};
use crate::translator::{Translator, Usage};
use crate::utils::pause;
use anyhow::Context;
use log::{debug, info, warn};
use std::path::PathBuf;

/// Outcome of a whole run.
#[derive(Debug, Clone, Default)]
pub struct BookReport {
    /// Content documents found in the manifest.
    pub documents: usize,
    /// Documents whose body was translated.
    pub translated: usize,
    /// Documents left untouched (no body, or unreadable).
    pub skipped: usize,
    /// Documents that needed the lenient parser.
    pub lenient: usize,
    /// Block counters over all documents.
    pub stats: TranslationStats,
    /// Oracle traffic of this run, retries included.
    pub usage: Usage,
    /// Where the translated book was written; `None` on a dry run.
    pub output: Option<PathBuf>,
}

/// Drives translation of one book.
pub struct BookDriver<'a> {
    translator: &'a Translator,
    settings: &'a Settings,
    console: Console,
}

impl<'a> BookDriver<'a> {
    pub fn new(translator: &'a Translator, settings: &'a Settings) -> Self {
        Self {
            translator,
            settings,
            console: Console::new(),
        }
    }

    /// Loads the input EPUB, translates it, and saves it unless this is a
    /// dry run.
    pub async fn run(&self) -> Result<BookReport> {
        let mut epub = EpubContainer::load(&self.settings.input)
            .with_context(|| format!("Failed to open {}", self.settings.input.display()))?;

        let mut report = self.translate_container(&mut epub).await?;

        if self.settings.dry_run {
            info!("dry run, not writing {}", self.settings.output.display());
        } else {
            epub.save(&self.settings.output)
                .with_context(|| format!("Failed to write {}", self.settings.output.display()))?;
            report.output = Some(self.settings.output.clone());
        }

        Ok(report)
    }

    /// Translates every content document of `epub` in place.
    ///
    /// On a dry run the oracle is still called but the container is not
    /// modified.
    pub async fn translate_container(&self, epub: &mut EpubContainer) -> Result<BookReport> {
        let orchestrator = BlockOrchestrator::new(self.translator, self.settings);
        let total = epub.document_count();
        let usage_before = self.translator.usage();
        let mut report = BookReport {
            documents: total,
            ..Default::default()
        };

        for index in 0..total {
            let Some(doc) = epub.document_mut(index) else {
                continue;
            };
            let path = doc.path.clone();
            debug!("document {} ({}, {})", path, doc.id, doc.media_type);
            self.console.step(&format!(
                "{} {}",
                self.console.document_info(index + 1, total),
                path
            ));

            let raw = match doc.raw_markup() {
                Ok(raw) => raw,
                Err(e) => {
                    self.console.warning(&format!("Skipping {}: {}", path, e));
                    report.skipped += 1;
                    continue;
                }
            };

            let Some(mut document) = self.parse_document(&path, &raw) else {
                report.skipped += 1;
                continue;
            };
            if document.is_lenient() {
                report.lenient += 1;
            }

            let stats = orchestrator
                .translate_body(document.body_mut())
                .await
                .with_context(|| format!("Translation of {} aborted", path))?;
            debug!("{}: {:?}", path, stats);

            if !self.settings.dry_run {
                doc.set_raw_markup(document.serialize());
            }
            report.stats.merge(&stats);
            report.translated += 1;

            if index + 1 < total {
                pause(self.settings.sleep_between_docs).await;
            }
        }

        report.usage = self.translator.usage().since(&usage_before);
        Ok(report)
    }

    /// Parses strictly, falling back to the lenient parser for malformed
    /// bodies. Returns `None` for documents without a body.
    fn parse_document(&self, path: &str, raw: &str) -> Option<MarkupDocument> {
        match MarkupDocument::parse(raw) {
            Ok(document) => Some(document),
            Err(MarkupError::MissingBody) => {
                self.console
                    .warning(&format!("Skipping {}: no <body> element", path));
                None
            }
            Err(e) => {
                warn!("{}: {}, using lenient parser", path, e);
                match MarkupDocument::parse_lenient(raw) {
                    Ok(document) => Some(document),
                    Err(e) => {
                        self.console.warning(&format!("Skipping {}: {}", path, e));
                        None
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeFailurePolicy, test_settings};
    use crate::epub::testing::{build_epub, xhtml};
    use crate::error::TranslationError;
    use crate::oracle::testing::ScriptedOracle;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn italian(input: &str) -> String {
        input
            .replace("Hello", "Ciao")
            .replace("world", "mondo")
            .replace("Goodbye", "Arrivederci")
    }

    struct Fixture {
        _dir: TempDir,
        settings: Settings,
    }

    fn fixture(documents: &[(&str, &str)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("book.epub");
        std::fs::write(&input, build_epub(documents)).unwrap();
        let settings = Settings {
            input,
            output: dir.path().join("book.it.epub"),
            ..test_settings()
        };
        Fixture {
            _dir: dir,
            settings,
        }
    }

    async fn run(settings: &Settings, oracle: Arc<ScriptedOracle>) -> Result<BookReport> {
        let translator = Translator::new(Box::new(oracle), settings);
        BookDriver::new(&translator, settings).run().await
    }

    #[tokio::test]
    async fn test_translates_every_document() {
        let ch1 = xhtml(r#"<body><h1 id="t">Hello</h1><p>world</p></body>"#);
        let ch2 = xhtml("<body><p>Goodbye</p></body>");
        let fx = fixture(&[("ch1.xhtml", &ch1), ("ch2.xhtml", &ch2)]);
        let oracle = Arc::new(ScriptedOracle::new(|input| Ok(italian(input))));

        let report = run(&fx.settings, oracle.clone()).await.unwrap();
        assert_eq!(report.documents, 2);
        assert_eq!(report.translated, 2);
        assert_eq!(report.usage.calls, 3);
        assert_eq!(report.stats.accepted_in_batch, 3);
        assert_eq!(report.output.as_deref(), Some(fx.settings.output.as_path()));

        let epub = EpubContainer::load(&fx.settings.output).unwrap();
        let out1 = epub.document(0).unwrap().raw_markup().unwrap();
        assert_eq!(
            out1,
            xhtml(r#"<body><h1 id="t">Ciao</h1><p>mondo</p></body>"#)
        );
        let out2 = epub.document(1).unwrap().raw_markup().unwrap();
        assert!(out2.contains("<p>Arrivederci</p>"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let ch1 = xhtml("<body><p>Hello</p></body>");
        let mut fx = fixture(&[("ch1.xhtml", &ch1)]);
        fx.settings.dry_run = true;
        let before = std::fs::read(&fx.settings.input).unwrap();
        let oracle = Arc::new(ScriptedOracle::new(|input| Ok(italian(input))));

        let report = run(&fx.settings, oracle.clone()).await.unwrap();
        assert_eq!(report.usage.calls, 1);
        assert_eq!(report.usage.chars_received, "<p>Ciao</p>".len());
        assert!(report.usage.chars_sent > "<p>Hello</p>".len());
        assert!(report.output.is_none());
        assert_eq!(report.stats.samples, vec!["<p>Ciao</p>"]);
        assert!(!fx.settings.output.exists());
        assert_eq!(std::fs::read(&fx.settings.input).unwrap(), before);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_container_unchanged() {
        let ch1 = xhtml("<body><p>Hello</p></body>");
        let mut epub = EpubContainer::from_bytes(&build_epub(&[("ch1.xhtml", &ch1)])).unwrap();
        let settings = Settings {
            dry_run: true,
            ..test_settings()
        };
        let oracle = Arc::new(ScriptedOracle::new(|input| Ok(italian(input))));
        let translator = Translator::new(Box::new(oracle), &settings);

        BookDriver::new(&translator, &settings)
            .translate_container(&mut epub)
            .await
            .unwrap();
        assert_eq!(epub.document(0).unwrap().raw_markup().unwrap(), ch1);
    }

    #[tokio::test]
    async fn test_document_without_body_is_skipped() {
        let nav = "<html><head><title>nav</title></head></html>";
        let ch1 = xhtml("<body><p>Hello</p></body>");
        let fx = fixture(&[("nav.xhtml", nav), ("ch1.xhtml", &ch1)]);
        let oracle = Arc::new(ScriptedOracle::new(|input| Ok(italian(input))));

        let report = run(&fx.settings, oracle).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.translated, 1);

        let epub = EpubContainer::load(&fx.settings.output).unwrap();
        assert_eq!(epub.document(0).unwrap().raw_markup().unwrap(), nav);
    }

    #[tokio::test]
    async fn test_malformed_body_uses_lenient_parser() {
        let ch1 = xhtml("<body><p>Hello<br></p></body>");
        let fx = fixture(&[("ch1.xhtml", &ch1)]);
        let oracle = Arc::new(ScriptedOracle::new(|input| Ok(italian(input))));

        let report = run(&fx.settings, oracle).await.unwrap();
        assert_eq!(report.lenient, 1);

        let epub = EpubContainer::load(&fx.settings.output).unwrap();
        let out = epub.document(0).unwrap().raw_markup().unwrap();
        assert!(out.contains("<p>Ciao<br/></p>"));
        assert!(out.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
    }

    #[tokio::test]
    async fn test_abort_policy_stops_without_output() {
        let ch1 = xhtml("<body><p>Hello</p></body>");
        let mut fx = fixture(&[("ch1.xhtml", &ch1)]);
        fx.settings.node_failure_policy = NodeFailurePolicy::Abort;
        let oracle = Arc::new(ScriptedOracle::new(|_| {
            Err(TranslationError::ApiError {
                status: 400,
                message: "bad request".to_string(),
            })
        }));

        assert!(run(&fx.settings, oracle).await.is_err());
        assert!(!fx.settings.output.exists());
    }

    #[tokio::test]
    async fn test_missing_input_is_an_error() {
        let fx = fixture(&[]);
        let settings = Settings {
            input: fx.settings.input.with_file_name("missing.epub"),
            ..fx.settings.clone()
        };
        let oracle = Arc::new(ScriptedOracle::new(|input| Ok(italian(input))));
        assert!(run(&settings, oracle.clone()).await.is_err());
        assert!(oracle.inputs().is_empty());
    }
}
