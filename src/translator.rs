//! Translation client on top of an [`Oracle`].
//!
//! Builds prompts, retries transient failures with bounded exponential
//! backoff, and cleans up the raw completion text. It does not check the
//! returned markup.

use crate::config::{PromptsConfig, RetryPolicy, Settings};
use crate::console::Console;
use crate::error::TranslationError;
use crate::oracle::{Message, Oracle, OracleRequest};
use isolang::Language;
use log::debug;
use regex::Regex;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Regex to extract content from markdown code fences.
static CODE_FENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^```[a-zA-Z]*\s*(.*?)\s*```$").expect("Invalid CODE_FENCE_REGEX")
});

/// Refusal phrases that indicate the model declined to translate.
static REFUSAL_PHRASES: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "i'm sorry",
        "i cannot",
        "i am unable",
        "as an ai",
        "my apologies",
        "i am not programmed",
        "i do not have the ability",
    ]
});

/// Which prompt a request uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// One block's outer markup.
    Block,
    /// Several blocks joined by the batch delimiter.
    Batch { segments: usize },
    /// A bare text run inside a neutral wrapper.
    Text,
}

/// One translation request.
#[derive(Debug, Clone, Copy)]
pub struct TranslationRequest<'a> {
    pub fragment: &'a str,
    pub source_lang: &'a str,
    pub target_lang: &'a str,
    pub mode: RequestMode,
}

/// Oracle traffic counted by a [`Translator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Calls issued, retries included.
    pub calls: usize,
    /// Characters of prompt text sent, system prompts included.
    pub chars_sent: usize,
    /// Characters of completion text received.
    pub chars_received: usize,
}

impl Usage {
    /// Traffic since an earlier snapshot of the same translator.
    pub fn since(&self, earlier: &Usage) -> Usage {
        Usage {
            calls: self.calls.saturating_sub(earlier.calls),
            chars_sent: self.chars_sent.saturating_sub(earlier.chars_sent),
            chars_received: self.chars_received.saturating_sub(earlier.chars_received),
        }
    }

    /// Rough token count in both directions, at four characters a token.
    pub fn estimated_tokens(&self) -> usize {
        (self.chars_sent + self.chars_received).div_ceil(4)
    }
}

/// Translator for markup fragments.
pub struct Translator {
    /// Backend answering requests.
    oracle: Box<dyn Oracle>,
    /// Model identifier sent with every request.
    model: String,
    /// Sampling temperature.
    temperature: f32,
    /// Retry behavior.
    retry: RetryPolicy,
    /// System prompt templates.
    prompts: PromptsConfig,
    /// Batch delimiter, substituted into prompts.
    delimiter: String,
    /// Console for output.
    console: Console,
    /// Oracle calls made so far, retries included.
    calls: AtomicUsize,
    chars_sent: AtomicUsize,
    chars_received: AtomicUsize,
}

impl Translator {
    /// Create a new Translator.
    pub fn new(oracle: Box<dyn Oracle>, settings: &Settings) -> Self {
        Self {
            oracle,
            model: settings.model.clone(),
            temperature: settings.temperature,
            retry: settings.retry,
            prompts: settings.prompts.clone(),
            delimiter: settings.batch_delimiter.clone(),
            console: Console::new(),
            calls: AtomicUsize::new(0),
            chars_sent: AtomicUsize::new(0),
            chars_received: AtomicUsize::new(0),
        }
    }

    /// Traffic so far, retries included.
    pub fn usage(&self) -> Usage {
        Usage {
            calls: self.calls.load(Ordering::Relaxed),
            chars_sent: self.chars_sent.load(Ordering::Relaxed),
            chars_received: self.chars_received.load(Ordering::Relaxed),
        }
    }

    /// Translates a markup fragment.
    ///
    /// Blank input is returned unchanged without calling the oracle.
    /// Transient failures are retried; the last failure is returned once the
    /// attempts run out.
    pub async fn translate_fragment(
        &self,
        request: &TranslationRequest<'_>,
    ) -> Result<String, TranslationError> {
        if request.fragment.trim().is_empty() {
            return Ok(request.fragment.to_string());
        }

        let oracle_request = self.build_request(request);
        let sent: usize = oracle_request
            .messages
            .iter()
            .map(|m| m.content.chars().count())
            .sum();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.chars_sent.fetch_add(sent, Ordering::Relaxed);

            let result = self
                .oracle
                .complete(&oracle_request)
                .await
                .and_then(|raw| {
                    self.chars_received
                        .fetch_add(raw.chars().count(), Ordering::Relaxed);
                    clean_response(&raw)
                });

            match result {
                Ok(text) => return Ok(text),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= self.retry.max_attempts => {
                    return Err(TranslationError::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay_after(attempt);
                    self.console.warning(&format!(
                        "Translation failed ({}), retrying in {:?} (attempt {}/{})",
                        e,
                        delay,
                        attempt + 1,
                        self.retry.max_attempts
                    ));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn build_request(&self, request: &TranslationRequest<'_>) -> OracleRequest {
        let source = language_name(request.source_lang);
        let target = language_name(request.target_lang);
        let render = |template: &str| {
            template
                .replace("{source}", &source)
                .replace("{target}", &target)
                .replace("{delimiter}", &self.delimiter)
        };

        let system = match request.mode {
            RequestMode::Block | RequestMode::Batch { segments: 1 } => {
                render(&self.prompts.block_translation)
            }
            RequestMode::Batch { .. } => format!(
                "{}\n\n{}",
                render(&self.prompts.block_translation),
                render(&self.prompts.batch_instructions)
            ),
            RequestMode::Text => render(&self.prompts.text_translation),
        };

        debug!(
            "oracle request: mode={:?} {} chars",
            request.mode,
            request.fragment.len()
        );

        OracleRequest {
            model: self.model.clone(),
            temperature: self.temperature,
            messages: vec![Message::system(system), Message::user(request.fragment)],
        }
    }
}

/// Trims the completion, rejects empty or refusing answers, and strips a
/// code fence wrapper.
fn clean_response(raw: &str) -> Result<String, TranslationError> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Err(TranslationError::Refused("Empty response".to_string()));
    }

    // Markup answers are never refusals, whatever words they contain
    if !trimmed.starts_with('<') && !trimmed.starts_with("```") {
        let lower = trimmed.to_lowercase();
        if let Some(phrase) = REFUSAL_PHRASES.iter().find(|p| lower.starts_with(**p)) {
            return Err(TranslationError::Refused(format!(
                "Response starts with refusal phrase: {}",
                phrase
            )));
        }
    }

    let unfenced = CODE_FENCE_REGEX
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    Ok(unfenced.to_string())
}

/// English name of a language tag such as `it`, `deu` or `pt-BR`.
///
/// Unknown tags are returned as given.
pub fn language_name(tag: &str) -> String {
    let primary = tag
        .split(['-', '_'])
        .next()
        .unwrap_or(tag)
        .trim()
        .to_lowercase();

    let language = match primary.len() {
        2 => Language::from_639_1(&primary),
        3 => Language::from_639_3(&primary),
        _ => None,
    };

    language
        .map(|l| l.to_name().to_string())
        .unwrap_or_else(|| tag.to_string())
}
