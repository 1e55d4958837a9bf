//! Configuration management for epub-translate.
//!
//! A TOML file in the platform config directory holds endpoint, prompt and
//! retry settings. Command-line flags are layered on top of it to produce the
//! immutable [`Settings`] used for one run.

use crate::error::ConfigError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name used for config directory.
const APP_NAME: &str = "epub-translate";

/// Default config filename.
const CONFIG_FILENAME: &str = "config.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Translation API configuration.
    pub api: ApiConfig,

    /// Translation behavior settings.
    pub translation: TranslationConfig,

    /// Retry behavior for oracle calls.
    pub retry: RetryConfig,

    /// LLM prompts.
    pub prompts: PromptsConfig,
}

/// API configuration for the chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL for the API.
    pub base_url: String,

    /// Model identifier.
    pub model: String,

    /// Environment variable holding the API key.
    pub key_env: String,

    /// Per-request timeout in seconds.
    pub request_timeout_sec: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_sec: 60,
        }
    }
}

/// What to do when translating a single text node fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NodeFailurePolicy {
    /// Leave the text node untranslated and continue.
    #[default]
    Skip,
    /// Stop the run with an error.
    Abort,
}

/// Translation behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// Source language tag.
    pub source_lang: String,

    /// Target language tag.
    pub target_lang: String,

    /// Sampling temperature, 0 to 1.
    pub temperature: f32,

    /// Number of consecutive blocks sent in one request.
    pub batch_size: usize,

    /// Pause between documents in seconds.
    pub sleep_between_docs_sec: f64,

    /// Marker placed between blocks of a batched request.
    pub batch_delimiter: String,

    /// Behavior when a text node cannot be translated.
    pub node_failure_policy: NodeFailurePolicy,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            source_lang: "en".to_string(),
            target_lang: "it".to_string(),
            temperature: 0.1,
            batch_size: 3,
            sleep_between_docs_sec: 1.5,
            batch_delimiter: "<!--block-break-->".to_string(),
            node_failure_policy: NodeFailurePolicy::Skip,
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per oracle call, including the first.
    pub max_attempts: u32,

    /// Delay after the first failed attempt, in seconds.
    pub base_delay_sec: f64,

    /// Upper bound on any single delay, in seconds.
    pub max_delay_sec: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_sec: 1.0,
            max_delay_sec: 10.0,
        }
    }
}

/// LLM system prompts.
///
/// `{source}` and `{target}` are replaced with language names and
/// `{delimiter}` with the batch delimiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Prompt for translating one block of XHTML.
    pub block_translation: String,

    /// Extra instructions appended when several blocks are batched.
    pub batch_instructions: String,

    /// Prompt for translating a bare text run.
    pub text_translation: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            block_translation: "You are a professional translator. Translate the following XHTML fragment from {source} to {target}. Translate only human-readable text. Keep every tag, attribute name and attribute value exactly as given, in the same order, and never add or remove elements. Leave numbers, codes and the contents of code, pre, samp, kbd and var elements unchanged. Reply with the translated fragment only.".to_string(),
            batch_instructions: "The input contains several fragments separated by the marker {delimiter}. Translate each fragment independently, keep every marker exactly as written, and return the same number of fragments in the same order.".to_string(),
            text_translation: "You are a professional translator. Translate the text inside the <span> element from {source} to {target}. Keep entity references such as &amp;amp; unchanged. Reply with a single <span> element containing only the translated text.".to_string(),
        }
    }
}

impl Config {
    /// Returns the platform-specific config directory path.
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join(APP_NAME))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Returns the full path to the config file.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join(CONFIG_FILENAME))
    }

    /// Loads configuration from the default location.
    ///
    /// If the config file doesn't exist, creates a default one.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        if !path.exists() {
            let config = Config::default();
            config.save_to(&path)?;
            return Ok(config);
        }
        Self::load_from(&path)
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Ok(config)
    }

    /// Saves configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.api.base_url).map_err(|e| ConfigError::InvalidValue {
            key: "api.base_url".to_string(),
            message: e.to_string(),
        })?;

        if self.api.key_env.trim().is_empty() {
            return Err(ConfigError::MissingValue("api.key_env".to_string()));
        }

        if self.translation.batch_delimiter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "translation.batch_delimiter".to_string(),
                message: "must not be blank".to_string(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_attempts".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        RetryPolicy::try_from(&self.retry)?;

        Ok(())
    }
}

/// Values given on the command line; `None` falls back to the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub source_lang: Option<String>,
    pub target_lang: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub sleep_between_docs_sec: Option<f64>,
    pub batch_size: Option<usize>,
    pub node_failure_policy: Option<NodeFailurePolicy>,
    pub dry_run: bool,
}

/// Bounded exponential backoff for oracle calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs_f64(config.base_delay_sec),
            max_delay: Duration::from_secs_f64(config.max_delay_sec),
        }
    }
}

impl TryFrom<&RetryConfig> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(config: &RetryConfig) -> Result<Self, Self::Error> {
        let base_delay = seconds("retry.base_delay_sec", config.base_delay_sec)?;
        let max_delay = seconds("retry.max_delay_sec", config.max_delay_sec)?;
        if max_delay < base_delay {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_delay_sec".to_string(),
                message: "must not be smaller than retry.base_delay_sec".to_string(),
            });
        }
        Ok(Self {
            max_attempts: config.max_attempts,
            base_delay,
            max_delay,
        })
    }
}

/// Converts a number of seconds from config or the command line.
///
/// Negative, NaN, infinite and out-of-range values are rejected.
fn seconds(key: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{} is not a usable number of seconds ({})", value, e),
    })
}

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub input: PathBuf,
    pub output: PathBuf,
    pub source_lang: String,
    pub target_lang: String,
    pub model: String,
    pub temperature: f32,
    pub batch_size: usize,
    pub sleep_between_docs: Duration,
    pub dry_run: bool,
    pub batch_delimiter: String,
    pub node_failure_policy: NodeFailurePolicy,
    pub retry: RetryPolicy,
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub prompts: PromptsConfig,
}

impl Settings {
    /// Resolves run settings from config, CLI options and the credential.
    ///
    /// The credential and input path are checked here, before any container
    /// I/O takes place.
    pub fn resolve(
        config: &Config,
        options: RunOptions,
        api_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                ConfigError::MissingValue(format!(
                    "{} (export your API key in this environment variable)",
                    config.api.key_env
                ))
            })?;

        if !options.input.exists() {
            return Err(ConfigError::InputNotFound(options.input));
        }

        let has_epub_extension = options
            .input
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("epub"));
        if !has_epub_extension {
            return Err(ConfigError::InvalidValue {
                key: "input".to_string(),
                message: "input file must have the .epub extension".to_string(),
            });
        }

        let translation = &config.translation;

        let temperature = options.temperature.unwrap_or(translation.temperature);
        if !(0.0..=1.0).contains(&temperature) {
            return Err(ConfigError::InvalidValue {
                key: "temperature".to_string(),
                message: format!("{} is outside [0, 1]", temperature),
            });
        }

        let batch_size = options.batch_size.unwrap_or(translation.batch_size);
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        let sleep_between_docs = seconds(
            "sleep_between_docs",
            options
                .sleep_between_docs_sec
                .unwrap_or(translation.sleep_between_docs_sec),
        )?;

        Ok(Self {
            input: options.input,
            output: options.output,
            source_lang: options
                .source_lang
                .unwrap_or_else(|| translation.source_lang.clone()),
            target_lang: options
                .target_lang
                .unwrap_or_else(|| translation.target_lang.clone()),
            model: options.model.unwrap_or_else(|| config.api.model.clone()),
            temperature,
            batch_size,
            sleep_between_docs,
            dry_run: options.dry_run,
            batch_delimiter: translation.batch_delimiter.clone(),
            node_failure_policy: options
                .node_failure_policy
                .unwrap_or(translation.node_failure_policy),
            retry: RetryPolicy::try_from(&config.retry)?,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            api_key,
            request_timeout: Duration::from_secs(config.api.request_timeout_sec),
            prompts: config.prompts.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        input: PathBuf::from("in.epub"),
        output: PathBuf::from("out.epub"),
        source_lang: "en".to_string(),
        target_lang: "it".to_string(),
        model: "test-model".to_string(),
        temperature: 0.1,
        batch_size: 1,
        sleep_between_docs: Duration::ZERO,
        dry_run: false,
        batch_delimiter: TranslationConfig::default().batch_delimiter,
        node_failure_policy: NodeFailurePolicy::Skip,
        retry: RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        base_url: "http://localhost".to_string(),
        api_key: "test-key".to_string(),
        request_timeout: Duration::from_secs(5),
        prompts: PromptsConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    fn options_for(input: PathBuf) -> RunOptions {
        RunOptions {
            input,
            output: PathBuf::from("out.epub"),
            ..Default::default()
        }
    }

    fn existing_epub() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.epub");
        std::fs::write(&path, b"PK").unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.translation.source_lang, "en");
        assert_eq!(config.translation.target_lang, "it");
        assert_eq!(config.translation.batch_size, 3);
        assert_eq!(config.retry.max_attempts, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = Config::default();
        config.translation.node_failure_policy = NodeFailurePolicy::Abort;
        let file = NamedTempFile::new().unwrap();

        config.save_to(file.path()).unwrap();

        let loaded = Config::load_from(file.path()).unwrap();
        assert_eq!(loaded.api.model, config.api.model);
        assert_eq!(loaded.translation.node_failure_policy, NodeFailurePolicy::Abort);
        assert_eq!(loaded.translation.batch_delimiter, config.translation.batch_delimiter);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[translation]\ntarget_lang = \"fr\"\n").unwrap();
        let loaded = Config::load_from(file.path()).unwrap();
        assert_eq!(loaded.translation.target_lang, "fr");
        assert_eq!(loaded.translation.source_lang, "en");
        assert_eq!(loaded.api.key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = Config::default();
        config.api.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delays_double_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(8));
        assert_eq!(policy.delay_after(5), Duration::from_secs(10));
        assert_eq!(policy.delay_after(40), Duration::from_secs(10));
    }

    #[test]
    fn test_unusable_retry_delays_are_rejected() {
        for retry in [
            "base_delay_sec = nan",
            "max_delay_sec = inf",
            "base_delay_sec = -1.0",
            "max_delay_sec = 1e300",
            "base_delay_sec = 5.0\nmax_delay_sec = 2.0",
        ] {
            let file = NamedTempFile::new().unwrap();
            std::fs::write(file.path(), format!("[retry]\n{}\n", retry)).unwrap();
            let err = Config::load_from(file.path())
                .and_then(|config| config.validate())
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { .. }),
                "{}: {:?}",
                retry,
                err
            );
        }
    }

    #[test]
    fn test_unusable_sleep_is_rejected() {
        for sleep in [f64::NAN, f64::INFINITY, -0.5, 1e300] {
            let (_dir, input) = existing_epub();
            let options = RunOptions {
                sleep_between_docs_sec: Some(sleep),
                ..options_for(input)
            };
            let err = Settings::resolve(&Config::default(), options, Some("key".into()))
                .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }), "{}", sleep);
        }
    }

    #[test]
    fn test_missing_credential_is_fatal() {
        let (_dir, input) = existing_epub();
        let err = Settings::resolve(&Config::default(), options_for(input), None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue(_)));

        let (_dir, input) = existing_epub();
        let err = Settings::resolve(&Config::default(), options_for(input), Some("  ".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue(_)));
    }

    #[test]
    fn test_missing_input() {
        let err = Settings::resolve(
            &Config::default(),
            options_for(PathBuf::from("/definitely/not/here.epub")),
            Some("key".to_string()),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InputNotFound(_)));
    }

    #[test]
    fn test_wrong_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.zip");
        std::fs::write(&path, b"PK").unwrap();
        let err = Settings::resolve(&Config::default(), options_for(path), Some("key".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_cli_overrides_config() {
        let (_dir, input) = existing_epub();
        let options = RunOptions {
            target_lang: Some("de".to_string()),
            batch_size: Some(5),
            temperature: Some(0.7),
            dry_run: true,
            ..options_for(input)
        };
        let settings =
            Settings::resolve(&Config::default(), options, Some("key".to_string())).unwrap();
        assert_eq!(settings.source_lang, "en");
        assert_eq!(settings.target_lang, "de");
        assert_eq!(settings.batch_size, 5);
        assert_eq!(settings.temperature, 0.7);
        assert!(settings.dry_run);
        assert_eq!(settings.sleep_between_docs, Duration::from_secs_f64(1.5));
    }

    #[test]
    fn test_temperature_out_of_range() {
        let (_dir, input) = existing_epub();
        let options = RunOptions {
            temperature: Some(1.5),
            ..options_for(input)
        };
        assert!(Settings::resolve(&Config::default(), options, Some("key".into())).is_err());
    }
}
