//! Error types for epub-translate.
//!
//! Uses `thiserror` for structured error definitions that provide
//! clear context about what went wrong.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for configuration and run settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Missing required configuration value
    #[error("Missing required config value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid config value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Input EPUB does not exist
    #[error("Input file not found: {}", .0.display())]
    InputNotFound(PathBuf),

    /// Config directory not found
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Error type for markup parsing.
#[derive(Error, Debug)]
pub enum MarkupError {
    /// The markup is not well-formed
    #[error("Malformed markup at byte {position}: {message}")]
    Malformed { position: u64, message: String },

    /// An element was still open at the end of input
    #[error("Unclosed element <{0}>")]
    Unclosed(String),

    /// A closing tag had no matching opening tag
    #[error("Unexpected closing tag </{0}>")]
    UnexpectedEnd(String),

    /// The document has no `<body>` element
    #[error("Document has no <body> element")]
    MissingBody,
}

/// Error type for translation operations.
#[derive(Error, Debug)]
pub enum TranslationError {
    /// HTTP request to API failed
    #[error("API request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// API returned an error response
    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    /// API rejected the request because of rate or quota limits
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Translation was refused by the model
    #[error("Translation refused: {0}")]
    Refused(String),

    /// All retry attempts exhausted
    #[error("All retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<TranslationError>,
    },

    /// Invalid API configuration
    #[error("Invalid API configuration: {0}")]
    InvalidConfig(String),
}

impl TranslationError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TranslationError::HttpError(_)
            | TranslationError::RateLimited(_)
            | TranslationError::ParseError(_)
            | TranslationError::Refused(_) => true,
            TranslationError::ApiError { status, .. } => *status >= 500,
            TranslationError::RetriesExhausted { .. } | TranslationError::InvalidConfig(_) => false,
        }
    }
}

/// Error type for EPUB container operations.
#[derive(Error, Debug)]
pub enum EpubError {
    /// Input archive does not exist
    #[error("EPUB not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Archive is not a usable EPUB
    #[error("Invalid EPUB: {0}")]
    Format(String),

    /// Failed to read or write the ZIP archive
    #[error("ZIP archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// XML in container.xml or the package document is invalid
    #[error("XML parse error: {0}")]
    Xml(String),
}

/// Result type alias using anyhow for application-level error handling.
pub type Result<T> = anyhow::Result<T>;
