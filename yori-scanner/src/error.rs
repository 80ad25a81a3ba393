use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("failed to connect to DevTools at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("DevTools error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("DevTools command '{method}' timed out after {duration:?}")]
    Timeout { method: String, duration: Duration },

    #[error("JavaScript exception: {0}")]
    JsException(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("navigation error: {url}: {reason}")]
    Navigation { url: String, reason: String },

    #[error("crawler must be loaded before {0}")]
    NotLoaded(&'static str),

    #[error("unknown event name: {0}")]
    UnknownEvent(String),

    #[error("override_post_message option must be enabled to use 'postmessage'")]
    PostMessageDisabled,

    #[error("handler for '{event}' failed: {source}")]
    Handler {
        event: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Other error: {0}")]
    Other(String),
}

impl ScanError {
    /// Handler failures abort the current crawl call; everything else raised
    /// while crawling a single element is recoverable.
    pub fn is_handler_error(&self) -> bool {
        matches!(self, ScanError::Handler { .. })
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
