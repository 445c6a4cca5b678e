//! Filtering of incoming violation reports.

use thiserror::Error;

use crate::report::ViolationReportBody;

/// Blocked URI prefixes that browsers, extensions and embedded webviews
/// report but that nobody can act upon.
pub const DEFAULT_BLOCKED_URI_PREFIXES: &[&str] = &[
    "resource://",
    "chromenull://",
    "chrome-extension://",
    "safari-extension://",
    "mxjscall://",
    "webviewprogressproxy://",
    "res://",
    "mx://",
    "safari-resource://",
    "chromeinvoke://",
    "chromeinvokeimmediate://",
    "mbinit://",
    "opera://",
    "ms-appx://",
    "ms-appx-web://",
    "localhost",
    "127.0.0.1",
    "none://",
    "about:blank",
    "android-webview",
    "ms-browser-extension",
    "wvjbscheme://__wvjb_queue_message__",
    "nativebaiduhd://adblock",
    "bdvideo://error",
];

/// Reasons a report is rejected before it reaches storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("blocked URI is an invalid resource: {0}")]
    InvalidResource(String),
    #[error("document URI ('{0}') is invalid")]
    InvalidDocumentUri(String),
    #[error("non-whitelisted domain detected")]
    NotWhitelisted,
}

/// Decides whether a report is worth storing.
#[derive(Debug, Clone)]
pub struct Validator {
    blocked_prefixes: Vec<String>,
    whitelist: Vec<String>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_URI_PREFIXES.iter().copied(), Vec::<String>::new())
    }
}

impl Validator {
    /// `whitelist` entries are expected to be lower-cased already (see
    /// [`crate::config::parse_whitelist`]).
    pub fn new(
        blocked_prefixes: impl IntoIterator<Item = impl Into<String>>,
        whitelist: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            blocked_prefixes: blocked_prefixes.into_iter().map(Into::into).collect(),
            whitelist: whitelist.into_iter().map(Into::into).collect(),
        }
    }

    /// Checks run in order and the first failure wins.
    pub fn validate(&self, body: &ViolationReportBody) -> Result<(), ValidationError> {
        if self
            .blocked_prefixes
            .iter()
            .any(|prefix| body.blocked_uri.starts_with(prefix.as_str()))
        {
            return Err(ValidationError::InvalidResource(body.blocked_uri.clone()));
        }

        if !body.document_uri.starts_with("http") {
            return Err(ValidationError::InvalidDocumentUri(
                body.document_uri.clone(),
            ));
        }

        if self.whitelist.is_empty() || body.document_uri.is_empty() {
            return Ok(());
        }

        // N.B: This is a substring match over the whole URI, not a host comparison.
        let document_uri = body.document_uri.to_lowercase();
        if self
            .whitelist
            .iter()
            .any(|entry| document_uri.contains(entry.as_str()))
        {
            Ok(())
        } else {
            Err(ValidationError::NotWhitelisted)
        }
    }
}
