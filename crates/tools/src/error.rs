//! Errors raised by the upstream data sources behind the tools.
//!
//! These never leave the tool boundary: each tool turns them into
//! [`ToolError::ExecutionFailed`](stockchat_core::ToolError::ExecutionFailed).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("could not decode upstream response: {0}")]
    Decode(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Truncate an upstream body for error messages.
pub(crate) fn snippet(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
