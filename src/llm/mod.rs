mod backend;
mod client_core;
mod history;
mod stream;
mod stream_tools;
pub mod types;

use reqwest::StatusCode;
use thiserror::Error;

pub use backend::*;
pub use client_core::*;
pub use history::*;
pub use stream::FrameDecoder;
pub use stream_tools::ToolDeltaBuffer;
pub use types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCategory {
    RateLimited,
    Server,
    Timeout,
    Auth,
    InvalidRequest,
    Unknown,
}

impl BackendCategory {
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::RateLimited,
            408 => Self::Timeout,
            401 | 403 => Self::Auth,
            s if (500..600).contains(&s) => Self::Server,
            s if (400..500).contains(&s) => Self::InvalidRequest,
            _ => Self::Unknown,
        }
    }

    /// Classify the numeric `code` of an in-stream `{"error": {...}}` frame.
    pub fn from_code(code: Option<i64>) -> Self {
        match code.and_then(|c| u16::try_from(c).ok()) {
            Some(c) => match StatusCode::from_u16(c) {
                Ok(status) => Self::from_status(status),
                Err(_) => Self::Unknown,
            },
            None => Self::Unknown,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Server | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::InvalidRequest => "invalid_request",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for BackendCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend error ({category}{}): {message}", status.map(|s| format!(", status {s}")).unwrap_or_default())]
    Backend {
        category: BackendCategory,
        status: Option<u16>,
        message: String,
        retry_after: Option<u64>,
    },
    #[error("invalid conversation: {0}")]
    InvalidConversation(String),
    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport(_) => true,
            LlmError::Backend { category, .. } => category.is_retryable(),
            LlmError::InvalidConversation(_) | LlmError::Cancelled => false,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            LlmError::Backend { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return LlmError::Backend {
                category: BackendCategory::from_status(status),
                status: Some(status.as_u16()),
                message: e.to_string(),
                retry_after: None,
            };
        }
        LlmError::Transport(e.to_string())
    }
}
