//! Typed error kinds for the ingestion/alert core.
//!
//! The exchange REST/WS source threw its way through error conditions
//! (`UPSTREAM_PRICE_UNAVAILABLE`, `SYMBOL_UNRESOLVED`, ...); here each of
//! those becomes a variant of a single `Error` enum so callers match on it
//! instead of catching.

use thiserror::Error;

/// Advisory HTTP-like status carried by an upstream failure, so callers can
/// decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamStatus {
    TooManyRequests,
    UnavailableForLegalReasons,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    Network,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("upstream {exchange} unavailable: {status:?}")]
    UpstreamUnavailable {
        exchange: String,
        status: UpstreamStatus,
    },

    #[error("malformed payload from {exchange}: {detail}")]
    UpstreamDecodeError { exchange: String, detail: String },

    #[error("no candidate symbol resolved for {input} on {exchange}")]
    SymbolUnresolved { exchange: String, input: String },

    #[error("invalid snapshot: {reason}")]
    InvalidSnapshot { reason: String },

    #[error("authentication error")]
    AuthError,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let status = if err.is_timeout() {
            UpstreamStatus::GatewayTimeout
        } else if let Some(code) = err.status() {
            match code.as_u16() {
                429 => UpstreamStatus::TooManyRequests,
                451 => UpstreamStatus::UnavailableForLegalReasons,
                502 => UpstreamStatus::BadGateway,
                503 => UpstreamStatus::ServiceUnavailable,
                504 => UpstreamStatus::GatewayTimeout,
                _ => UpstreamStatus::Network,
            }
        } else {
            UpstreamStatus::Network
        };

        Error::UpstreamUnavailable {
            exchange: "unknown".to_string(),
            status,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(_err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::UpstreamUnavailable {
            exchange: "unknown".to_string(),
            status: UpstreamStatus::Network,
        }
    }
}

impl Error {
    /// Attach exchange context after the fact (the `From` impls above can't
    /// know which adapter they're running under).
    pub fn with_exchange(self, exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        match self {
            Error::UpstreamUnavailable { status, .. } => {
                Error::UpstreamUnavailable { exchange, status }
            }
            Error::UpstreamDecodeError { detail, .. } => {
                Error::UpstreamDecodeError { exchange, detail }
            }
            Error::SymbolUnresolved { input, .. } => Error::SymbolUnresolved { exchange, input },
            other => other,
        }
    }

    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(self, Error::UpstreamUnavailable { .. })
    }
}
