use thiserror::Error;

use crate::types::Marketplace;

/// Failures surfaced by the monitor. None of them is fatal to the process:
/// the worst outcome is a missed polling tick.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// `transient` is decided where the failure is observed (status code,
    /// timeout, refused connection), never from the message text.
    #[error("{marketplace} fetch failed: {reason}")]
    FetchFailed {
        marketplace: Marketplace,
        reason: String,
        transient: bool,
    },

    #[error("relay call failed: {reason}")]
    RelayCallFailed { reason: String, transient: bool },

    #[error("invalid payload: {0}")]
    Payload(String),
}

impl MonitorError {
    pub fn fetch(marketplace: Marketplace, reason: impl ToString) -> Self {
        Self::FetchFailed {
            marketplace,
            reason: reason.to_string(),
            transient: false,
        }
    }

    pub fn fetch_transient(marketplace: Marketplace, reason: impl ToString) -> Self {
        Self::FetchFailed {
            marketplace,
            reason: reason.to_string(),
            transient: true,
        }
    }

    pub fn relay(reason: impl ToString) -> Self {
        Self::RelayCallFailed {
            reason: reason.to_string(),
            transient: false,
        }
    }

    pub fn relay_transient(reason: impl ToString) -> Self {
        Self::RelayCallFailed {
            reason: reason.to_string(),
            transient: true,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::FetchFailed { transient, .. } | Self::RelayCallFailed { transient, .. } => *transient,
            Self::ConnectionFailed(_) | Self::Payload(_) => false,
        }
    }
}
