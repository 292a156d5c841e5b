//! Failure kinds reported by sites or produced locally.
//!
//! Sites may attach an explicit kind to a failed result. When they don't,
//! the kind is inferred from the error text.

use serde::{Deserialize, Serialize};

/// Why a command or delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No result within the budget.
    Timeout,
    /// The connection dropped mid-transfer.
    NetworkReset,
    /// The site could not parse the payload.
    InvalidPayload,
    /// The site refused the operation.
    PermissionDenied,
    Other,
}

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "etimedout"];
const NETWORK_RESET_MARKERS: &[&str] = &[
    "econnreset",
    "connection reset",
    "socket hang up",
    "econnrefused",
    "network error",
];
const INVALID_PAYLOAD_MARKERS: &[&str] = &["malformed", "invalid payload", "parse error"];
const PERMISSION_MARKERS: &[&str] = &["permission denied", "eacces", "forbidden"];

impl FailureKind {
    /// Infer the kind from free-form error text.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

        if has(TIMEOUT_MARKERS) {
            Self::Timeout
        } else if has(NETWORK_RESET_MARKERS) {
            Self::NetworkReset
        } else if has(INVALID_PAYLOAD_MARKERS) {
            Self::InvalidPayload
        } else if has(PERMISSION_MARKERS) {
            Self::PermissionDenied
        } else {
            Self::Other
        }
    }

    /// Transient failures are eligible for bounded automatic retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::NetworkReset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_markers() {
        assert_eq!(FailureKind::classify("timeout after 600s"), FailureKind::Timeout);
        assert_eq!(FailureKind::classify("Download timed out"), FailureKind::Timeout);
        assert_eq!(
            FailureKind::classify("read ECONNRESET"),
            FailureKind::NetworkReset
        );
        assert!(FailureKind::classify("socket hang up").is_retryable());
    }

    #[test]
    fn permanent_failures_are_not_retryable() {
        let kind = FailureKind::classify("malformed manifest");
        assert_eq!(kind, FailureKind::InvalidPayload);
        assert!(!kind.is_retryable());

        let kind = FailureKind::classify("EACCES: permission denied, open '/opt/player'");
        assert_eq!(kind, FailureKind::PermissionDenied);
        assert!(!kind.is_retryable());

        assert!(!FailureKind::classify("disk full").is_retryable());
    }
}
