//! Error types for cluster orchestration.
//!
//! Errors fall into two groups:
//! - **Fatal to setup**: bootstrap, first registration, codec and IO failures
//!   abort `grow`/`bootstrap` with the originating error.
//! - **Reported**: assertion violations are collected and surfaced together.
//!
//! Steady-state registration failures never reach this type; they are logged
//! and retried by the registration timer.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a test cluster.
#[derive(Debug, Error)]
pub enum Error {
    /// A node failed partial bootstrap or gossip wiring during `grow`.
    #[error("node {index} failed to bootstrap: {source}")]
    Bootstrap {
        /// Ordinal index of the failing node.
        index: usize,
        /// The node's own error.
        #[source]
        source: Box<Error>,
    },

    /// The first registration of a remote failed; the remote is unusable.
    #[error("initial registration of service {service} failed: {source}")]
    Registration {
        /// Service the remote tried to advertise.
        service: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// An RPC call did not complete within its timeout.
    #[error("{method} call timed out after {timeout_ms}ms")]
    Timeout {
        /// RPC method name (`ad`, `unad`).
        method: &'static str,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// An RPC call was rejected by the mesh.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// One or more consistency checks failed.
    #[error("{context}: {} violation(s)\n{}", .violations.len(), .violations.join("\n"))]
    Assertion {
        /// Which check produced the violations.
        context: String,
        /// Every mismatch found, in discovery order.
        violations: Vec<String>,
    },

    /// Invalid cluster configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Advertise payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// IO error from binding or connecting.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The cluster has been closed.
    #[error("cluster is closed")]
    Closed,

    /// An operation needed a ring node but the cluster has none.
    #[error("cluster has no ring nodes")]
    NoNodes,

    /// An event source went away before the awaited condition held.
    #[error("{0} went away before the wait resolved")]
    Disconnected(&'static str),
}

impl Error {
    /// Timeout for `method` after `timeout`, saturating at `u64::MAX` ms.
    pub fn timeout(method: &'static str, timeout: std::time::Duration) -> Self {
        Error::Timeout {
            method,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Walk `Bootstrap`/`Registration` wrappers down to the originating error.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Bootstrap { source, .. } | Error::Registration { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// IO error kind of the originating error, if it was an IO error.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self.root_cause() {
            Error::Io(err) => Some(err.kind()),
            _ => None,
        }
    }

    /// Violations carried by an assertion error; empty for other variants.
    pub fn violations(&self) -> &[String] {
        match self {
            Error::Assertion { violations, .. } => violations,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_root_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::Bootstrap {
            index: 1,
            source: Box::new(Error::Io(io)),
        };
        assert!(err.to_string().contains("node 1"));
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_assertion_lists_every_violation() {
        let err = Error::Assertion {
            context: "exit shards for bob".into(),
            violations: vec!["first".into(), "second".into()],
        };
        let text = err.to_string();
        assert!(text.contains("2 violation(s)"));
        assert!(text.contains("first"));
        assert!(text.contains("second"));
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn test_non_io_has_no_kind() {
        assert_eq!(Error::Closed.io_kind(), None);
        assert!(Error::Closed.violations().is_empty());
    }

    #[test]
    fn test_timeout_saturates_huge_durations() {
        use std::time::Duration;

        let err = Error::timeout("ad", Duration::from_millis(1500));
        assert!(matches!(err, Error::Timeout { method: "ad", timeout_ms: 1500 }));

        let err = Error::timeout("unad", Duration::MAX);
        assert!(matches!(err, Error::Timeout { timeout_ms: u64::MAX, .. }));
    }
}
