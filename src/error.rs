//! Error types for the split-brain resolver

use thiserror::Error;
use crate::types::{NodeAddress, NodeStatus};

/// Result type for resolver operations
pub type ResolverResult<T> = Result<T, ResolverError>;

/// Main error type for resolver operations
#[derive(Error, Debug)]
pub enum ResolverError {
    /// A down-command could not be delivered or acknowledged. Retried with backoff.
    #[error("Down command for {address} failed: {reason}")]
    TransientCommandFailure {
        address: NodeAddress,
        reason: String,
    },

    /// The retry ceiling was reached without downing every member of the decision.
    /// Split-brain safety can no longer be guaranteed by this node.
    #[error("Downing of view version {version} exhausted after {attempts} attempts: {reason}")]
    ExecutionExhausted {
        version: u64,
        attempts: u32,
        reason: String,
    },

    /// Rejected at startup, before any membership event is processed
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// Membership event for a node that never joined
    #[error("Unknown member {0}")]
    UnknownMember(NodeAddress),

    /// Join for an address that is already a live member
    #[error("Member {0} already joined")]
    DuplicateMember(NodeAddress),

    /// Non-monotone status transition
    #[error("Invalid transition for {address}: {from:?} -> {to:?}")]
    InvalidTransition {
        address: NodeAddress,
        from: NodeStatus,
        to: NodeStatus,
    },

    /// Downing record storage errors
    #[error("Record storage error: {0}")]
    Storage(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The resolver pipeline is no longer running
    #[error("Resolver stopped")]
    ResolverStopped,
}

impl ResolverError {
    /// Whether this error leaves the node unable to guarantee split-brain safety
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResolverError::ExecutionExhausted { .. })
    }
}

impl From<rusqlite::Error> for ResolverError {
    fn from(err: rusqlite::Error) -> Self {
        ResolverError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ResolverError {
    fn from(err: serde_json::Error) -> Self {
        ResolverError::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for ResolverError {
    fn from(err: toml::de::Error) -> Self {
        ResolverError::ConfigurationInvalid(err.to_string())
    }
}
