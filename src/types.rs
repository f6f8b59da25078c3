//! Core types shared across the resolver
//!
//! Node identity is the network address; every tie-break in the resolver
//! uses the total order of addresses, never anything node-local.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::ResolverError;

/// Network address identifying a cluster node (`host:port`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Create an address, rejecting empty strings and missing ports
    pub fn new(address: impl Into<String>) -> Result<Self, ResolverError> {
        let address = address.into();
        let trimmed = address.trim();
        match trimmed.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self(trimmed.to_string()))
            }
            _ => Err(ResolverError::ConfigurationInvalid(format!(
                "'{}' is not a host:port address",
                address
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = ResolverError;

    fn try_from(address: String) -> Result<Self, Self::Error> {
        Self::new(address)
    }
}

impl From<NodeAddress> for String {
    fn from(address: NodeAddress) -> Self {
        address.0
    }
}

impl FromStr for NodeAddress {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Membership status of a node
///
/// Transitions are monotone (Joining → Up → Down → Removed) except for
/// Up ↔ Unreachable, which may flap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Joining,
    Up,
    Unreachable,
    Down,
    Removed,
}

impl NodeStatus {
    /// Whether `next` is a legal successor of this status
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        match (self, next) {
            (Joining, Up) => true,
            (Up, Unreachable) | (Unreachable, Up) => true,
            (Joining | Up | Unreachable, Down) => true,
            (Removed, _) => false,
            (_, Removed) => true,
            _ => false,
        }
    }

    /// Up or Unreachable: the node still takes part in partition decisions
    pub fn is_member(self) -> bool {
        matches!(self, NodeStatus::Up | NodeStatus::Unreachable)
    }

    /// Down or Removed
    pub fn is_terminated(self) -> bool {
        matches!(self, NodeStatus::Down | NodeStatus::Removed)
    }
}

/// A node as observed by the local membership view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Node identity
    pub address: NodeAddress,
    /// Role labels carried by the node
    pub roles: BTreeSet<String>,
    /// Current status
    pub status: NodeStatus,
    /// Join timestamp agreed through the membership layer (lower is older)
    pub joined_at: u64,
    /// Set by the view on the oldest Up/Unreachable node
    pub is_oldest: bool,
}

impl ClusterNode {
    /// New node in `Joining` status
    pub fn new(address: NodeAddress, joined_at: u64) -> Self {
        Self {
            address,
            roles: BTreeSet::new(),
            status: NodeStatus::Joining,
            joined_at,
            is_oldest: false,
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Age order key: join timestamp first, address breaks ties
    pub fn age_key(&self) -> (u64, &NodeAddress) {
        (self.joined_at, &self.address)
    }
}

/// Resolver health as reported to health endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterHealth {
    /// Resolver is running and can guarantee split-brain safety
    Healthy,
    /// A decision could not be applied; split-brain safety is no longer guaranteed
    Unhealthy,
    /// The local node downed itself and stopped participating
    Downed,
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterHealth::Healthy => write!(f, "healthy"),
            ClusterHealth::Unhealthy => write!(f, "unhealthy"),
            ClusterHealth::Downed => write!(f, "downed"),
        }
    }
}
