//! Cluster membership view
//!
//! The view store is the single writer of the locally observed membership.
//! Every accepted event produces a new immutable [`MembershipView`] with the
//! version bumped by one; readers only ever see whole snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{ResolverError, ResolverResult};
use crate::types::{ClusterNode, NodeAddress, NodeStatus};

/// Membership change reported by the membership layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "node", rename_all = "kebab-case")]
pub enum MembershipEvent {
    /// A node joined the cluster (status is taken from the node, usually Joining)
    MemberJoined(ClusterNode),
    /// A joining node was promoted to Up
    MemberUp(NodeAddress),
    /// The failure detector flagged the node as unreachable
    Unreachable(NodeAddress),
    /// A previously unreachable node is reachable again
    Reachable(NodeAddress),
    /// The node left gracefully
    MemberLeft(NodeAddress),
    /// The node was downed
    MemberDowned(NodeAddress),
    /// The node was removed from the membership
    MemberRemoved(NodeAddress),
}

impl MembershipEvent {
    /// Status the event moves an existing member to
    fn target_status(&self) -> Option<NodeStatus> {
        match self {
            MembershipEvent::MemberJoined(_) => None,
            MembershipEvent::MemberUp(_) | MembershipEvent::Reachable(_) => Some(NodeStatus::Up),
            MembershipEvent::Unreachable(_) => Some(NodeStatus::Unreachable),
            MembershipEvent::MemberDowned(_) => Some(NodeStatus::Down),
            MembershipEvent::MemberLeft(_) | MembershipEvent::MemberRemoved(_) => Some(NodeStatus::Removed),
        }
    }

    pub fn address(&self) -> &NodeAddress {
        match self {
            MembershipEvent::MemberJoined(node) => &node.address,
            MembershipEvent::MemberUp(address)
            | MembershipEvent::Unreachable(address)
            | MembershipEvent::Reachable(address)
            | MembershipEvent::MemberLeft(address)
            | MembershipEvent::MemberDowned(address)
            | MembershipEvent::MemberRemoved(address) => address,
        }
    }
}

/// Immutable snapshot of the locally observed membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    version: u64,
    members: BTreeMap<NodeAddress, ClusterNode>,
}

impl MembershipView {
    /// Build a view, recomputing the oldest-member flag
    pub fn new(version: u64, nodes: impl IntoIterator<Item = ClusterNode>) -> Self {
        let mut members: BTreeMap<NodeAddress, ClusterNode> = nodes
            .into_iter()
            .map(|node| (node.address.clone(), node))
            .collect();
        mark_oldest(&mut members);
        Self { version, members }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, address: &NodeAddress) -> Option<&ClusterNode> {
        self.members.get(address)
    }

    /// All known nodes, ordered by address
    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.members.values()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> impl Iterator<Item = &ClusterNode> {
        self.members.values().filter(move |node| node.status == status)
    }

    pub fn oldest(&self) -> Option<&ClusterNode> {
        self.members.values().find(|node| node.is_oldest)
    }

    pub fn has_unreachable(&self) -> bool {
        self.nodes_with_status(NodeStatus::Unreachable).next().is_some()
    }

    /// Whether every node is Down or Removed
    pub fn all_terminated<'a>(&self, addresses: impl IntoIterator<Item = &'a NodeAddress>) -> bool {
        addresses.into_iter().all(|address| {
            self.members
                .get(address)
                .map_or(true, |node| node.status.is_terminated())
        })
    }

    pub fn all_removed<'a>(&self, addresses: impl IntoIterator<Item = &'a NodeAddress>) -> bool {
        addresses.into_iter().all(|address| {
            self.members
                .get(address)
                .map_or(true, |node| node.status == NodeStatus::Removed)
        })
    }

    /// Split the view into the reachable and unreachable sides
    pub fn observe(&self) -> PartitionObservation {
        let side = |status| {
            self.nodes_with_status(status)
                .map(|node| (node.address.clone(), node.clone()))
                .collect::<BTreeMap<_, _>>()
        };
        PartitionObservation {
            version: self.version,
            reachable: side(NodeStatus::Up),
            unreachable: side(NodeStatus::Unreachable),
        }
    }
}

fn mark_oldest(members: &mut BTreeMap<NodeAddress, ClusterNode>) {
    let oldest = members
        .values()
        .filter(|node| node.status.is_member())
        .min_by(|a, b| a.age_key().cmp(&b.age_key()))
        .map(|node| node.address.clone());
    for node in members.values_mut() {
        node.is_oldest = Some(&node.address) == oldest.as_ref();
    }
}

/// Reachable and unreachable sides of a view at one version
///
/// Joining, Down and Removed nodes are not part of either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionObservation {
    pub version: u64,
    pub reachable: BTreeMap<NodeAddress, ClusterNode>,
    pub unreachable: BTreeMap<NodeAddress, ClusterNode>,
}

impl PartitionObservation {
    /// Observation built directly from two sides
    pub fn new(
        version: u64,
        reachable: impl IntoIterator<Item = ClusterNode>,
        unreachable: impl IntoIterator<Item = ClusterNode>,
    ) -> Self {
        let index = |nodes: Vec<ClusterNode>| {
            nodes
                .into_iter()
                .map(|node| (node.address.clone(), node))
                .collect::<BTreeMap<_, _>>()
        };
        Self {
            version,
            reachable: index(reachable.into_iter().collect()),
            unreachable: index(unreachable.into_iter().collect()),
        }
    }

    pub fn is_partitioned(&self) -> bool {
        !self.unreachable.is_empty()
    }

    /// Share of observed nodes on the reachable side; 1.0 for an empty observation
    pub fn reachable_ratio(&self) -> f64 {
        let total = self.reachable.len() + self.unreachable.len();
        if total == 0 {
            1.0
        } else {
            self.reachable.len() as f64 / total as f64
        }
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.reachable.contains_key(address) || self.unreachable.contains_key(address)
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.reachable.values().chain(self.unreachable.values())
    }
}

/// Single-writer store of the current membership view
#[derive(Debug)]
pub struct MembershipViewStore {
    current: Arc<MembershipView>,
}

impl MembershipViewStore {
    pub fn new() -> Self {
        Self::from_snapshot(0, Vec::new())
    }

    /// Start from the membership layer's current state
    pub fn from_snapshot(version: u64, nodes: impl IntoIterator<Item = ClusterNode>) -> Self {
        Self {
            current: Arc::new(MembershipView::new(version, nodes)),
        }
    }

    /// Move the version counter forward to `version`, so every later view sorts after it
    pub fn with_base_version(mut self, version: u64) -> Self {
        if version > self.current.version {
            let nodes = self.current.members.values().cloned().collect::<Vec<_>>();
            self.current = Arc::new(MembershipView::new(version, nodes));
        }
        self
    }

    pub fn current(&self) -> Arc<MembershipView> {
        Arc::clone(&self.current)
    }

    /// Apply one membership event.
    ///
    /// Returns the new view when the event changed anything, `None` when it was
    /// redundant. Rejected events leave the view untouched.
    pub fn apply(&mut self, event: &MembershipEvent) -> ResolverResult<Option<Arc<MembershipView>>> {
        let address = event.address();
        let existing = self.current.members.get(address);

        let next = match (event, existing) {
            (MembershipEvent::MemberJoined(node), None) => node.clone(),
            (MembershipEvent::MemberJoined(node), Some(known)) => {
                if known.status != NodeStatus::Removed {
                    return Err(ResolverError::DuplicateMember(node.address.clone()));
                }
                // A removed address may come back as a fresh incarnation
                node.clone()
            }
            (_, None) => return Err(ResolverError::UnknownMember(address.clone())),
            (event, Some(known)) => {
                let Some(target) = event.target_status() else {
                    return Ok(None);
                };
                if known.status == target {
                    trace!(%address, status = ?target, "redundant membership event");
                    return Ok(None);
                }
                let reachability_only = matches!(
                    event,
                    MembershipEvent::Unreachable(_) | MembershipEvent::Reachable(_)
                );
                if reachability_only && !known.status.is_member() {
                    debug!(%address, status = ?known.status, "ignoring reachability change of non-member");
                    return Ok(None);
                }
                if matches!(event, MembershipEvent::Reachable(_)) && known.status != NodeStatus::Unreachable {
                    return Ok(None);
                }
                if !known.status.can_transition_to(target) {
                    return Err(ResolverError::InvalidTransition {
                        address: address.clone(),
                        from: known.status,
                        to: target,
                    });
                }
                known.clone().with_status(target)
            }
        };

        let mut members = self.current.members.clone();
        members.insert(next.address.clone(), next);
        mark_oldest(&mut members);
        let view = Arc::new(MembershipView {
            version: self.current.version + 1,
            members,
        });
        debug!(version = view.version, %address, "membership view updated");
        self.current = Arc::clone(&view);
        Ok(Some(view))
    }
}

impl Default for MembershipViewStore {
    fn default() -> Self {
        Self::new()
    }
}
