//! Downing strategies
//!
//! [`decide`] is a pure function of the observation, the strategy and the
//! role scope. Every node evaluates it independently, so it must not look at
//! anything node-local: sides are compared by size, by configured addresses,
//! by join timestamps and finally by the total order of addresses.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::membership::PartitionObservation;
use super::role::RoleFilter;
use crate::types::{ClusterNode, NodeAddress};

/// Configured strategy with its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum DowningStrategy {
    /// A side with at least `min_size` members survives
    StaticQuorum { min_size: usize },
    /// The larger side survives; ties go to the side holding the smallest address
    KeepMajority,
    /// The side holding the referee survives
    KeepReferee {
        referee: NodeAddress,
        down_all_if_less_than_nodes: usize,
    },
    /// The side holding the oldest member survives
    KeepOldest { down_if_alone: bool },
}

impl DowningStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            DowningStrategy::StaticQuorum { .. } => "static-quorum",
            DowningStrategy::KeepMajority => "keep-majority",
            DowningStrategy::KeepReferee { .. } => "keep-referee",
            DowningStrategy::KeepOldest { .. } => "keep-oldest",
        }
    }
}

impl fmt::Display for DowningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DowningStrategy::StaticQuorum { min_size } => write!(f, "static-quorum(min-size={})", min_size),
            DowningStrategy::KeepMajority => write!(f, "keep-majority"),
            DowningStrategy::KeepReferee { referee, down_all_if_less_than_nodes } => write!(
                f,
                "keep-referee(address={}, down-all-if-less-than-nodes={})",
                referee, down_all_if_less_than_nodes
            ),
            DowningStrategy::KeepOldest { down_if_alone } => {
                write!(f, "keep-oldest(down-if-alone={})", down_if_alone)
            }
        }
    }
}

/// Why a decision downs what it downs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionReason {
    /// Exactly one side reached the static quorum
    QuorumReached,
    /// Both or neither side reached the static quorum
    QuorumIndeterminate,
    /// One side is strictly larger
    Majority,
    /// Equal sides, decided by the smallest address
    MajorityTieBreak,
    /// The referee's side survives
    RefereeSideSurvives,
    /// The referee's side is below `down-all-if-less-than-nodes`
    RefereeSideTooSmall,
    /// The referee is on neither side
    RefereeMissing,
    /// The oldest member's side survives
    OldestSideSurvives,
    /// The oldest member is alone and downs itself
    OldestAlone,
    /// Membership did not settle within the instability budget
    Unstable,
    /// No participating node is unreachable
    NoUnreachableParticipants,
}

impl DecisionReason {
    /// Paths that are allowed to down every participating node
    pub fn is_safe_default(self) -> bool {
        matches!(
            self,
            DecisionReason::QuorumIndeterminate
                | DecisionReason::RefereeSideTooSmall
                | DecisionReason::RefereeMissing
                | DecisionReason::Unstable
        )
    }
}

/// Result of evaluating a strategy against one observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StrategyDecision {
    /// Strategy name
    pub strategy: String,
    /// View version the observation was taken at
    pub version: u64,
    /// Nodes to down
    pub down_set: BTreeSet<NodeAddress>,
    pub reason: DecisionReason,
}

impl StrategyDecision {
    pub fn is_empty(&self) -> bool {
        self.down_set.is_empty()
    }

    pub fn downs(&self, address: &NodeAddress) -> bool {
        self.down_set.contains(address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    DownReachable,
    DownUnreachable,
    DownAll,
    DownNone,
}

/// Participating nodes of both sides, each ordered by address
struct Sides<'a> {
    reachable: Vec<&'a ClusterNode>,
    unreachable: Vec<&'a ClusterNode>,
}

impl<'a> Sides<'a> {
    fn new(observation: &'a PartitionObservation, roles: &RoleFilter) -> Self {
        Self {
            reachable: roles.participants(observation.reachable.values()),
            unreachable: roles.participants(observation.unreachable.values()),
        }
    }

    fn down_set(&self, verdict: Verdict) -> BTreeSet<NodeAddress> {
        let reachable = self.reachable.iter().map(|n| n.address.clone());
        let unreachable = self.unreachable.iter().map(|n| n.address.clone());
        match verdict {
            Verdict::DownReachable => reachable.collect(),
            Verdict::DownUnreachable => unreachable.collect(),
            Verdict::DownAll => reachable.chain(unreachable).collect(),
            Verdict::DownNone => BTreeSet::new(),
        }
    }
}

/// Decide which nodes to down for the given observation.
///
/// Total over its input: when no survivor side can be established the
/// decision falls back to downing every participating node.
pub fn decide(
    strategy: &DowningStrategy,
    observation: &PartitionObservation,
    roles: &RoleFilter,
) -> StrategyDecision {
    let sides = Sides::new(observation, roles);

    let (verdict, reason) = if sides.unreachable.is_empty() {
        (Verdict::DownNone, DecisionReason::NoUnreachableParticipants)
    } else {
        match strategy {
            DowningStrategy::StaticQuorum { min_size } => static_quorum(&sides, *min_size),
            DowningStrategy::KeepMajority => keep_majority(&sides),
            DowningStrategy::KeepReferee {
                referee,
                down_all_if_less_than_nodes,
            } => keep_referee(&sides, observation, referee, *down_all_if_less_than_nodes),
            DowningStrategy::KeepOldest { down_if_alone } => keep_oldest(&sides, *down_if_alone),
        }
    };

    StrategyDecision {
        strategy: strategy.name().to_string(),
        version: observation.version,
        down_set: sides.down_set(verdict),
        reason,
    }
}

/// Down every participating node, used when membership never settles
pub fn decide_down_all(
    strategy: &DowningStrategy,
    observation: &PartitionObservation,
    roles: &RoleFilter,
) -> StrategyDecision {
    let sides = Sides::new(observation, roles);
    StrategyDecision {
        strategy: strategy.name().to_string(),
        version: observation.version,
        down_set: sides.down_set(Verdict::DownAll),
        reason: DecisionReason::Unstable,
    }
}

fn static_quorum(sides: &Sides<'_>, min_size: usize) -> (Verdict, DecisionReason) {
    let reachable_ok = sides.reachable.len() >= min_size;
    let unreachable_ok = sides.unreachable.len() >= min_size;
    match (reachable_ok, unreachable_ok) {
        (true, false) => (Verdict::DownUnreachable, DecisionReason::QuorumReached),
        (false, true) => (Verdict::DownReachable, DecisionReason::QuorumReached),
        _ => (Verdict::DownAll, DecisionReason::QuorumIndeterminate),
    }
}

/// Smallest side that is a strict majority of `participants`
pub fn majority_quorum(participants: usize) -> usize {
    participants / 2 + 1
}

fn keep_majority(sides: &Sides<'_>) -> (Verdict, DecisionReason) {
    let quorum = majority_quorum(sides.reachable.len() + sides.unreachable.len());
    if sides.reachable.len() >= quorum {
        return (Verdict::DownUnreachable, DecisionReason::Majority);
    }
    if sides.unreachable.len() >= quorum {
        return (Verdict::DownReachable, DecisionReason::Majority);
    }

    // Only two equal halves miss the quorum; the side holding the smallest address wins
    let reachable_min = sides.reachable.first().map(|n| &n.address);
    let unreachable_min = sides.unreachable.first().map(|n| &n.address);
    if reachable_min < unreachable_min {
        (Verdict::DownUnreachable, DecisionReason::MajorityTieBreak)
    } else {
        (Verdict::DownReachable, DecisionReason::MajorityTieBreak)
    }
}

fn keep_referee(
    sides: &Sides<'_>,
    observation: &PartitionObservation,
    referee: &NodeAddress,
    down_all_if_less_than_nodes: usize,
) -> (Verdict, DecisionReason) {
    let (survivors, verdict) = if observation.reachable.contains_key(referee) {
        (sides.reachable.len(), Verdict::DownUnreachable)
    } else if observation.unreachable.contains_key(referee) {
        (sides.unreachable.len(), Verdict::DownReachable)
    } else {
        return (Verdict::DownAll, DecisionReason::RefereeMissing);
    };

    if survivors < down_all_if_less_than_nodes {
        (Verdict::DownAll, DecisionReason::RefereeSideTooSmall)
    } else {
        (verdict, DecisionReason::RefereeSideSurvives)
    }
}

fn keep_oldest(sides: &Sides<'_>, down_if_alone: bool) -> (Verdict, DecisionReason) {
    let oldest = sides
        .reachable
        .iter()
        .chain(sides.unreachable.iter())
        .min_by(|a, b| a.age_key().cmp(&b.age_key()));
    let Some(oldest) = oldest else {
        return (Verdict::DownNone, DecisionReason::NoUnreachableParticipants);
    };

    let oldest_reachable = sides.reachable.iter().any(|n| n.address == oldest.address);
    let (own, other) = if oldest_reachable {
        (&sides.reachable, &sides.unreachable)
    } else {
        (&sides.unreachable, &sides.reachable)
    };
    let alone = own.len() == 1 && !other.is_empty();

    let down_own_side = down_if_alone && alone;
    let verdict = match (oldest_reachable, down_own_side) {
        (true, false) | (false, true) => Verdict::DownUnreachable,
        (true, true) | (false, false) => Verdict::DownReachable,
    };
    let reason = if down_own_side {
        DecisionReason::OldestAlone
    } else {
        DecisionReason::OldestSideSurvives
    };
    (verdict, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeStatus;

    fn node(address: &str, joined_at: u64) -> ClusterNode {
        ClusterNode::new(NodeAddress::new(address).unwrap(), joined_at).with_status(NodeStatus::Up)
    }

    fn split(reachable: &[(&str, u64)], unreachable: &[(&str, u64)]) -> PartitionObservation {
        PartitionObservation::new(
            1,
            reachable.iter().map(|(a, j)| node(a, *j)),
            unreachable
                .iter()
                .map(|(a, j)| node(a, *j).with_status(NodeStatus::Unreachable)),
        )
    }

    fn addresses(list: &[&str]) -> BTreeSet<NodeAddress> {
        list.iter().map(|a| NodeAddress::new(*a).unwrap()).collect()
    }

    #[test]
    fn test_static_quorum_downs_minority() {
        let observation = split(&[("a:1", 1), ("b:1", 2)], &[("c:1", 3), ("d:1", 4), ("e:1", 5)]);
        let decision = decide(&DowningStrategy::StaticQuorum { min_size: 3 }, &observation, &RoleFilter::all());
        assert_eq!(decision.down_set, addresses(&["a:1", "b:1"]));
        assert_eq!(decision.reason, DecisionReason::QuorumReached);
        assert_eq!(decision.strategy, "static-quorum");
    }

    #[test]
    fn test_static_quorum_indeterminate_downs_everyone() {
        let observation = split(&[("a:1", 1), ("b:1", 2)], &[("c:1", 3), ("d:1", 4)]);
        let decision = decide(&DowningStrategy::StaticQuorum { min_size: 3 }, &observation, &RoleFilter::all());
        assert_eq!(decision.down_set, addresses(&["a:1", "b:1", "c:1", "d:1"]));
        assert_eq!(decision.reason, DecisionReason::QuorumIndeterminate);
        assert!(decision.reason.is_safe_default());

        // both sides qualifying is just as ambiguous
        let decision = decide(&DowningStrategy::StaticQuorum { min_size: 2 }, &observation, &RoleFilter::all());
        assert_eq!(decision.reason, DecisionReason::QuorumIndeterminate);
    }

    #[test]
    fn test_keep_majority() {
        let observation = split(&[("a:1", 1), ("b:1", 2), ("c:1", 3)], &[("d:1", 4), ("e:1", 5)]);
        let decision = decide(&DowningStrategy::KeepMajority, &observation, &RoleFilter::all());
        assert_eq!(decision.down_set, addresses(&["d:1", "e:1"]));
        assert_eq!(decision.reason, DecisionReason::Majority);

        let observation = split(&[("a:1", 1)], &[("b:1", 2), ("c:1", 3)]);
        let decision = decide(&DowningStrategy::KeepMajority, &observation, &RoleFilter::all());
        assert_eq!(decision.down_set, addresses(&["a:1"]));
    }

    #[test]
    fn test_majority_quorum() {
        assert_eq!(majority_quorum(1), 1);
        assert_eq!(majority_quorum(4), 3);
        assert_eq!(majority_quorum(5), 3);
        assert_eq!(majority_quorum(6), 4);
    }

    #[test]
    fn test_keep_majority_tie_goes_to_smallest_address() {
        let left = split(&[("b:1", 1), ("c:1", 2)], &[("a:1", 3), ("d:1", 4)]);
        let right = split(&[("a:1", 3), ("d:1", 4)], &[("b:1", 1), ("c:1", 2)]);

        let from_left = decide(&DowningStrategy::KeepMajority, &left, &RoleFilter::all());
        let from_right = decide(&DowningStrategy::KeepMajority, &right, &RoleFilter::all());

        assert_eq!(from_left.down_set, addresses(&["b:1", "c:1"]));
        assert_eq!(from_left.down_set, from_right.down_set);
        assert_eq!(from_left.reason, DecisionReason::MajorityTieBreak);
    }

    #[test]
    fn test_keep_referee() {
        let referee = NodeAddress::new("d:1").unwrap();
        let strategy = DowningStrategy::KeepReferee {
            referee,
            down_all_if_less_than_nodes: 1,
        };
        let observation = split(&[("a:1", 1), ("b:1", 2)], &[("c:1", 3), ("d:1", 4), ("e:1", 5)]);
        let decision = decide(&strategy, &observation, &RoleFilter::all());
        assert_eq!(decision.down_set, addresses(&["a:1", "b:1"]));
        assert_eq!(decision.reason, DecisionReason::RefereeSideSurvives);
    }

    #[test]
    fn test_keep_referee_small_side_downs_itself() {
        let strategy = DowningStrategy::KeepReferee {
            referee: NodeAddress::new("a:1").unwrap(),
            down_all_if_less_than_nodes: 3,
        };
        let observation = split(&[("a:1", 1), ("b:1", 2)], &[("c:1", 3), ("d:1", 4), ("e:1", 5)]);
        let decision = decide(&strategy, &observation, &RoleFilter::all());
        assert_eq!(decision.down_set.len(), 5);
        assert_eq!(decision.reason, DecisionReason::RefereeSideTooSmall);
    }

    #[test]
    fn test_keep_referee_missing() {
        let strategy = DowningStrategy::KeepReferee {
            referee: NodeAddress::new("z:1").unwrap(),
            down_all_if_less_than_nodes: 1,
        };
        let observation = split(&[("a:1", 1)], &[("b:1", 2)]);
        let decision = decide(&strategy, &observation, &RoleFilter::all());
        assert_eq!(decision.down_set, addresses(&["a:1", "b:1"]));
        assert_eq!(decision.reason, DecisionReason::RefereeMissing);
    }

    #[test]
    fn test_keep_oldest_side_survives_regardless_of_size() {
        let strategy = DowningStrategy::KeepOldest { down_if_alone: true };
        let observation = split(&[("a:1", 1), ("b:1", 2)], &[("c:1", 3), ("d:1", 4), ("e:1", 5)]);
        let decision = decide(&strategy, &observation, &RoleFilter::all());
        assert_eq!(decision.down_set, addresses(&["c:1", "d:1", "e:1"]));
        assert_eq!(decision.reason, DecisionReason::OldestSideSurvives);
    }

    #[test]
    fn test_keep_oldest_alone_downs_itself() {
        let strategy = DowningStrategy::KeepOldest { down_if_alone: true };
        // seen from the isolated oldest node and from the rest
        let isolated = split(&[("a:1", 1)], &[("b:1", 2), ("c:1", 3), ("d:1", 4), ("e:1", 5)]);
        let rest = split(&[("b:1", 2), ("c:1", 3), ("d:1", 4), ("e:1", 5)], &[("a:1", 1)]);

        for observation in [isolated, rest] {
            let decision = decide(&strategy, &observation, &RoleFilter::all());
            assert_eq!(decision.down_set, addresses(&["a:1"]));
            assert_eq!(decision.reason, DecisionReason::OldestAlone);
        }

        let keep_alone = DowningStrategy::KeepOldest { down_if_alone: false };
        let observation = split(&[("a:1", 1)], &[("b:1", 2), ("c:1", 3)]);
        let decision = decide(&keep_alone, &observation, &RoleFilter::all());
        assert_eq!(decision.down_set, addresses(&["b:1", "c:1"]));
    }

    #[test]
    fn test_role_scope_ignores_other_roles() {
        let backend = |a: &str, j: u64| node(a, j).with_roles(["backend"]);
        let observation = PartitionObservation::new(
            3,
            vec![backend("a:1", 1), node("f:1", 2), node("g:1", 3), node("h:1", 4)],
            vec![
                backend("b:1", 5).with_status(NodeStatus::Unreachable),
                backend("c:1", 6).with_status(NodeStatus::Unreachable),
            ],
        );
        let roles = RoleFilter::new(Some("backend".to_string()));
        let decision = decide(&DowningStrategy::KeepMajority, &observation, &roles);

        // only backends count: 1 vs 2
        assert_eq!(decision.down_set, addresses(&["a:1"]));
        assert_eq!(decision.version, 3);

        let unscoped = decide(&DowningStrategy::KeepMajority, &observation, &RoleFilter::all());
        assert_eq!(unscoped.down_set, addresses(&["b:1", "c:1"]));
    }

    #[test]
    fn test_no_unreachable_participants_downs_nobody() {
        let observation = PartitionObservation::new(
            1,
            vec![node("a:1", 1).with_roles(["backend"])],
            vec![node("b:1", 2).with_status(NodeStatus::Unreachable)],
        );
        let roles = RoleFilter::new(Some("backend".to_string()));
        let decision = decide(&DowningStrategy::KeepMajority, &observation, &roles);
        assert!(decision.is_empty());
        assert_eq!(decision.reason, DecisionReason::NoUnreachableParticipants);
    }

    #[test]
    fn test_down_all_for_unstable_membership() {
        let observation = split(&[("a:1", 1)], &[("b:1", 2)]);
        let decision = decide_down_all(&DowningStrategy::KeepMajority, &observation, &RoleFilter::all());
        assert_eq!(decision.down_set, addresses(&["a:1", "b:1"]));
        assert_eq!(decision.reason, DecisionReason::Unstable);
    }

    #[test]
    fn test_strategy_display() {
        assert_eq!(
            DowningStrategy::StaticQuorum { min_size: 3 }.to_string(),
            "static-quorum(min-size=3)"
        );
        assert_eq!(DowningStrategy::KeepOldest { down_if_alone: true }.name(), "keep-oldest");
    }
}
