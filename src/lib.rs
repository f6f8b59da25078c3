//! # splitbrain: split-brain resolution for cluster membership
//!
//! When a network partition splits a cluster, every side believes the other
//! side has failed. The resolver waits until the membership view has been
//! stable for a configured period, then applies a deterministic downing
//! strategy so that exactly one side survives and the other side is downed.
//!
//! ```no_run
//! use std::sync::Arc;
//! use splitbrain::{SplitBrainConfig, SplitBrainResolver, NodeAddress};
//! # use splitbrain::cluster::DowningProvider;
//! # async fn run(provider: Arc<dyn DowningProvider>) -> splitbrain::ResolverResult<()> {
//! let config = SplitBrainConfig::from_file("splitbrain.toml")?;
//! let resolver = SplitBrainResolver::new(config, NodeAddress::new("10.0.0.1:2552")?)
//!     .start(provider)
//!     .await?;
//! println!("health: {}", resolver.health());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod types;

pub use cluster::{
    decide, decide_down_all, DecisionReason, DowningExecutor, DowningProvider, DowningRecord,
    DowningRecordStore, DowningStrategy, ExecutionOutcome, InMemoryRecordStore, MembershipEvent,
    MembershipView, PartitionObservation, ResolverHandle, ResolverMetrics, RetryPolicy, RoleFilter,
    SplitBrainResolver, SqliteRecordStore, StrategyDecision,
};
pub use config::{SplitBrainConfig, StrategyName};
pub use error::{ResolverError, ResolverResult};
pub use types::{ClusterHealth, ClusterNode, NodeAddress, NodeStatus};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
