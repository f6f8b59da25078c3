//! Downing executor
//!
//! Applies decisions through the membership layer's down-command. Each view
//! version is executed at most once: the record store is consulted and
//! updated under a single guard, so concurrent or repeated calls for the same
//! version collapse into one execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::metrics::ResolverMetrics;
use super::record::{DowningRecord, DowningRecordStore, RecordStatus};
use super::strategy::StrategyDecision;
use crate::error::{ResolverError, ResolverResult};
use crate::types::NodeAddress;

/// Down-command exposed by the membership layer
#[async_trait]
pub trait DowningProvider: Send + Sync {
    /// Down a remote member.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure when the command could not be
    /// delivered or acknowledged. The executor retries it.
    async fn down(&self, address: &NodeAddress) -> Result<(), String>;
}

/// Bounded exponential backoff for down-commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per member, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// What an `execute` call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Down-commands were issued and the record is Applied
    Applied {
        /// Remote members downed
        downed: usize,
        /// The local member is part of the down-set and must stop participating
        self_downed: bool,
    },
    /// The version already has an Applied record
    AlreadyApplied,
    /// Empty down-set, nothing to do
    Skipped,
}

/// Issues down-commands for decisions, exactly once per view version
pub struct DowningExecutor {
    self_address: NodeAddress,
    provider: Arc<dyn DowningProvider>,
    records: Arc<dyn DowningRecordStore>,
    retry: RetryPolicy,
    metrics: Arc<RwLock<ResolverMetrics>>,
    guard: Mutex<()>,
}

impl DowningExecutor {
    pub fn new(
        self_address: NodeAddress,
        provider: Arc<dyn DowningProvider>,
        records: Arc<dyn DowningRecordStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            self_address,
            provider,
            records,
            retry,
            metrics: Arc::new(RwLock::new(ResolverMetrics::new())),
            guard: Mutex::new(()),
        }
    }

    /// Share a metrics handle with the rest of the resolver
    pub fn with_metrics(mut self, metrics: Arc<RwLock<ResolverMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn records(&self) -> &Arc<dyn DowningRecordStore> {
        &self.records
    }

    /// Apply a decision.
    ///
    /// # Errors
    ///
    /// [`ResolverError::ExecutionExhausted`] when a member could not be downed
    /// within the retry ceiling; the record is left Failed. Storage errors are
    /// passed through.
    pub async fn execute(&self, decision: &StrategyDecision) -> ResolverResult<ExecutionOutcome> {
        if decision.is_empty() {
            debug!(version = decision.version, "empty down-set, nothing to execute");
            return Ok(ExecutionOutcome::Skipped);
        }

        let _guard = self.guard.lock().await;

        let mut record = match self.records.load(decision.version)? {
            Some(existing) if existing.status == RecordStatus::Applied => {
                debug!(version = decision.version, "decision already applied");
                return Ok(ExecutionOutcome::AlreadyApplied);
            }
            Some(existing) if existing.down_set == decision.down_set => {
                info!(version = decision.version, status = %existing.status, "resuming downing record");
                existing.with_status(RecordStatus::Pending)
            }
            _ => DowningRecord::pending(decision),
        };
        self.records.save(&record)?;

        let remote: Vec<NodeAddress> = decision
            .down_set
            .iter()
            .filter(|address| **address != self.self_address)
            .cloned()
            .collect();

        for address in &remote {
            if let Err(err) = self.down_with_retry(address, &mut record).await {
                record = record.with_status(RecordStatus::Failed);
                self.records.save(&record)?;
                self.metrics.write().executions_failed += 1;
                error!(
                    version = decision.version,
                    %address,
                    attempts = record.attempts,
                    error = %err,
                    "downing exhausted its retries; split-brain safety is no longer guaranteed"
                );
                return Err(ResolverError::ExecutionExhausted {
                    version: decision.version,
                    attempts: record.attempts,
                    reason: err.to_string(),
                });
            }
        }

        let record = record.with_status(RecordStatus::Applied);
        self.records.save(&record)?;

        let self_downed = decision.downs(&self.self_address);
        info!(
            version = decision.version,
            downed = remote.len(),
            self_downed,
            "downing decision applied"
        );
        Ok(ExecutionOutcome::Applied {
            downed: remote.len(),
            self_downed,
        })
    }

    async fn down_with_retry(&self, address: &NodeAddress, record: &mut DowningRecord) -> ResolverResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            record.attempts += 1;
            match self.provider.down(address).await {
                Ok(()) => {
                    self.metrics.write().downs_issued += 1;
                    debug!(%address, attempt, "down command acknowledged");
                    return Ok(());
                }
                Err(reason) => {
                    let err = ResolverError::TransientCommandFailure {
                        address: address.clone(),
                        reason,
                    };
                    if attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    self.metrics.write().down_retries += 1;
                    let delay = self.retry.backoff(attempt);
                    warn!(error = %err, attempt, ?delay, "down command failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::record::InMemoryRecordStore;
    use crate::cluster::strategy::DecisionReason;
    use parking_lot::Mutex as SyncMutex;

    /// Provider failing the first `failures` calls per address
    #[derive(Default)]
    struct ScriptedProvider {
        failures: u32,
        calls: SyncMutex<Vec<NodeAddress>>,
    }

    impl ScriptedProvider {
        fn failing(failures: u32) -> Self {
            Self {
                failures,
                ..Default::default()
            }
        }

        fn calls_for(&self, address: &str) -> usize {
            self.calls.lock().iter().filter(|a| a.as_str() == address).count()
        }
    }

    #[async_trait]
    impl DowningProvider for ScriptedProvider {
        async fn down(&self, address: &NodeAddress) -> Result<(), String> {
            let mut calls = self.calls.lock();
            calls.push(address.clone());
            let seen = calls.iter().filter(|a| *a == address).count() as u32;
            if seen <= self.failures {
                Err("connection refused".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn addr(s: &str) -> NodeAddress {
        NodeAddress::new(s).unwrap()
    }

    fn decision(version: u64, down: &[&str]) -> StrategyDecision {
        StrategyDecision {
            strategy: "keep-majority".to_string(),
            version,
            down_set: down.iter().map(|a| addr(a)).collect(),
            reason: DecisionReason::Majority,
        }
    }

    fn executor(provider: Arc<ScriptedProvider>, retry: RetryPolicy) -> DowningExecutor {
        DowningExecutor::new(addr("a:1"), provider, Arc::new(InMemoryRecordStore::new()), retry)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(500));
        assert_eq!(retry.backoff(60), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_execute_is_idempotent_per_version() {
        let provider = Arc::new(ScriptedProvider::default());
        let executor = executor(provider.clone(), RetryPolicy::default());
        let decision = decision(4, &["b:1", "c:1"]);

        let first = executor.execute(&decision).await.unwrap();
        assert_eq!(first, ExecutionOutcome::Applied { downed: 2, self_downed: false });
        let second = executor.execute(&decision).await.unwrap();
        assert_eq!(second, ExecutionOutcome::AlreadyApplied);

        assert_eq!(provider.calls.lock().len(), 2);
        let records = executor.records().records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Applied);
    }

    #[tokio::test]
    async fn test_concurrent_calls_issue_commands_once() {
        let provider = Arc::new(ScriptedProvider::default());
        let executor = Arc::new(executor(provider.clone(), RetryPolicy::default()));
        let decision = decision(5, &["b:1"]);

        let (left, right) = tokio::join!(executor.execute(&decision), executor.execute(&decision));
        let outcomes = [left.unwrap(), right.unwrap()];
        assert!(outcomes.contains(&ExecutionOutcome::AlreadyApplied));
        assert_eq!(provider.calls_for("b:1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(ScriptedProvider::failing(2));
        let metrics = Arc::new(RwLock::new(ResolverMetrics::new()));
        let executor = executor(provider.clone(), RetryPolicy::default()).with_metrics(metrics.clone());

        let outcome = executor.execute(&decision(6, &["b:1"])).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Applied { downed: 1, self_downed: false });
        assert_eq!(provider.calls_for("b:1"), 3);
        assert_eq!(metrics.read().down_retries, 2);
        assert_eq!(metrics.read().downs_issued, 1);
        assert_eq!(executor.records().load(6).unwrap().unwrap().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_marks_record_failed() {
        let provider = Arc::new(ScriptedProvider::failing(u32::MAX));
        let retry = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let executor = executor(provider.clone(), retry);

        let err = executor.execute(&decision(7, &["b:1"])).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ResolverError::ExecutionExhausted { version: 7, attempts: 3, .. }));
        assert_eq!(provider.calls_for("b:1"), 3);
        assert_eq!(executor.records().load(7).unwrap().unwrap().status, RecordStatus::Failed);
    }

    #[tokio::test]
    async fn test_self_is_never_sent_a_command() {
        let provider = Arc::new(ScriptedProvider::default());
        let executor = executor(provider.clone(), RetryPolicy::default());

        let outcome = executor.execute(&decision(8, &["a:1", "b:1"])).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Applied { downed: 1, self_downed: true });
        assert_eq!(provider.calls_for("a:1"), 0);
    }

    #[tokio::test]
    async fn test_empty_decision_is_skipped() {
        let provider = Arc::new(ScriptedProvider::default());
        let executor = executor(provider.clone(), RetryPolicy::default());
        assert_eq!(executor.execute(&decision(9, &[])).await.unwrap(), ExecutionOutcome::Skipped);
        assert!(executor.records().load(9).unwrap().is_none());
    }
}
