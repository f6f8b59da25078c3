//! Split-brain resolution for cluster membership
//!
//! Every node runs the same pipeline against its own view:
//! membership events → view store → stability detector → strategy → executor.
//! There is no coordination between nodes; safety comes from every node
//! computing the same decision from the same converged observation.

pub mod membership;
pub mod stability;
pub mod strategy;
pub mod role;
pub mod executor;
pub mod record;
pub mod metrics;

pub use membership::*;
pub use stability::*;
pub use strategy::*;
pub use role::*;
pub use executor::*;
pub use record::*;
pub use metrics::*;

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SplitBrainConfig;
use crate::error::{ResolverError, ResolverResult};
use crate::types::{ClusterHealth, ClusterNode, NodeAddress};

const DECISION_CHANNEL_CAPACITY: usize = 64;

/// Resolver pipeline for one node
pub struct SplitBrainResolver {
    config: SplitBrainConfig,
    self_address: NodeAddress,
    initial_members: Vec<ClusterNode>,
    records: Arc<dyn DowningRecordStore>,
}

impl SplitBrainResolver {
    /// Create a resolver for the local node at `self_address`
    pub fn new(config: SplitBrainConfig, self_address: NodeAddress) -> Self {
        Self {
            config,
            self_address,
            initial_members: Vec::new(),
            records: Arc::new(InMemoryRecordStore::new()),
        }
    }

    /// Membership state at process start
    pub fn with_initial_members(mut self, members: Vec<ClusterNode>) -> Self {
        self.initial_members = members;
        self
    }

    /// Durable record store (in-memory by default)
    pub fn with_record_store(mut self, records: Arc<dyn DowningRecordStore>) -> Self {
        self.records = records;
        self
    }

    /// Validate the configuration and start the pipeline.
    ///
    /// # Errors
    ///
    /// [`ResolverError::ConfigurationInvalid`] before anything is spawned, or a
    /// storage error while loading the last downing record.
    pub async fn start(self, provider: Arc<dyn DowningProvider>) -> ResolverResult<ResolverHandle> {
        self.config.validate()?;
        let strategy = self.config.strategy()?;
        let roles = self.config.role_filter();

        let metrics = Arc::new(RwLock::new(ResolverMetrics::new()));
        let executor = DowningExecutor::new(
            self.self_address.clone(),
            provider,
            Arc::clone(&self.records),
            self.config.retry_policy(),
        )
        .with_metrics(Arc::clone(&metrics));

        let mut store = MembershipViewStore::from_snapshot(0, self.initial_members);
        let latest = self.records.latest()?;
        if let Some(record) = &latest {
            // decisions taken from now on must never share a version with an old record
            store = store.with_base_version(record.version + 1);
        }
        let resume = resumable_record(latest, &store.current(), self.records.as_ref())?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(store.current());
        let (health_tx, health_rx) = watch::channel(ClusterHealth::Healthy);
        let (decision_tx, _) = broadcast::channel(DECISION_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let detector = StabilityDetector::new(
            StabilitySettings {
                stable_after: self.config.stable_after,
                down_all_when_unstable: self.config.down_all_when_unstable,
            },
            signal_tx,
            Arc::clone(&metrics),
        );
        let (stability, detector_task) = detector.spawn();
        // a snapshot taken mid-partition starts its episode right away
        if store.current().has_unreachable() {
            stability.view_changed(store.current());
        }

        info!(
            node = %self.self_address,
            strategy = %strategy,
            role = ?roles.role(),
            stable_after = ?self.config.stable_after,
            version = store.current().version(),
            "split-brain resolver started"
        );

        let membership_task = tokio::spawn(
            MembershipLoop {
                store,
                view_tx,
                stability: stability.clone(),
                records: Arc::clone(&self.records),
                metrics: Arc::clone(&metrics),
            }
            .run(event_rx, shutdown_rx.clone()),
        );

        let decision_task = tokio::spawn(
            DecisionLoop {
                self_address: self.self_address.clone(),
                strategy,
                roles,
                executor,
                stability,
                events: event_tx.clone(),
                decisions: decision_tx.clone(),
                health: health_tx,
                metrics: Arc::clone(&metrics),
            }
            .run(signal_rx, resume, shutdown_rx),
        );

        Ok(ResolverHandle {
            events: event_tx,
            view: view_rx,
            decisions: decision_tx,
            health: health_rx,
            metrics,
            shutdown: shutdown_tx,
            tasks: vec![membership_task, decision_task, detector_task],
        })
    }
}

/// Decide what to do with the record left by a previous run
fn resumable_record(
    latest: Option<DowningRecord>,
    view: &MembershipView,
    records: &dyn DowningRecordStore,
) -> ResolverResult<Option<StrategyDecision>> {
    let Some(record) = latest else {
        return Ok(None);
    };
    if record.status == RecordStatus::Applied {
        return Ok(None);
    }
    if view.all_terminated(&record.down_set) {
        info!(version = record.version, "downing record confirmed by membership, marking applied");
        records.save(&record.with_status(RecordStatus::Applied))?;
        return Ok(None);
    }
    if view.has_unreachable() {
        warn!(version = record.version, status = %record.status, "resuming interrupted downing");
        return Ok(Some(record.decision()));
    }
    info!(version = record.version, "partition healed since the last run, not resuming downing");
    Ok(None)
}

/// Single writer of the membership view
struct MembershipLoop {
    store: MembershipViewStore,
    view_tx: watch::Sender<Arc<MembershipView>>,
    stability: StabilityHandle,
    records: Arc<dyn DowningRecordStore>,
    metrics: Arc<RwLock<ResolverMetrics>>,
}

impl MembershipLoop {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<MembershipEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                },
            }
        }
        debug!("membership loop stopped");
    }

    fn apply(&mut self, event: MembershipEvent) {
        match self.store.apply(&event) {
            Ok(Some(view)) => {
                self.metrics.write().events_applied += 1;
                self.view_tx.send_replace(Arc::clone(&view));
                if matches!(event, MembershipEvent::MemberRemoved(_) | MembershipEvent::MemberLeft(_)) {
                    self.prune_confirmed(&view);
                }
                self.stability.view_changed(view);
            }
            Ok(None) => {}
            Err(err) => {
                self.metrics.write().events_rejected += 1;
                warn!(error = %err, ?event, "membership event rejected");
            }
        }
    }

    /// Drop settled records (Applied or Failed) once every node in them is confirmed removed
    fn prune_confirmed(&self, view: &MembershipView) {
        let records = match self.records.records() {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "could not list downing records");
                return;
            }
        };
        for record in records {
            if record.status != RecordStatus::Pending && view.all_removed(&record.down_set) {
                match self.records.remove(record.version) {
                    Ok(()) => debug!(version = record.version, "downing record pruned"),
                    Err(err) => warn!(error = %err, version = record.version, "could not prune downing record"),
                }
            }
        }
    }
}

/// Turns stability signals into decisions and executes them one at a time
struct DecisionLoop {
    self_address: NodeAddress,
    strategy: DowningStrategy,
    roles: RoleFilter,
    executor: DowningExecutor,
    stability: StabilityHandle,
    events: mpsc::UnboundedSender<MembershipEvent>,
    decisions: broadcast::Sender<StrategyDecision>,
    health: watch::Sender<ClusterHealth>,
    metrics: Arc<RwLock<ResolverMetrics>>,
}

impl DecisionLoop {
    async fn run(
        self,
        mut signals: mpsc::UnboundedReceiver<StabilitySignal>,
        resume: Option<StrategyDecision>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Some(decision) = resume {
            self.publish(&decision, true);
            if !self.execute(&decision).await {
                return;
            }
        }

        loop {
            let signal = tokio::select! {
                _ = shutdown.changed() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            let decision = self.decide(&signal);
            let version = decision.version;
            let keep_running = self.execute(&decision).await;
            self.stability.settled(version);
            if !keep_running {
                break;
            }
        }
        debug!("decision loop stopped");
    }

    fn decide(&self, signal: &StabilitySignal) -> StrategyDecision {
        let observation = signal.observation();
        debug!(
            version = observation.version,
            reachable_ratio = observation.reachable_ratio(),
            "evaluating downing strategy"
        );
        let decision = match signal {
            StabilitySignal::Stable(observation) => decide(&self.strategy, observation, &self.roles),
            StabilitySignal::Unstable(observation) => decide_down_all(&self.strategy, observation, &self.roles),
        };
        self.publish(&decision, false);
        decision
    }

    /// Count, log and broadcast a decision. `resumed` marks one left behind by a previous run.
    fn publish(&self, decision: &StrategyDecision, resumed: bool) {
        self.metrics.write().record_decision(decision);

        if decision.reason.is_safe_default() {
            error!(
                version = decision.version,
                strategy = %decision.strategy,
                reason = ?decision.reason,
                down = decision.down_set.len(),
                resumed,
                "no survivor side could be established, downing all participating nodes"
            );
        } else {
            info!(
                version = decision.version,
                strategy = %decision.strategy,
                reason = ?decision.reason,
                down = ?decision.down_set,
                resumed,
                "split-brain decision"
            );
        }

        // no subscribers is fine
        let _ = self.decisions.send(decision.clone());
    }

    /// Returns `false` when the node must stop participating
    async fn execute(&self, decision: &StrategyDecision) -> bool {
        match self.executor.execute(decision).await {
            Ok(ExecutionOutcome::Applied { self_downed: true, .. }) => {
                warn!(node = %self.self_address, version = decision.version, "local node is downed, leaving the cluster");
                let _ = self.events.send(MembershipEvent::MemberDowned(self.self_address.clone()));
                self.health.send_replace(ClusterHealth::Downed);
                false
            }
            Ok(_) => true,
            Err(err) => {
                error!(error = %err, version = decision.version, "resolver cannot guarantee split-brain safety");
                self.health.send_replace(ClusterHealth::Unhealthy);
                false
            }
        }
    }
}

/// Handle to a running resolver
pub struct ResolverHandle {
    events: mpsc::UnboundedSender<MembershipEvent>,
    view: watch::Receiver<Arc<MembershipView>>,
    decisions: broadcast::Sender<StrategyDecision>,
    health: watch::Receiver<ClusterHealth>,
    metrics: Arc<RwLock<ResolverMetrics>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ResolverHandle {
    /// Feed for the membership layer's change events
    pub fn event_sender(&self) -> mpsc::UnboundedSender<MembershipEvent> {
        self.events.clone()
    }

    /// Enqueue one membership event
    pub fn publish(&self, event: MembershipEvent) -> ResolverResult<()> {
        self.events.send(event).map_err(|_| ResolverError::ResolverStopped)
    }

    /// Latest fully constructed view
    pub fn current_view(&self) -> Arc<MembershipView> {
        Arc::clone(&self.view.borrow())
    }

    /// Watch for view updates
    pub fn view_watch(&self) -> watch::Receiver<Arc<MembershipView>> {
        self.view.clone()
    }

    /// Stream of every decision taken, for audit
    pub fn subscribe_decisions(&self) -> broadcast::Receiver<StrategyDecision> {
        self.decisions.subscribe()
    }

    pub fn health(&self) -> ClusterHealth {
        *self.health.borrow()
    }

    pub fn health_watch(&self) -> watch::Receiver<ClusterHealth> {
        self.health.clone()
    }

    pub fn metrics(&self) -> ResolverMetrics {
        self.metrics.read().clone()
    }

    /// Stop all resolver tasks
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        drop(self.events);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
