//! Stability detection
//!
//! Debounces membership changes. A decision is only taken once the view has
//! stopped changing for `stable-after`. The detector is a single task that
//! owns its timer: view changes, settle notifications and timer expiry are
//! handled one at a time, so a timer fire can never race a reset.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::membership::{MembershipView, PartitionObservation};
use super::metrics::ResolverMetrics;

/// Input queue of the detector task
#[derive(Debug, Clone)]
pub enum DetectorInput {
    /// A new view was published
    ViewChanged(Arc<MembershipView>),
    /// The decision taken for this version has been executed (or skipped)
    DecisionSettled(u64),
}

/// Emitted when an episode ends in a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilitySignal {
    /// The view did not change for `stable-after`
    Stable(PartitionObservation),
    /// The view kept changing past the instability budget
    Unstable(PartitionObservation),
}

impl StabilitySignal {
    pub fn observation(&self) -> &PartitionObservation {
        match self {
            StabilitySignal::Stable(observation) | StabilitySignal::Unstable(observation) => observation,
        }
    }
}

/// Per-episode state
#[derive(Debug, Clone)]
pub enum DetectorState {
    /// No partition episode in progress
    Stable,
    /// Waiting for the view to settle
    Pending {
        view: Arc<MembershipView>,
        deadline: Instant,
        episode_start: Instant,
    },
    /// A decision was emitted for `version` and is being executed
    Decided {
        version: u64,
        latest: Option<Arc<MembershipView>>,
    },
}

/// Debounce timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilitySettings {
    pub stable_after: Duration,
    pub down_all_when_unstable: Option<Duration>,
}

/// Sender side of the detector queue
#[derive(Debug, Clone)]
pub struct StabilityHandle {
    inputs: mpsc::UnboundedSender<DetectorInput>,
}

impl StabilityHandle {
    /// Returns `false` once the detector task is gone
    pub fn view_changed(&self, view: Arc<MembershipView>) -> bool {
        self.inputs.send(DetectorInput::ViewChanged(view)).is_ok()
    }

    pub fn settled(&self, version: u64) -> bool {
        self.inputs.send(DetectorInput::DecisionSettled(version)).is_ok()
    }
}

pub struct StabilityDetector {
    settings: StabilitySettings,
    state: DetectorState,
    signals: mpsc::UnboundedSender<StabilitySignal>,
    metrics: Arc<RwLock<ResolverMetrics>>,
}

impl StabilityDetector {
    pub fn new(
        settings: StabilitySettings,
        signals: mpsc::UnboundedSender<StabilitySignal>,
        metrics: Arc<RwLock<ResolverMetrics>>,
    ) -> Self {
        Self {
            settings,
            state: DetectorState::Stable,
            signals,
            metrics,
        }
    }

    /// Start the detector task. It ends when every handle is dropped.
    pub fn spawn(self) -> (StabilityHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (StabilityHandle { inputs: tx }, task)
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<DetectorInput>) {
        loop {
            let deadline = self.deadline();
            let timer = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                input = inputs.recv() => match input {
                    Some(input) => self.handle(input, Instant::now()),
                    None => break,
                },
                _ = timer => self.on_timer(),
            }
        }
        debug!("stability detector stopped");
    }

    fn deadline(&self) -> Option<Instant> {
        match &self.state {
            DetectorState::Pending { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    pub fn handle(&mut self, input: DetectorInput, now: Instant) {
        match input {
            DetectorInput::ViewChanged(view) => self.on_view_changed(view, now),
            DetectorInput::DecisionSettled(version) => self.on_settled(version, now),
        }
    }

    fn on_view_changed(&mut self, view: Arc<MembershipView>, now: Instant) {
        let state = std::mem::replace(&mut self.state, DetectorState::Stable);
        self.state = match state {
            DetectorState::Stable => self.start_episode(view, now),
            DetectorState::Pending { episode_start, .. } => {
                if !view.has_unreachable() {
                    info!(version = view.version(), "partition healed before stable-after, episode cancelled");
                    self.metrics.write().episodes_cancelled += 1;
                    DetectorState::Stable
                } else if self.unstable_for_too_long(episode_start, now) {
                    warn!(
                        version = view.version(),
                        unstable_for = ?now.duration_since(episode_start),
                        "membership did not settle, downing all"
                    );
                    self.emit(StabilitySignal::Unstable(view.observe()));
                    DetectorState::Decided {
                        version: view.version(),
                        latest: None,
                    }
                } else {
                    debug!(version = view.version(), "membership changed, stability timer reset");
                    DetectorState::Pending {
                        view,
                        deadline: now + self.settings.stable_after,
                        episode_start,
                    }
                }
            }
            DetectorState::Decided { version, .. } => DetectorState::Decided {
                version,
                latest: Some(view),
            },
        };
    }

    fn on_settled(&mut self, settled: u64, now: Instant) {
        let state = std::mem::replace(&mut self.state, DetectorState::Stable);
        self.state = match state {
            DetectorState::Decided { version, latest } if version == settled => match latest {
                Some(view) => self.start_episode(view, now),
                None => DetectorState::Stable,
            },
            other => {
                debug!(settled, "settle notification does not match the current episode");
                other
            }
        };
    }

    fn on_timer(&mut self) {
        let state = std::mem::replace(&mut self.state, DetectorState::Stable);
        self.state = match state {
            DetectorState::Pending { view, .. } => {
                info!(version = view.version(), "membership stable, deciding");
                self.emit(StabilitySignal::Stable(view.observe()));
                DetectorState::Decided {
                    version: view.version(),
                    latest: None,
                }
            }
            other => other,
        };
    }

    fn start_episode(&self, view: Arc<MembershipView>, now: Instant) -> DetectorState {
        if !view.has_unreachable() {
            return DetectorState::Stable;
        }
        debug!(version = view.version(), "unreachable members observed, waiting for stability");
        DetectorState::Pending {
            view,
            deadline: now + self.settings.stable_after,
            episode_start: now,
        }
    }

    fn unstable_for_too_long(&self, episode_start: Instant, now: Instant) -> bool {
        match self.settings.down_all_when_unstable {
            Some(extra) => now.duration_since(episode_start) >= self.settings.stable_after + extra,
            None => false,
        }
    }

    fn emit(&self, signal: StabilitySignal) {
        if self.signals.send(signal).is_err() {
            debug!("stability signal dropped, resolver is gone");
        }
    }
}
