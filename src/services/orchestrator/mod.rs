//! Monitor orchestration
//!
//! One task owns the whole decision-to-publish path. Two producers wake it:
//! position updates (a watch channel, so only the latest position is ever
//! seen) and the poll timer. Cycles run one at a time inside the loop body,
//! so triggers that arrive mid-cycle collapse into a single pending
//! re-evaluation.
//!
//! Cycle: `Idle -> Evaluating -> (Publishing | Skipping) -> Idle`
//! - Evaluating: authorization and position checks, directory snapshot,
//!   nearest-crossing decision
//! - Publishing: hand the decision to the publisher, unless a newer
//!   position arrived while evaluating (the cycle is then discarded)
//!
//! Skipped cycles never reach the publisher, so they do not count as
//! out-of-gate cycles. A session left up while positions are unavailable
//! expires at its `stale_at` on the host.


use crate::domain::types::{Authorization, CrossingRecord};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::position::PositionSource;
use crate::services::directory::CrossingDirectory;
use crate::services::evaluator::ProximityEvaluator;
use crate::services::publisher::{LiveSessionPublisher, PublishOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Commands from outside the monitor (HTTP control endpoint, embedders)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    /// Show a placeholder session immediately, then evaluate
    StartNow,
    /// The user dismissed the session
    EndSession,
    Shutdown,
}

impl MonitorCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorCommand::StartNow => "start_now",
            MonitorCommand::EndSession => "end_session",
            MonitorCommand::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Evaluating,
    Publishing,
    Skipping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoPosition,
    Unauthorized,
    NoCrossings,
    /// Nearest crossing is outside the gate and no session needs touching
    OutOfGate,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoPosition => "no_position",
            SkipReason::Unauthorized => "unauthorized",
            SkipReason::NoCrossings => "no_crossings",
            SkipReason::OutOfGate => "out_of_gate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published(PublishOutcome),
    Skipped(SkipReason),
    /// A newer position arrived mid-cycle; the result was discarded
    Superseded,
    /// The host rejected the call; retried on the next cycle
    PublishFailed,
}

/// What the run loop should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEffect {
    Continue,
    Evaluate,
    Stop,
}

pub struct MonitorOrchestrator {
    positions: Arc<dyn PositionSource>,
    directory: Arc<CrossingDirectory>,
    evaluator: ProximityEvaluator,
    publisher: Arc<LiveSessionPublisher>,
    commands: mpsc::Receiver<MonitorCommand>,
    poll_interval: Duration,
    freshness: Duration,
    state: CycleState,
    metrics: Arc<Metrics>,
}

impl MonitorOrchestrator {
    /// Build the orchestrator and the sender used to command it
    pub fn new(
        config: &Config,
        positions: Arc<dyn PositionSource>,
        directory: Arc<CrossingDirectory>,
        publisher: Arc<LiveSessionPublisher>,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::Sender<MonitorCommand>) {
        let (tx, rx) = mpsc::channel(16);
        let orchestrator = Self {
            positions,
            directory,
            evaluator: ProximityEvaluator::from_config(config),
            publisher,
            commands: rx,
            poll_interval: config.poll_interval(),
            freshness: config.freshness(),
            state: CycleState::Idle,
            metrics,
        };
        (orchestrator, tx)
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    fn transition(&mut self, next: CycleState) {
        trace!(from = ?self.state, to = ?next, "cycle_state");
        self.state = next;
    }

    /// Drive cycles until shutdown; ends the active session on the way out
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut positions = self.positions.subscribe();
        let mut positions_open = true;
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut pending = false;
        let mut force_refresh = false;

        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            freshness_secs = self.freshness.as_secs(),
            gate_threshold_m = self.evaluator.gate_threshold_m(),
            "monitor_started"
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                Some(command) = self.commands.recv() => {
                    match self.handle_command(command).await {
                        CommandEffect::Continue => {}
                        CommandEffect::Evaluate => pending = true,
                        CommandEffect::Stop => break,
                    }
                }

                _ = std::future::ready(()), if pending => {
                    pending = false;
                    let force = std::mem::take(&mut force_refresh);
                    let outcome = self.run_cycle(force).await;
                    debug!(outcome = ?outcome, forced = force, "cycle_complete");
                }

                changed = positions.changed(), if positions_open => {
                    match changed {
                        Ok(()) => {
                            positions.borrow_and_update();
                            pending = true;
                        }
                        Err(_) => {
                            warn!("position_source_closed");
                            positions_open = false;
                        }
                    }
                }

                _ = poll.tick() => {
                    pending = true;
                    force_refresh = true;
                }
            }
        }

        info!("monitor_stopping");
        match self.publisher.end().await {
            Ok(PublishOutcome::Ended) => info!("session_ended_on_shutdown"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "session_end_on_shutdown_failed"),
        }
    }

    /// Run one evaluation cycle; always returns to `Idle`
    pub async fn run_cycle(&mut self, force_refresh: bool) -> CycleOutcome {
        let start = Instant::now();
        self.transition(CycleState::Evaluating);

        let outcome = self.evaluate_and_publish(force_refresh).await;

        match outcome {
            CycleOutcome::Skipped(reason) => {
                self.metrics.record_cycle_skipped();
                debug!(reason = reason.as_str(), "cycle_skipped");
            }
            CycleOutcome::Superseded => {
                self.metrics.record_cycle_superseded();
                debug!("cycle_superseded");
            }
            CycleOutcome::Published(PublishOutcome::Unchanged | PublishOutcome::Idle) => {}
            CycleOutcome::Published(result) => {
                debug!(result = result.as_str(), "cycle_published");
            }
            CycleOutcome::PublishFailed => {}
        }

        self.metrics.record_cycle(start.elapsed().as_micros() as u64);
        self.transition(CycleState::Idle);
        outcome
    }

    async fn evaluate_and_publish(&mut self, force_refresh: bool) -> CycleOutcome {
        let authorization = self.positions.authorization();
        if authorization != Authorization::Authorized {
            self.transition(CycleState::Skipping);
            return CycleOutcome::Skipped(SkipReason::Unauthorized);
        }
        let Some(position) = self.positions.latest() else {
            self.transition(CycleState::Skipping);
            return CycleOutcome::Skipped(SkipReason::NoPosition);
        };

        let result = if force_refresh {
            self.directory.refresh().await
        } else {
            self.directory.current_or_refresh(self.freshness).await
        };
        // Failures are already logged by the directory; the fallback is still usable
        let snapshot = result.unwrap_or_else(|failure| failure.fallback);
        trace!(
            records = snapshot.len(),
            freshness = snapshot.freshness.as_str(),
            "cycle_snapshot"
        );

        // A fetch may have taken a while; a newer position gets its own cycle
        if self.positions.latest().is_some_and(|latest| latest.timestamp > position.timestamp) {
            self.transition(CycleState::Skipping);
            return CycleOutcome::Superseded;
        }

        let Some(decision) = self.evaluator.evaluate(&position, &snapshot) else {
            self.transition(CycleState::Skipping);
            return CycleOutcome::Skipped(SkipReason::NoCrossings);
        };

        if !decision.within_gate && self.publisher.active().await.is_none() {
            self.transition(CycleState::Skipping);
            return CycleOutcome::Skipped(SkipReason::OutOfGate);
        }

        self.transition(CycleState::Publishing);
        match self.publisher.publish(&decision).await {
            Ok(result) => CycleOutcome::Published(result),
            // Logged and counted by the publisher
            Err(_) => CycleOutcome::PublishFailed,
        }
    }

    /// Apply one external command
    pub async fn handle_command(&mut self, command: MonitorCommand) -> CommandEffect {
        info!(command = command.as_str(), "monitor_command");
        match command {
            MonitorCommand::StartNow => {
                let snapshot = self.directory.snapshot();
                let placeholder =
                    snapshot.records.first().cloned().unwrap_or_else(CrossingRecord::placeholder);
                if let Err(e) = self.publisher.start_manual(&placeholder).await {
                    warn!(error = %e, "manual_start_failed");
                }
                CommandEffect::Evaluate
            }
            MonitorCommand::EndSession => {
                if let Err(e) = self.publisher.end().await {
                    warn!(error = %e, "manual_end_failed");
                }
                CommandEffect::Continue
            }
            MonitorCommand::Shutdown => CommandEffect::Stop,
        }
    }
}
