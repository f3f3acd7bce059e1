//! Live session lifecycle
//!
//! Holds the one and only live session handle. All host calls happen while
//! the state lock is held, so a crossing switch (end old, then create new)
//! can never interleave with another publish and two sessions never exist
//! at once.
//!
//! Decision handling:
//! - in gate, same crossing (or an unadopted manual session): update in place
//! - in gate, different crossing: end, then create
//! - out of gate: hold for `grace_cycles` decisions, end on the next one
//! - after an explicit end, the dismissed crossing is not shown again until
//!   it leaves the gate or another crossing becomes nearest
//!
//! Host failures leave the tracked state untouched so the next cycle retries.

use crate::domain::types::{
    CrossingId, CrossingRecord, LiveSession, ProximityDecision, SessionAttributes, SessionContent,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::session_host::{PublishError, SessionHost};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A new session was created
    Created,
    /// The active session was updated in place
    Updated,
    /// Nothing changed; no host call was made
    Unchanged,
    /// The old session was ended and a new one created
    Switched,
    /// Out of gate, but still inside the grace window
    GraceHeld,
    Ended,
    /// No session and nothing to show
    Idle,
}

impl PublishOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishOutcome::Created => "created",
            PublishOutcome::Updated => "updated",
            PublishOutcome::Unchanged => "unchanged",
            PublishOutcome::Switched => "switched",
            PublishOutcome::GraceHeld => "grace_held",
            PublishOutcome::Ended => "ended",
            PublishOutcome::Idle => "idle",
        }
    }
}

pub fn manual_summary(name: &str) -> String {
    format!("{} – calculating…", name)
}

#[derive(Default)]
struct PublisherState {
    session: Option<LiveSession>,
    /// Consecutive out-of-gate decisions seen while a session is active
    misses: u32,
    /// Crossing whose session the user ended explicitly
    dismissed: Option<CrossingId>,
}

#[cold]
fn log_publish_failed(operation: &str, crossing_id: &str, error: &PublishError) {
    warn!(
        operation = operation,
        crossing_id = crossing_id,
        kind = error.kind(),
        error = %error,
        "session_publish_failed"
    );
}

pub struct LiveSessionPublisher {
    host: Arc<dyn SessionHost>,
    state: Mutex<PublisherState>,
    stale_after: chrono::Duration,
    grace_cycles: u32,
    metrics: Arc<Metrics>,
}

impl LiveSessionPublisher {
    pub fn new(host: Arc<dyn SessionHost>, config: &Config, metrics: Arc<Metrics>) -> Self {
        let stale_after = chrono::Duration::from_std(config.stale_after())
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        Self {
            host,
            state: Mutex::new(PublisherState::default()),
            stale_after,
            grace_cycles: config.grace_cycles(),
            metrics,
        }
    }

    /// Snapshot of the active session, if any
    pub async fn active(&self) -> Option<LiveSession> {
        self.state.lock().await.session.clone()
    }

    fn horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.stale_after
    }

    /// Apply one evaluation decision to the live session
    pub async fn publish(
        &self,
        decision: &ProximityDecision,
    ) -> Result<PublishOutcome, PublishError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let Some(session) = state.session.clone() else {
            if !decision.within_gate {
                state.dismissed = None;
                return Ok(PublishOutcome::Idle);
            }
            if state.dismissed.as_ref() == Some(&decision.crossing_id) {
                return Ok(PublishOutcome::Idle);
            }
            state.dismissed = None;
            let created = self.create(decision, now).await?;
            state.session = Some(created);
            state.misses = 0;
            return Ok(PublishOutcome::Created);
        };

        if !decision.within_gate {
            state.misses += 1;
            if state.misses <= self.grace_cycles {
                debug!(
                    crossing_id = %session.crossing_id,
                    misses = state.misses,
                    grace_cycles = self.grace_cycles,
                    "session_grace_held"
                );
                return Ok(PublishOutcome::GraceHeld);
            }
            self.end_session(&session).await?;
            state.session = None;
            state.misses = 0;
            return Ok(PublishOutcome::Ended);
        }

        state.misses = 0;

        if session.crossing_id == decision.crossing_id || session.manual {
            let content = SessionContent {
                minutes_remaining: decision.eta_minutes,
                summary: decision.summary.clone(),
            };
            let half_horizon = self.stale_after / 2;
            let fresh_enough = session.stale_at - now > half_horizon;
            if !session.manual && content == session.content() && fresh_enough {
                return Ok(PublishOutcome::Unchanged);
            }

            let stale_at = self.horizon(now);
            if let Err(e) = self.host.update(&session.handle, &content, stale_at).await {
                self.metrics.record_publish_failed();
                log_publish_failed("update", decision.crossing_id.as_str(), &e);
                return Err(e);
            }
            self.metrics.record_session_updated();
            if session.manual {
                info!(
                    handle = %session.handle,
                    crossing_id = %decision.crossing_id,
                    "session_adopted"
                );
            }
            state.session = Some(LiveSession {
                handle: session.handle,
                crossing_id: decision.crossing_id.clone(),
                crossing_name: decision.crossing_name.clone(),
                minutes_remaining: content.minutes_remaining,
                summary: content.summary,
                stale_at,
                manual: false,
            });
            return Ok(PublishOutcome::Updated);
        }

        // Switch: the old session must be gone before the new one exists
        info!(
            from = %session.crossing_id,
            to = %decision.crossing_id,
            "session_switching"
        );
        self.end_session(&session).await?;
        state.session = None;
        let created = self.create(decision, now).await?;
        state.session = Some(created);
        Ok(PublishOutcome::Switched)
    }

    /// End the active session on explicit request
    pub async fn end(&self) -> Result<PublishOutcome, PublishError> {
        let mut state = self.state.lock().await;
        let Some(session) = state.session.clone() else {
            return Ok(PublishOutcome::Idle);
        };
        self.end_session(&session).await?;
        state.session = None;
        state.misses = 0;
        state.dismissed = Some(session.crossing_id);
        Ok(PublishOutcome::Ended)
    }

    /// Show a placeholder session before any evaluation has run
    ///
    /// An existing session is left as is. The next in-gate decision adopts
    /// the placeholder and updates it in place, whatever crossing it names.
    pub async fn start_manual(
        &self,
        placeholder: &CrossingRecord,
    ) -> Result<PublishOutcome, PublishError> {
        let mut state = self.state.lock().await;
        if state.session.is_some() {
            return Ok(PublishOutcome::Unchanged);
        }
        state.dismissed = None;

        let now = Utc::now();
        let attributes = SessionAttributes {
            crossing_id: placeholder.id.clone(),
            crossing_name: placeholder.name.clone(),
        };
        let content =
            SessionContent { minutes_remaining: 0, summary: manual_summary(&placeholder.name) };
        let stale_at = self.horizon(now);

        let handle = match self.host.create(&attributes, &content, stale_at).await {
            Ok(handle) => handle,
            Err(e) => {
                self.metrics.record_publish_failed();
                log_publish_failed("start_manual", placeholder.id.as_str(), &e);
                return Err(e);
            }
        };
        self.metrics.record_session_created();
        info!(handle = %handle, crossing_id = %placeholder.id, "session_started_manually");

        state.session = Some(LiveSession {
            handle,
            crossing_id: attributes.crossing_id,
            crossing_name: attributes.crossing_name,
            minutes_remaining: content.minutes_remaining,
            summary: content.summary,
            stale_at,
            manual: true,
        });
        state.misses = 0;
        Ok(PublishOutcome::Created)
    }

    async fn create(
        &self,
        decision: &ProximityDecision,
        now: DateTime<Utc>,
    ) -> Result<LiveSession, PublishError> {
        let attributes = SessionAttributes {
            crossing_id: decision.crossing_id.clone(),
            crossing_name: decision.crossing_name.clone(),
        };
        let content = SessionContent {
            minutes_remaining: decision.eta_minutes,
            summary: decision.summary.clone(),
        };
        let stale_at = self.horizon(now);

        match self.host.create(&attributes, &content, stale_at).await {
            Ok(handle) => {
                self.metrics.record_session_created();
                info!(
                    handle = %handle,
                    crossing_id = %decision.crossing_id,
                    minutes = decision.eta_minutes,
                    "session_created"
                );
                Ok(LiveSession {
                    handle,
                    crossing_id: attributes.crossing_id,
                    crossing_name: attributes.crossing_name,
                    minutes_remaining: content.minutes_remaining,
                    summary: content.summary,
                    stale_at,
                    manual: false,
                })
            }
            Err(e) => {
                self.metrics.record_publish_failed();
                log_publish_failed("create", decision.crossing_id.as_str(), &e);
                Err(e)
            }
        }
    }

    async fn end_session(&self, session: &LiveSession) -> Result<(), PublishError> {
        match self.host.end(&session.handle).await {
            Ok(()) => {
                self.metrics.record_session_ended();
                info!(
                    handle = %session.handle,
                    crossing_id = %session.crossing_id,
                    "session_ended"
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_publish_failed();
                log_publish_failed("end", session.crossing_id.as_str(), &e);
                Err(e)
            }
        }
    }
}
