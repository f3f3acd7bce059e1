//! Host live-session API
//!
//! The host renders the ephemeral status surface. The monitor only needs
//! create/update/end; how the host draws the session is its own business.

use crate::domain::types::{SessionAttributes, SessionContent, SessionHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Host session API is unreachable or refused the call
    #[error("live session host unavailable: {0}")]
    SessionUnavailable(String),

    /// Host will not accept more sessions or updates right now
    #[error("live session quota exceeded")]
    QuotaExceeded,
}

impl PublishError {
    pub fn kind(&self) -> &'static str {
        match self {
            PublishError::SessionUnavailable(_) => "session_unavailable",
            PublishError::QuotaExceeded => "quota_exceeded",
        }
    }
}

#[async_trait]
pub trait SessionHost: Send + Sync {
    async fn create(
        &self,
        attributes: &SessionAttributes,
        content: &SessionContent,
        stale_at: DateTime<Utc>,
    ) -> Result<SessionHandle, PublishError>;

    async fn update(
        &self,
        handle: &SessionHandle,
        content: &SessionContent,
        stale_at: DateTime<Utc>,
    ) -> Result<(), PublishError>;

    async fn end(&self, handle: &SessionHandle) -> Result<(), PublishError>;
}

/// Renders sessions into the structured log; used when no external surface is configured
#[derive(Debug, Default)]
pub struct LogSessionHost;

impl LogSessionHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionHost for LogSessionHost {
    async fn create(
        &self,
        attributes: &SessionAttributes,
        content: &SessionContent,
        stale_at: DateTime<Utc>,
    ) -> Result<SessionHandle, PublishError> {
        let handle = SessionHandle::new_v7();
        info!(
            handle = %handle,
            crossing = %attributes.crossing_name,
            minutes = content.minutes_remaining,
            summary = %content.summary,
            stale_at = %stale_at,
            "live_session_shown"
        );
        Ok(handle)
    }

    async fn update(
        &self,
        handle: &SessionHandle,
        content: &SessionContent,
        stale_at: DateTime<Utc>,
    ) -> Result<(), PublishError> {
        info!(
            handle = %handle,
            minutes = content.minutes_remaining,
            summary = %content.summary,
            stale_at = %stale_at,
            "live_session_refreshed"
        );
        Ok(())
    }

    async fn end(&self, handle: &SessionHandle) -> Result<(), PublishError> {
        info!(handle = %handle, "live_session_dismissed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_host_mints_distinct_handles() {
        let host = LogSessionHost::new();
        let attributes = SessionAttributes {
            crossing_id: "rail-1".into(),
            crossing_name: "Atlantic Ave".to_string(),
        };
        let content = SessionContent { minutes_remaining: 3, summary: "x".to_string() };

        let a = host.create(&attributes, &content, Utc::now()).await.unwrap();
        let b = host.create(&attributes, &content, Utc::now()).await.unwrap();
        assert_ne!(a, b);
        assert!(host.update(&a, &content, Utc::now()).await.is_ok());
        assert!(host.end(&a).await.is_ok());
    }

    #[test]
    fn test_publish_error_kind() {
        assert_eq!(PublishError::QuotaExceeded.kind(), "quota_exceeded");
        assert_eq!(
            PublishError::SessionUnavailable("down".to_string()).kind(),
            "session_unavailable"
        );
    }
}
