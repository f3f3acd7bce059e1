//! MQTT-backed live session host
//!
//! Each session lives on its own retained topic so late subscribers (a
//! dashboard, a phone widget bridge) always see the current state:
//! - `{prefix}/{handle}` - `{"event":"create",...}` / `{"event":"update",...}` (QoS 1, retained)
//! - end clears the retained message with an empty payload

use crate::domain::types::{SessionAttributes, SessionContent, SessionHandle};
use crate::infra::config::Config;
use crate::io::session_host::{PublishError, SessionHost};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum SessionMessage<'a> {
    Create {
        handle: &'a SessionHandle,
        attributes: &'a SessionAttributes,
        content: &'a SessionContent,
        stale_at: DateTime<Utc>,
    },
    Update {
        handle: &'a SessionHandle,
        content: &'a SessionContent,
        stale_at: DateTime<Utc>,
    },
}

fn encode(message: &SessionMessage<'_>) -> Result<Vec<u8>, PublishError> {
    serde_json::to_vec(message).map_err(|e| PublishError::SessionUnavailable(e.to_string()))
}

pub struct MqttSessionHost {
    client: AsyncClient,
    topic_prefix: String,
    connected: Arc<AtomicBool>,
}

impl MqttSessionHost {
    /// Create a new session host
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config) -> Self {
        let client_id = format!("crossing-session-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 32);
        let connected = Arc::new(AtomicBool::new(false));

        let connected_flag = connected.clone();
        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected_flag.store(true, Ordering::Relaxed);
                        info!("mqtt_session_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_session_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected_flag.store(false, Ordering::Relaxed);
                        warn!(error = %e, "mqtt_session_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, topic_prefix: config.mqtt_topic_prefix().to_string(), connected }
    }

    fn topic(&self, handle: &SessionHandle) -> String {
        format!("{}/{}", self.topic_prefix, handle)
    }

    async fn publish_retained(&self, topic: String, payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(PublishError::SessionUnavailable("broker not connected".to_string()));
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await
            .map_err(|e| PublishError::SessionUnavailable(e.to_string()))
    }
}

#[async_trait]
impl SessionHost for MqttSessionHost {
    async fn create(
        &self,
        attributes: &SessionAttributes,
        content: &SessionContent,
        stale_at: DateTime<Utc>,
    ) -> Result<SessionHandle, PublishError> {
        let handle = SessionHandle::new_v7();
        let payload = encode(&SessionMessage::Create {
            handle: &handle,
            attributes,
            content,
            stale_at,
        })?;
        self.publish_retained(self.topic(&handle), payload).await?;
        Ok(handle)
    }

    async fn update(
        &self,
        handle: &SessionHandle,
        content: &SessionContent,
        stale_at: DateTime<Utc>,
    ) -> Result<(), PublishError> {
        let payload = encode(&SessionMessage::Update { handle, content, stale_at })?;
        self.publish_retained(self.topic(handle), payload).await
    }

    async fn end(&self, handle: &SessionHandle) -> Result<(), PublishError> {
        self.publish_retained(self.topic(handle), Vec::new()).await
    }
}
