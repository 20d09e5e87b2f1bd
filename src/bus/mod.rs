//! Message bus status/command handler
//!
//! Keeps one auto-reconnecting connection to the broker, tracks the space
//! status published on the status topic and relays door buzzer commands.
//! Buzzing is only allowed while the status says the space is open; a lost
//! connection resets the status so every request is denied until the broker
//! delivers a fresh one.
//!
//! Transports:
//! - MQTT (`mqtt://`, `mqtts://`, `tcp://`, `ssl://`) via rumqttc
//! - NATS (`nats://`, `tls://`) via async-nats

pub mod mqtt;
pub mod nats;
pub mod status;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{BusConfig, BuzzerConfig};
use crate::types::{Result, SesameError};

pub use status::{BusEvent, DoorStatus, StatusCell};

/// How long the door buzzes, in milliseconds
pub const BUZZER_DURATION_MS: u32 = 4004;

/// How long the initial connect may take before continuing in the background
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// First reconnect delay, doubled per failed attempt
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Statuses that allow members to buzz
const OPEN_STATUSES: [&str; 3] = ["open", "open+", "member"];

/// Background task driving the bus connection.
///
/// Resolves only on a fatal error (e.g. the status subscription was refused).
pub type BusTask = JoinHandle<Result<()>>;

/// Whether members may open the doors for the given status
pub fn is_open_for_member(status: &str) -> bool {
    OPEN_STATUSES.contains(&status)
}

/// Delay before reconnect attempt number `attempt` (0-based)
pub fn reconnect_delay(attempt: u32, max: Duration) -> Duration {
    INITIAL_RECONNECT_DELAY
        .checked_mul(2u32.saturating_pow(attempt))
        .map_or(max, |delay| delay.min(max))
}

/// A door with a buzzer on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Door {
    Outer,
    InnerGlass,
    InnerMetal,
}

impl Door {
    pub const ALL: [Door; 3] = [Door::Outer, Door::InnerGlass, Door::InnerMetal];

    /// Numeric code used in tagged buzz commands
    pub fn code(self) -> u8 {
        match self {
            Door::Outer => 0,
            Door::InnerGlass => 1,
            Door::InnerMetal => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Door::Outer => "outer",
            Door::InnerGlass => "innerGlass",
            Door::InnerMetal => "innerMetal",
        }
    }
}

impl fmt::Display for Door {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Door {
    type Err = SesameError;

    fn from_str(s: &str) -> Result<Self> {
        Door::ALL
            .into_iter()
            .find(|door| door.as_str() == s)
            .ok_or_else(|| SesameError::BadRequest("Invalid 'door' param.".into()))
    }
}

/// A single buzz request, never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuzzCommand {
    pub door: Door,
    pub user_name: String,
    pub duration_ms: u32,
}

impl BuzzCommand {
    pub fn new(door: Door, user_name: &str) -> Self {
        Self {
            door,
            user_name: user_name.to_string(),
            duration_ms: BUZZER_DURATION_MS,
        }
    }

    /// Topic and payload for the configured buzzer layout
    pub fn route<'a>(&self, buzzer: &'a BuzzerConfig) -> (&'a str, String) {
        match buzzer {
            BuzzerConfig::PerDoor {
                outer_topic,
                inner_glass_topic,
                inner_metal_topic,
            } => {
                let topic = match self.door {
                    Door::Outer => outer_topic,
                    Door::InnerGlass => inner_glass_topic,
                    Door::InnerMetal => inner_metal_topic,
                };
                (topic.as_str(), self.duration_ms.to_string())
            }
            BuzzerConfig::Tagged { topic } => {
                (topic.as_str(), format!("{} {}", self.door.code(), self.user_name))
            }
        }
    }
}

/// Fire-and-forget publishing to the bus (QoS 0, not retained)
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Hand a message to the bus
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// Status tracking and buzzer commands on top of a bus connection
pub struct BusHandler {
    status: StatusCell,
    publisher: Arc<dyn BusPublisher>,
    buzzer: BuzzerConfig,
    publish_timeout: Duration,
}

impl BusHandler {
    /// Assemble a handler from an already connected publisher
    pub fn new(
        status: StatusCell,
        publisher: Arc<dyn BusPublisher>,
        buzzer: BuzzerConfig,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            status,
            publisher,
            buzzer,
            publish_timeout,
        }
    }

    /// Connect to the configured broker and subscribe to the status topic
    ///
    /// An explicit connection failure during the first [`CONNECT_TIMEOUT`] is
    /// returned as an error. The returned task keeps the connection alive and
    /// only finishes on a fatal error.
    pub async fn connect(config: &BusConfig) -> Result<(Self, BusTask)> {
        let url = Url::parse(&config.url)
            .map_err(|e| SesameError::Config(format!("Invalid bus url '{}': {e}", config.url)))?;
        let status = StatusCell::new();

        info!(url = %config.url, client_id = %config.client_id, "Connecting to message bus");

        let (publisher, task): (Arc<dyn BusPublisher>, BusTask) = match url.scheme() {
            "mqtt" | "mqtts" | "tcp" | "ssl" => {
                let (publisher, task) = mqtt::connect(config, &url, status.clone()).await?;
                (Arc::new(publisher), task)
            }
            "nats" | "tls" => {
                let (publisher, task) = nats::connect(config, &url, status.clone()).await?;
                (Arc::new(publisher), task)
            }
            other => {
                return Err(SesameError::Config(format!(
                    "Unsupported bus scheme '{other}'"
                )))
            }
        };

        let handler = Self::new(
            status,
            publisher,
            config.buzzer.clone(),
            config.publish_timeout(),
        );
        Ok((handler, task))
    }

    /// Current status string, empty while unknown
    pub fn current_status(&self) -> String {
        self.status.current()
    }

    /// Status snapshot with age and connection state
    pub fn status(&self) -> DoorStatus {
        self.status.snapshot()
    }

    #[cfg(test)]
    fn status_cell(&self) -> &StatusCell {
        &self.status
    }

    /// Ask the bus to buzz `door` on behalf of `user_name`
    ///
    /// Returns true once the command was handed to the bus. That says nothing
    /// about whether the door actually opened.
    pub async fn send_door_buzzer(&self, door: Door, user_name: &str) -> bool {
        info!(door = %door, user = %user_name, "sending door buzzer.");

        let status = self.current_status();
        if !is_open_for_member(&status) {
            info!(status = %status, "door buzzer is not allowed for the current status.");
            return false;
        }

        let command = BuzzCommand::new(door, user_name);
        let (topic, payload) = command.route(&self.buzzer);

        let publish = self.publisher.publish(topic, Bytes::from(payload));
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => {
                debug!(topic, "door buzzer sent");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, topic, "Error sending door buzzer.");
                false
            }
            Err(_) => {
                warn!(
                    topic,
                    timeout_secs = self.publish_timeout.as_secs(),
                    "Timed out sending door buzzer."
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, Bytes)>>,
    }

    #[async_trait]
    impl BusPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
            self.sent.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    struct BrokenPublisher;

    #[async_trait]
    impl BusPublisher for BrokenPublisher {
        async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<()> {
            Err(SesameError::Bus("Publish failed: request channel closed".into()))
        }
    }

    struct StalledPublisher;

    #[async_trait]
    impl BusPublisher for StalledPublisher {
        async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<()> {
            std::future::pending().await
        }
    }

    fn per_door() -> BuzzerConfig {
        BuzzerConfig::PerDoor {
            outer_topic: "door/outer".into(),
            inner_glass_topic: "door/glass".into(),
            inner_metal_topic: "door/metal".into(),
        }
    }

    fn handler_with(
        publisher: Arc<dyn BusPublisher>,
        buzzer: BuzzerConfig,
        status: &str,
    ) -> BusHandler {
        let cell = StatusCell::new();
        cell.apply(BusEvent::Status(status.to_string()));
        BusHandler::new(cell, publisher, buzzer, Duration::from_secs(10))
    }

    #[test]
    fn test_open_statuses() {
        assert!(is_open_for_member("open"));
        assert!(is_open_for_member("open+"));
        assert!(is_open_for_member("member"));
        assert!(!is_open_for_member(""));
        assert!(!is_open_for_member("closed"));
        assert!(!is_open_for_member("none"));
        assert!(!is_open_for_member("Open"));
        assert!(!is_open_for_member("open "));
    }

    #[test]
    fn test_door_from_str() {
        assert_eq!("outer".parse::<Door>().unwrap(), Door::Outer);
        assert_eq!("innerGlass".parse::<Door>().unwrap(), Door::InnerGlass);
        assert_eq!("innerMetal".parse::<Door>().unwrap(), Door::InnerMetal);
        assert!("inner".parse::<Door>().is_err());
        assert!("OUTER".parse::<Door>().is_err());
    }

    #[test]
    fn test_route_per_door() {
        let buzzer = per_door();
        let (topic, payload) = BuzzCommand::new(Door::InnerGlass, "alice").route(&buzzer);
        assert_eq!(topic, "door/glass");
        assert_eq!(payload, "4004");
    }

    #[test]
    fn test_route_tagged() {
        let buzzer = BuzzerConfig::Tagged {
            topic: "door/buzzer".into(),
        };
        let (topic, payload) = BuzzCommand::new(Door::InnerMetal, "bob").route(&buzzer);
        assert_eq!(topic, "door/buzzer");
        assert_eq!(payload, "2 bob");
    }

    #[test]
    fn test_reconnect_delay_is_bounded() {
        let max = Duration::from_secs(300);
        assert_eq!(reconnect_delay(0, max), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1, max), Duration::from_secs(2));
        assert_eq!(reconnect_delay(4, max), Duration::from_secs(16));
        assert_eq!(reconnect_delay(9, max), max);
        assert_eq!(reconnect_delay(u32::MAX, max), max);
    }

    #[tokio::test]
    async fn test_allowed_statuses_publish() {
        for status in OPEN_STATUSES {
            let publisher = Arc::new(RecordingPublisher::default());
            let handler = handler_with(publisher.clone(), per_door(), status);

            assert!(handler.send_door_buzzer(Door::Outer, "alice").await);
            assert_eq!(publisher.sent.lock().unwrap().len(), 1, "status {status}");
        }
    }

    #[tokio::test]
    async fn test_other_statuses_never_publish() {
        for status in ["", "closed", "none", "keyholder", "OPEN"] {
            let publisher = Arc::new(RecordingPublisher::default());
            let handler = handler_with(publisher.clone(), per_door(), status);

            assert!(!handler.send_door_buzzer(Door::Outer, "alice").await);
            assert!(publisher.sent.lock().unwrap().is_empty(), "status {status}");
        }
    }

    #[tokio::test]
    async fn test_connection_loss_denies_until_new_status() {
        let publisher = Arc::new(RecordingPublisher::default());
        let handler = handler_with(publisher.clone(), per_door(), "open");

        handler
            .status_cell()
            .apply(BusEvent::ConnectionLost("keep-alive timeout".into()));
        assert_eq!(handler.current_status(), "");
        assert!(!handler.send_door_buzzer(Door::Outer, "alice").await);

        handler.status_cell().apply(BusEvent::Connected);
        assert!(!handler.send_door_buzzer(Door::Outer, "alice").await);

        handler.status_cell().apply(BusEvent::Status("open".into()));
        assert!(handler.send_door_buzzer(Door::Outer, "alice").await);
        assert_eq!(publisher.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_error_is_failure() {
        let handler = handler_with(Arc::new(BrokenPublisher), per_door(), "open");
        assert!(!handler.send_door_buzzer(Door::InnerMetal, "alice").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout_is_failure() {
        let handler = handler_with(Arc::new(StalledPublisher), per_door(), "member");
        assert!(!handler.send_door_buzzer(Door::Outer, "alice").await);
    }
}
