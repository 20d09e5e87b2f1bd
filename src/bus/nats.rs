//! NATS transport
//!
//! async-nats reconnects on its own and restores subscriptions afterwards.
//! Connection state changes arrive through the event callback, status
//! messages through a regular subscription.

use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{error, info};
use url::Url;

use super::{reconnect_delay, BusEvent, BusPublisher, BusTask, StatusCell, CONNECT_TIMEOUT};
use crate::config::BusConfig;
use crate::types::{Result, SesameError};

/// Publishing side of the NATS connection
#[derive(Clone)]
pub struct NatsPublisher {
    client: Client,
}

#[async_trait]
impl BusPublisher for NatsPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| SesameError::Bus(format!("Publish failed: {e}")))?;

        // publish only buffers, flush hands the message to the server
        self.client
            .flush()
            .await
            .map_err(|e| SesameError::Bus(format!("Flush failed: {e}")))
    }
}

/// Connect to a NATS server and start the status subscription task
pub async fn connect(
    config: &BusConfig,
    url: &Url,
    status: StatusCell,
) -> Result<(NatsPublisher, BusTask)> {
    let options = connect_options(config, url, status.clone());

    // No retry_on_initial_connect(): an unreachable server at startup is fatal.
    // Reconnection still works after the first successful connection.
    let client = options
        .connect(config.url.as_str())
        .await
        .map_err(|e| SesameError::Bus(format!("Failed to connect: {e}")))?;

    info!(url = %config.url, "Connected to NATS");
    status.apply(BusEvent::Connected);

    let mut subscriber = client
        .subscribe(config.status_topic.clone())
        .await
        .map_err(|e| SesameError::Bus(format!("Could not subscribe: {e}")))?;

    let topic = config.status_topic.clone();
    let task = tokio::spawn(async move {
        while let Some(message) = subscriber.next().await {
            let value = String::from_utf8_lossy(&message.payload).into_owned();
            status.apply(BusEvent::Status(value));
        }
        error!(topic = %topic, "Status subscription closed");
        Err(SesameError::Bus(format!("Status subscription on '{topic}' closed")))
    });

    Ok((NatsPublisher { client }, task))
}

fn connect_options(config: &BusConfig, url: &Url, status: StatusCell) -> ConnectOptions {
    let max_delay = config.max_reconnect_interval();

    let mut options = ConnectOptions::new()
        .name(config.client_id.as_str())
        .ping_interval(config.keep_alive().max(Duration::from_secs(1)))
        .connection_timeout(CONNECT_TIMEOUT)
        .max_reconnects(None::<usize>)
        .reconnect_delay_callback(move |attempts| retry_delay(attempts, max_delay))
        .event_callback(move |event| {
            let status = status.clone();
            async move {
                if let Some(event) = status_event(&event) {
                    status.apply(event);
                }
            }
        });

    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options = options.user_and_password(user.clone(), pass.clone());
    }
    if let Some(cert_file) = &config.cert_file {
        options = options.add_root_certificates(cert_file.clone());
    }
    if url.scheme() == "tls" {
        options = options.require_tls(true);
    }

    options
}

/// Delay before reconnect attempt number `attempts`, counted from 1
fn retry_delay(attempts: usize, max: Duration) -> Duration {
    let attempt = u32::try_from(attempts).unwrap_or(u32::MAX);
    reconnect_delay(attempt.saturating_sub(1), max)
}

/// Connection state changes, all other client events are ignored
fn status_event(event: &Event) -> Option<BusEvent> {
    match event {
        Event::Connected => Some(BusEvent::Connected),
        Event::Disconnected => Some(BusEvent::ConnectionLost("disconnected".into())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuzzerConfig;

    fn bus_config(url: &str) -> BusConfig {
        BusConfig {
            url: url.to_string(),
            username: None,
            password: None,
            cert_file: None,
            client_id: "sesam".into(),
            status_topic: "space.status".into(),
            keep_alive_secs: 10,
            max_reconnect_interval_secs: 300,
            publish_timeout_secs: 10,
            buzzer: BuzzerConfig::Tagged {
                topic: "door.buzzer".into(),
            },
        }
    }

    #[test]
    fn test_retry_delay() {
        let max = Duration::from_secs(300);
        assert_eq!(retry_delay(0, max), Duration::from_secs(1));
        assert_eq!(retry_delay(1, max), Duration::from_secs(1));
        assert_eq!(retry_delay(2, max), Duration::from_secs(2));
        assert_eq!(retry_delay(4, max), Duration::from_secs(8));
        assert_eq!(retry_delay(40, max), max);
        assert_eq!(retry_delay(usize::MAX, max), max);
    }

    #[test]
    fn test_status_event() {
        assert_eq!(status_event(&Event::Connected), Some(BusEvent::Connected));
        assert!(matches!(
            status_event(&Event::Disconnected),
            Some(BusEvent::ConnectionLost(_))
        ));
        assert_eq!(status_event(&Event::LameDuckMode), None);
    }

    #[test]
    fn test_disconnect_resets_status() {
        let status = StatusCell::new();
        status.apply(BusEvent::Status("open".into()));

        if let Some(event) = status_event(&Event::Disconnected) {
            status.apply(event);
        }
        assert_eq!(status.current(), "");
        assert!(!status.snapshot().connected);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_bus_error() {
        let config = bus_config("nats://127.0.0.1:1");
        let url = Url::parse(&config.url).unwrap();
        let status = StatusCell::new();

        let result = tokio::time::timeout(
            CONNECT_TIMEOUT * 2,
            connect(&config, &url, status.clone()),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(SesameError::Bus(_))));
        assert!(!status.snapshot().connected);
    }
}
