//! MQTT transport
//!
//! rumqttc drives the connection from an event loop that has to be polled
//! continuously. Polling again after an error reconnects; the delay between
//! attempts doubles up to the configured maximum. The session is clean, so
//! the status topic is subscribed again after every CONNACK.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{reconnect_delay, BusEvent, BusPublisher, BusTask, StatusCell, CONNECT_TIMEOUT};
use crate::config::BusConfig;
use crate::types::{Result, SesameError};

/// Capacity of the request channel between client and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Publishing side of the MQTT connection
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl BusPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish_bytes(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| SesameError::Bus(format!("Publish failed: {e}")))
    }
}

/// Connect to an MQTT broker and start the event loop task
pub async fn connect(
    config: &BusConfig,
    url: &Url,
    status: StatusCell,
) -> Result<(MqttPublisher, BusTask)> {
    let options = mqtt_options(config, url)?;
    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

    let mut subscription = StatusSubscription {
        client: client.clone(),
        topic: config.status_topic.clone(),
        status,
    };

    let first_connect = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            let event = eventloop.poll().await?;
            let connected = matches!(event, Event::Incoming(Packet::ConnAck(_)));
            if let Err(e) = subscription.handle(event) {
                return Ok(Err(e));
            }
            if connected {
                return Ok::<_, ConnectionError>(Ok(()));
            }
        }
    })
    .await;

    match first_connect {
        Ok(Ok(Ok(()))) => info!(url = %config.url, "Connected to MQTT broker"),
        Ok(Ok(Err(e))) => return Err(e),
        Ok(Err(e)) => {
            return Err(SesameError::Bus(format!(
                "Could not connect to mqtt server: {e}"
            )))
        }
        Err(_) => warn!(
            url = %config.url,
            timeout_secs = CONNECT_TIMEOUT.as_secs(),
            "MQTT broker did not answer in time, retrying in the background"
        ),
    }

    let max_delay = config.max_reconnect_interval();
    let task = tokio::spawn(run_event_loop(eventloop, subscription, max_delay));

    Ok((MqttPublisher { client }, task))
}

/// Build client options from the bus configuration
fn mqtt_options(config: &BusConfig, url: &Url) -> Result<MqttOptions> {
    let (tls, default_port) = match url.scheme() {
        "mqtt" | "tcp" => (false, 1883),
        "mqtts" | "ssl" => (true, 8883),
        other => {
            return Err(SesameError::Config(format!(
                "Not an MQTT url scheme: '{other}'"
            )))
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| SesameError::Config(format!("Missing host in bus url '{url}'")))?;
    let port = url.port().unwrap_or(default_port);

    let mut options = MqttOptions::new(config.client_id.clone(), host, port);
    options
        .set_keep_alive(config.keep_alive())
        .set_clean_session(true);

    if let Some(username) = config.username.as_deref().filter(|u| !u.is_empty()) {
        let password = config.password.clone().unwrap_or_default();
        options.set_credentials(username, password);
    }

    if tls {
        options.set_transport(tls_transport(config.cert_file.as_deref())?);
    }

    Ok(options)
}

fn tls_transport(cert_file: Option<&Path>) -> Result<Transport> {
    match cert_file {
        None => {
            debug!("No cert file given, using system trust store");
            Ok(Transport::tls_with_default_config())
        }
        Some(path) => {
            let ca = std::fs::read(path).map_err(|e| {
                SesameError::Config(format!(
                    "Could not read cert file {}: {e}",
                    path.display()
                ))
            })?;
            Ok(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }))
        }
    }
}

/// Reacts to incoming packets and keeps the status topic subscribed
struct StatusSubscription {
    client: AsyncClient,
    topic: String,
    status: StatusCell,
}

impl StatusSubscription {
    fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.status.apply(BusEvent::Connected);
                self.client
                    .try_subscribe(self.topic.clone(), QoS::AtMostOnce)
                    .map_err(|e| SesameError::Bus(format!("Could not subscribe: {e}")))?;
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    return Err(SesameError::Bus(format!(
                        "Could not subscribe to '{}': rejected by broker",
                        self.topic
                    )));
                }
                debug!(topic = %self.topic, "subscribed");
            }
            Event::Incoming(Packet::Publish(publish)) if publish.topic == self.topic => {
                let value = String::from_utf8_lossy(&publish.payload).into_owned();
                self.status.apply(BusEvent::Status(value));
            }
            _ => {}
        }
        Ok(())
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    mut subscription: StatusSubscription,
    max_delay: Duration,
) -> Result<()> {
    let mut attempt = 0u32;
    let mut connected = subscription.status.snapshot().connected;

    loop {
        match eventloop.poll().await {
            Ok(event) => {
                if matches!(event, Event::Incoming(Packet::ConnAck(_))) {
                    attempt = 0;
                    connected = true;
                }
                if let Err(e) = subscription.handle(event) {
                    error!(error = %e, "Status subscription failed");
                    return Err(e);
                }
            }
            Err(e) => {
                if connected {
                    subscription.status.apply(BusEvent::ConnectionLost(e.to_string()));
                    connected = false;
                } else {
                    debug!(error = %e, "reconnect failed");
                }
                let delay = reconnect_delay(attempt, max_delay);
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
