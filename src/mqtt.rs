//! MQTT publishing.
//!
//! One publisher worker drains the bounded outbound channel and pushes
//! every message to the broker with QoS 1. Capture workers reach the
//! channel through [`PublisherHandle`], which scopes topics to one camera
//! under `{client_id}/{camera}`.
//!
//! Connection policy: `connect` must see a successful CONNACK within
//! [`CONNECT_TIMEOUT`] or startup fails. A retained Last Will marks the
//! daemon `offline` whenever the broker loses the session, so the
//! connection is never closed deliberately.

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, LastWill};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::config::MqttSettings;
use crate::detect::DetectionResult;
use crate::worker::StopToken;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// How long `connect` waits for the broker to acknowledge the session.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive slice for the publisher loop so stop requests are observed.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One message bound for the broker.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Availability topic carrying `online`/`offline` (retained, also the
/// Last Will target).
pub fn availability_topic(client_id: &str) -> String {
    format!("{}/lwt", client_id)
}

// ----------------------------------------------------------------------------
// Per-camera publisher handle
// ----------------------------------------------------------------------------

/// Cheap-to-clone sender half of the outbound channel with the topic
/// prefix for one camera baked in.
#[derive(Clone)]
pub struct PublisherHandle {
    outbound: Sender<OutboundMessage>,
    prefix: String,
}

impl PublisherHandle {
    pub fn sender(&self) -> &Sender<OutboundMessage> {
        &self.outbound
    }

    pub fn sensor_topic(&self) -> String {
        format!("{}/sensor", self.prefix)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/status", self.prefix)
    }

    pub fn detection_message(&self, result: &DetectionResult) -> Result<OutboundMessage> {
        Ok(OutboundMessage {
            topic: self.sensor_topic(),
            payload: serde_json::to_vec(result)?,
            retain: false,
        })
    }

    /// Status updates are retained so late subscribers see the last state.
    pub fn status_message(&self, status: &str) -> OutboundMessage {
        OutboundMessage {
            topic: self.status_topic(),
            payload: status.as_bytes().to_vec(),
            retain: true,
        }
    }

    /// Bounded-wait publish. Returns the message back when the channel
    /// stayed full for the whole window.
    pub fn try_publish(
        &self,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<Option<OutboundMessage>> {
        match self.outbound.send_timeout(message, timeout) {
            Ok(()) => Ok(None),
            Err(SendTimeoutError::Timeout(returned)) => Ok(Some(returned)),
            Err(SendTimeoutError::Disconnected(_)) => bail!("outbound channel closed"),
        }
    }
}

// ----------------------------------------------------------------------------
// Broker session
// ----------------------------------------------------------------------------

/// Broker-facing side of the publisher. Construction only builds the
/// client; nothing touches the network until [`MqttPublisher::connect`].
pub struct MqttPublisher {
    client: Client,
    connection: Option<Connection>,
    settings: MqttSettings,
}

impl MqttPublisher {
    pub fn new(settings: MqttSettings) -> Self {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.host.clone(),
            settings.port,
        );
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        options.set_clean_start(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user.clone(), settings.password.clone().unwrap_or_default());
        }
        let will = LastWill::new(
            availability_topic(&settings.client_id),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        );
        options.set_last_will(will);

        let (client, connection) = Client::new(options, 10);
        Self {
            client,
            connection: Some(connection),
            settings,
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Handle scoping outbound messages to `{client_id}/{camera}`.
    pub fn handle_for(
        &self,
        outbound: &Sender<OutboundMessage>,
        camera: &str,
    ) -> PublisherHandle {
        PublisherHandle {
            outbound: outbound.clone(),
            prefix: format!("{}/{}", self.settings.client_id, camera),
        }
    }

    /// Establish the broker session.
    ///
    /// Spawns the connection-driving thread, then waits for the broker's
    /// CONNACK. On success the retained availability flips to `online`;
    /// any other outcome is an error the caller treats as fatal.
    pub fn connect(&mut self) -> Result<MqttRuntime> {
        let connection = self
            .connection
            .take()
            .ok_or_else(|| anyhow!("MQTT connection already established"))?;

        let (ready_tx, ready_rx) = mpsc::channel();
        let client = self.client.clone();
        let availability = availability_topic(&self.settings.client_id);
        let handle = thread::Builder::new()
            .name("mqtt-conn".to_string())
            .spawn(move || drive_connection(connection, client, availability, ready_tx))
            .context("failed to spawn MQTT connection thread")?;

        match ready_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => bail!(
                "MQTT broker {}:{} rejected connection: {}",
                self.settings.host,
                self.settings.port,
                reason
            ),
            Err(mpsc::RecvTimeoutError::Timeout) => bail!(
                "no CONNACK from MQTT broker {}:{} within {}s",
                self.settings.host,
                self.settings.port,
                CONNECT_TIMEOUT.as_secs()
            ),
            Err(mpsc::RecvTimeoutError::Disconnected) => bail!(
                "MQTT connection to {}:{} closed before CONNACK",
                self.settings.host,
                self.settings.port
            ),
        }

        log::info!(
            "connected to MQTT broker {}:{}",
            self.settings.host,
            self.settings.port
        );

        Ok(MqttRuntime {
            _connection: handle,
        })
    }
}

/// Holder for the connection-driving thread.
pub struct MqttRuntime {
    /// Never joined: the session must stay open until process exit so the
    /// Last Will fires on abnormal termination too.
    _connection: thread::JoinHandle<()>,
}

/// Drive the rumqttc event loop.
///
/// The first CONNACK (or the first failure) is reported on `ready`. After
/// that, connection errors are logged and the loop keeps polling, which
/// lets the client re-establish the session on its own. Every accepted
/// CONNACK re-publishes the retained `online` payload: from the moment a
/// session drops, the broker serves the retained will payload until the
/// next refresh lands.
fn drive_connection(
    mut connection: Connection,
    client: Client,
    availability: String,
    ready: mpsc::Sender<Result<(), String>>,
) {
    let mut awaiting_connack = true;
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    if let Err(e) = mark_online(&client, &availability) {
                        log::warn!("failed to publish online status: {}", e);
                    }
                    if awaiting_connack {
                        awaiting_connack = false;
                        let _ = ready.send(Ok(()));
                    } else {
                        log::info!("MQTT session re-established");
                    }
                } else if awaiting_connack {
                    let _ = ready.send(Err(format!("{:?}", ack.code)));
                    break;
                } else {
                    log::warn!("MQTT broker rejected reconnect: {:?}", ack.code);
                }
            }
            Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
            Err(e) => {
                if awaiting_connack {
                    let _ = ready.send(Err(e.to_string()));
                    break;
                }
                log::warn!("MQTT connection error: {}", e);
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

/// Enqueue the retained `online` payload on the availability topic.
fn mark_online(client: &Client, availability: &str) -> Result<()> {
    client.publish(
        availability,
        QoS::AtLeastOnce,
        true,
        PAYLOAD_ONLINE.as_bytes().to_vec(),
    )?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Publisher worker
// ----------------------------------------------------------------------------

/// Worker body for the publisher: drain the outbound channel until every
/// producer is gone or a stop is requested.
pub fn publisher_loop(client: Client, outbound: Receiver<OutboundMessage>, token: StopToken) {
    loop {
        if token.is_stop_requested() {
            break;
        }
        match outbound.recv_timeout(POLL_INTERVAL) {
            Ok(message) => {
                let OutboundMessage {
                    topic,
                    payload,
                    retain,
                } = message;
                if let Err(err) = client.publish(topic.as_str(), QoS::AtLeastOnce, retain, payload)
                {
                    log::warn!("failed to publish to '{}': {}", topic, err);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("publisher loop finished");
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttSettings;

    fn settings() -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "vigil".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
        }
    }

    #[test]
    fn availability_topic_is_scoped_to_client_id() {
        assert_eq!(availability_topic("vigil"), "vigil/lwt");
    }

    #[test]
    fn handle_topics_are_scoped_to_camera() {
        let publisher = MqttPublisher::new(settings());
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let handle = publisher.handle_for(&tx, "front_door");

        assert_eq!(handle.sensor_topic(), "vigil/front_door/sensor");
        assert_eq!(handle.status_topic(), "vigil/front_door/status");
    }

    #[test]
    fn detection_message_carries_json_payload() {
        let publisher = MqttPublisher::new(settings());
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let handle = publisher.handle_for(&tx, "front_door");

        let result = DetectionResult {
            camera: "front_door".to_string(),
            frame_seq: 7,
            motion_detected: true,
            confidence: 0.42,
        };
        let message = handle.detection_message(&result).expect("serialize");
        assert_eq!(message.topic, "vigil/front_door/sensor");
        assert!(!message.retain);

        let json = String::from_utf8(message.payload).expect("utf8");
        assert!(json.contains("\"motion_detected\":true"));
        assert!(json.contains("\"frame_seq\":7"));
    }

    #[test]
    fn status_message_is_retained() {
        let publisher = MqttPublisher::new(settings());
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let handle = publisher.handle_for(&tx, "front_door");

        let message = handle.status_message("scanning");
        assert!(message.retain);
        assert_eq!(message.payload, b"scanning");
    }

    #[test]
    fn try_publish_returns_message_when_channel_full() {
        let publisher = MqttPublisher::new(settings());
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = publisher.handle_for(&tx, "front_door");

        let accepted = handle
            .try_publish(handle.status_message("scanning"), Duration::from_millis(10))
            .expect("first publish");
        assert!(accepted.is_none());

        let bounced = handle
            .try_publish(handle.status_message("stopped"), Duration::from_millis(10))
            .expect("second publish");
        let bounced = bounced.expect("channel was full");
        assert_eq!(bounced.payload, b"stopped");

        drop(rx);
        assert!(handle
            .try_publish(handle.status_message("error"), Duration::from_millis(10))
            .is_err());
    }

    #[test]
    fn online_refresh_enqueues_without_a_live_session() {
        // The refresh that follows every CONNACK only enqueues on the
        // client's request queue, so it must succeed before (and between)
        // broker sessions.
        let publisher = MqttPublisher::new(settings());
        mark_online(&publisher.client, &availability_topic("vigil")).expect("enqueue online");
    }
}
