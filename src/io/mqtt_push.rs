//! MQTT transport for the live push channel
//!
//! Each push event is published to `<topic_prefix>/<event-name>` with a
//! JSON body:
//! - `<prefix>/join-driver-room`, `<prefix>/leave-driver-room` (QoS 1)
//! - `<prefix>/driver-location-update` (QoS 0)
//!
//! A link is considered up once the broker acknowledges the CONNECT. The
//! event loop is then polled by a monitor task; any connection error ends
//! the link (rumqttc's own reconnect is not used, the live channel owns
//! the redial policy).

use crate::domain::error::ChannelError;
use crate::infra::config::Config;
use crate::io::live_channel::{PushConnector, PushEmitter, PushLink, PushMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 100;
const MONITOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct MqttConnector {
    client_id: String,
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    topic_prefix: String,
}

impl MqttConnector {
    pub fn new(config: &Config) -> Self {
        let credentials = match (config.live_username(), config.live_password()) {
            (Some(username), Some(password)) => Some((username.to_string(), password.to_string())),
            _ => None,
        };
        Self {
            client_id: format!("{}-{}", config.agent_id(), std::process::id()),
            host: config.live_host().to_string(),
            port: config.live_port(),
            credentials,
            keep_alive: config.live_keep_alive(),
            topic_prefix: config.live_topic_prefix().to_string(),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username.clone(), password.clone());
        }
        options
    }
}

/// Topic for a push event
pub fn topic_for(prefix: &str, message: &PushMessage) -> String {
    format!("{}/{}", prefix, message.event_name())
}

/// Room membership must arrive; location updates may be lost
pub fn qos_for(message: &PushMessage) -> QoS {
    if message.is_control() {
        QoS::AtLeastOnce
    } else {
        QoS::AtMostOnce
    }
}

#[async_trait]
impl PushConnector for MqttConnector {
    fn endpoint(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<PushLink, ChannelError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(ChannelError::Rejected(format!("{:?}", ack.code)));
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(ChannelError::Connect(e.to_string())),
            }
        }
        info!(client_id = %self.client_id, "mqtt_push_connected");

        let (lost_tx, lost) = oneshot::channel();
        let monitor = tokio::spawn(monitor_link(eventloop, lost_tx));
        Ok(PushLink {
            emitter: Box::new(MqttEmitter {
                client,
                topic_prefix: self.topic_prefix.clone(),
                monitor: Mutex::new(Some(monitor)),
            }),
            lost,
            connection_id: Some(self.client_id.clone()),
        })
    }
}

/// Poll the event loop until the link ends, then report why
async fn monitor_link(mut eventloop: EventLoop, lost_tx: oneshot::Sender<String>) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Disconnect)) => break "server disconnect".to_string(),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break "client disconnect".to_string(),
            Ok(Event::Incoming(Packet::PubAck(_))) => {
                debug!("mqtt_push_puback");
            }
            Ok(_) => {}
            Err(e) => break e.to_string(),
        }
    };
    debug!(reason = %reason, "mqtt_push_link_ended");
    let _ = lost_tx.send(reason);
}

struct MqttEmitter {
    client: AsyncClient,
    topic_prefix: String,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl PushEmitter for MqttEmitter {
    async fn emit(&self, message: &PushMessage) -> Result<(), ChannelError> {
        let payload = message.encode()?;
        self.client
            .publish(topic_for(&self.topic_prefix, message), qos_for(message), false, payload)
            .await
            .map_err(|e| ChannelError::Publish(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "mqtt_push_disconnect_failed");
        }
        let monitor = self.monitor.lock().take();
        if let Some(mut monitor) = monitor {
            if tokio::time::timeout(MONITOR_SHUTDOWN_TIMEOUT, &mut monitor).await.is_err() {
                monitor.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{LocationSample, RawFix, TrackingIdentity};
    use crate::domain::wire::RoomPayload;
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// MQTT 3.1.1 CONNACK, session not present, accepted
    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    /// CONNACK with return code 5 (not authorized)
    const CONNACK_NOT_AUTHORIZED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

    fn identity() -> TrackingIdentity {
        TrackingIdentity::new("D1", "B1")
    }

    #[test]
    fn test_topics_and_qos() {
        let join = PushMessage::JoinRoom(RoomPayload::from(&identity()));
        assert_eq!(topic_for("smartbus", &join), "smartbus/join-driver-room");
        assert_eq!(qos_for(&join), QoS::AtLeastOnce);

        let sample = LocationSample::from_fix(&RawFix::at(1.0, 2.0)).unwrap();
        let update = PushMessage::location_update(&sample, &identity(), Utc::now());
        assert_eq!(topic_for("fleet/live", &update), "fleet/live/driver-location-update");
        assert_eq!(qos_for(&update), QoS::AtMostOnce);
    }

    #[test]
    fn test_client_id_from_agent_id() {
        let connector = MqttConnector::new(&Config::default());
        assert!(connector.client_id.starts_with("smartbus-agent-"));
        assert_eq!(connector.endpoint(), "mqtt://localhost:1883");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = Config::default().with_live_endpoint("127.0.0.1", port);
        let result = MqttConnector::new(&config).connect().await;
        assert!(matches!(result, Err(ChannelError::Connect(_))));
    }

    #[tokio::test]
    async fn test_connack_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await;
            socket.write_all(&CONNACK_NOT_AUTHORIZED).await.unwrap();
            let _ = socket.read(&mut buf).await;
        });

        let config = Config::default().with_live_endpoint("127.0.0.1", port);
        let result = MqttConnector::new(&config).connect().await;
        assert!(matches!(result, Err(ChannelError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_publish_and_link_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = oneshot::channel::<Vec<u8>>();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(&CONNACK_ACCEPTED).await.unwrap();

            // Collect until the topic shows up, then hang up
            let mut received = Vec::new();
            let needle = b"smartbus/join-driver-room";
            while !received.windows(needle.len()).any(|w| w == needle) {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            let _ = seen_tx.send(received);
        });

        let config = Config::default().with_live_endpoint("127.0.0.1", port);
        let link = MqttConnector::new(&config).connect().await.unwrap();
        let join = PushMessage::JoinRoom(RoomPayload::from(&identity()));
        link.emitter.emit(&join).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), seen_rx).await.unwrap().unwrap();
        let body = String::from_utf8_lossy(&received);
        assert!(body.contains(r#"{"driverId":"D1","busId":"B1"}"#));

        // Server task exited and closed the socket
        let reason = tokio::time::timeout(Duration::from_secs(5), link.lost).await.unwrap();
        assert!(reason.is_ok());
    }
}
