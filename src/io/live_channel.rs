//! Live push channel - best-effort realtime fan-out of samples
//!
//! A background driver task owns the transport link. It dials through a
//! [`PushConnector`], serves queued messages while the link is up, and
//! redials after a loss or a failed dial, at most `reconnect_attempts`
//! times in a row with `reconnect_delay` between tries.
//!
//! Callers never wait on the network: `join_room`, `leave_room` and
//! `push_sample` check the connection state and enqueue, or drop the
//! message when not connected. Connection state is published on a watch
//! channel and lifecycle events on a broadcast channel.
//!
//! `disconnect()` bumps a generation counter under the state lock; the
//! driver checks it before every state change or event, so nothing is
//! reported after a deliberate disconnect.

use crate::domain::error::ChannelError;
use crate::domain::types::{ChannelConnectionState, LocationSample, TrackingIdentity};
use crate::domain::wire::{LocationBroadcast, RoomPayload};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const EVENT_JOIN_ROOM: &str = "join-driver-room";
pub const EVENT_LEAVE_ROOM: &str = "leave-driver-room";
pub const EVENT_LOCATION_UPDATE: &str = "driver-location-update";

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 32;
/// How long `disconnect()` waits for the driver to flush and close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct LiveChannelConfig {
    pub handshake_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for LiveChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl LiveChannelConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            handshake_timeout: config.live_handshake_timeout(),
            reconnect_attempts: config.live_reconnect_attempts(),
            reconnect_delay: config.live_reconnect_delay(),
        }
    }
}

/// Connection lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Link established; carries the server-assigned connection id if any
    Connect { connection_id: Option<String> },
    /// Established link was lost
    Disconnect { reason: String },
    /// A dial failed or timed out
    ConnectError { error: ChannelError },
    /// Link re-established after `attempt` redials
    Reconnect { attempt: u32 },
    /// Redial budget exhausted; the driver has given up
    ReconnectFailed,
}

/// Outbound push messages
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    JoinRoom(RoomPayload),
    LeaveRoom(RoomPayload),
    LocationUpdate(LocationBroadcast),
}

impl PushMessage {
    pub fn location_update(
        sample: &LocationSample,
        identity: &TrackingIdentity,
        timestamp: DateTime<Utc>,
    ) -> Self {
        PushMessage::LocationUpdate(LocationBroadcast {
            bus_id: identity.bus_id.clone(),
            driver_id: identity.driver_id.clone(),
            latitude: sample.latitude,
            longitude: sample.longitude,
            speed: sample.wire_speed(),
            bearing: sample.wire_bearing(),
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            accuracy: sample.accuracy,
        })
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            PushMessage::JoinRoom(_) => EVENT_JOIN_ROOM,
            PushMessage::LeaveRoom(_) => EVENT_LEAVE_ROOM,
            PushMessage::LocationUpdate(_) => EVENT_LOCATION_UPDATE,
        }
    }

    /// Room membership messages; location updates are fire-and-forget
    pub fn is_control(&self) -> bool {
        !matches!(self, PushMessage::LocationUpdate(_))
    }

    /// JSON payload for the wire
    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        fn to_json<T: Serialize>(payload: &T) -> Result<Vec<u8>, ChannelError> {
            serde_json::to_vec(payload).map_err(|e| ChannelError::Encode(e.to_string()))
        }
        match self {
            PushMessage::JoinRoom(p) | PushMessage::LeaveRoom(p) => to_json(p),
            PushMessage::LocationUpdate(p) => to_json(p),
        }
    }
}

/// Sending half of an established link
#[async_trait]
pub trait PushEmitter: Send + Sync {
    async fn emit(&self, message: &PushMessage) -> Result<(), ChannelError>;

    /// Close the link gracefully
    async fn close(&self);
}

/// An established transport link
pub struct PushLink {
    pub emitter: Box<dyn PushEmitter>,
    /// Resolves with a reason when the transport drops the link
    pub lost: oneshot::Receiver<String>,
    pub connection_id: Option<String>,
}

/// Dials the push server
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;

    async fn connect(&self) -> Result<PushLink, ChannelError>;
}

struct DriverHandle {
    messages: mpsc::Sender<PushMessage>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct LiveChannel {
    config: LiveChannelConfig,
    state: Arc<watch::Sender<ChannelConnectionState>>,
    events: broadcast::Sender<ChannelEvent>,
    generation: Arc<AtomicU64>,
    driver: Option<DriverHandle>,
    metrics: Arc<Metrics>,
}

impl LiveChannel {
    pub fn new(config: LiveChannelConfig, metrics: Arc<Metrics>) -> Self {
        let (state, _) = watch::channel(ChannelConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            config,
            state: Arc::new(state),
            events,
            generation: Arc::new(AtomicU64::new(0)),
            driver: None,
            metrics,
        }
    }

    pub fn connection_state(&self) -> ChannelConnectionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ChannelConnectionState> {
        self.state.subscribe()
    }

    /// Lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Open the channel. No-op while a driver is already running.
    pub fn connect(&mut self, connector: Arc<dyn PushConnector>) {
        if let Some(driver) = &self.driver {
            if !driver.task.is_finished() {
                debug!(endpoint = %connector.endpoint(), "live_channel_already_open");
                return;
            }
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let (messages, message_rx) = mpsc::channel(COMMAND_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(endpoint = %connector.endpoint(), "live_channel_connecting");
        let driver = Driver {
            connector,
            config: self.config.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            current_generation: self.generation.clone(),
            generation,
            messages: message_rx,
            shutdown: shutdown_rx,
            metrics: self.metrics.clone(),
        };
        driver.set_state(ChannelConnectionState::Connecting);
        let task = tokio::spawn(driver.run());
        self.driver = Some(DriverHandle { messages, shutdown_tx, task });
    }

    /// Join the room for `identity`. Returns false if the message was dropped.
    pub fn join_room(&self, identity: &TrackingIdentity) -> bool {
        self.enqueue(PushMessage::JoinRoom(RoomPayload::from(identity)))
    }

    /// Leave the room for `identity`. Returns false if the message was dropped.
    pub fn leave_room(&self, identity: &TrackingIdentity) -> bool {
        self.enqueue(PushMessage::LeaveRoom(RoomPayload::from(identity)))
    }

    /// Broadcast a sample; `timestamp` is the push time, not the capture time
    pub fn push_sample(
        &self,
        sample: &LocationSample,
        identity: &TrackingIdentity,
        timestamp: DateTime<Utc>,
    ) -> bool {
        self.enqueue(PushMessage::location_update(sample, identity, timestamp))
    }

    /// Close the channel and stop redialing. Idempotent.
    ///
    /// Messages queued before the call are flushed if the link is up.
    pub async fn disconnect(&mut self) {
        let generation = &self.generation;
        self.state.send_if_modified(|state| {
            generation.fetch_add(1, Ordering::SeqCst);
            let changed = *state != ChannelConnectionState::Disconnected;
            *state = ChannelConnectionState::Disconnected;
            changed
        });
        self.metrics.set_live_state(ChannelConnectionState::Disconnected.as_gauge());

        let Some(driver) = self.driver.take() else {
            return;
        };
        let _ = driver.shutdown_tx.send(true);
        let mut task = driver.task;
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
            warn!("live_channel_close_timeout");
            task.abort();
        }
        info!("live_channel_closed");
    }

    fn enqueue(&self, message: PushMessage) -> bool {
        let event = message.event_name();
        let driver = match &self.driver {
            Some(driver) if self.connection_state() == ChannelConnectionState::Connected => driver,
            _ => {
                self.metrics.record_live_push(false);
                if message.is_control() {
                    warn!(event = %event, "live_channel_not_connected");
                } else {
                    debug!(event = %event, "live_channel_not_connected");
                }
                return false;
            }
        };

        match driver.messages.try_send(message) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.record_live_push(false);
                warn!(event = %event, "live_channel_queue_full");
                false
            }
        }
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(driver) = self.driver.take() {
            driver.task.abort();
        }
    }
}

/// Background task owning the transport link
struct Driver {
    connector: Arc<dyn PushConnector>,
    config: LiveChannelConfig,
    state: Arc<watch::Sender<ChannelConnectionState>>,
    events: broadcast::Sender<ChannelEvent>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    messages: mpsc::Receiver<PushMessage>,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
}

impl Driver {
    async fn run(mut self) {
        let handshake_ms = self.config.handshake_timeout.as_millis() as u64;
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.set_state(ChannelConnectionState::Connecting);

            let dial = tokio::time::timeout(self.config.handshake_timeout, self.connector.connect());
            let result = tokio::select! {
                result = dial => result,
                _ = self.shutdown.changed() => break,
            };

            match result.unwrap_or(Err(ChannelError::HandshakeTimeout(handshake_ms))) {
                Ok(link) => {
                    if attempt > 0 {
                        info!(attempt = %attempt, "live_channel_reconnected");
                        self.publish(ChannelEvent::Reconnect { attempt });
                    }
                    attempt = 0;
                    self.metrics.record_live_connect();
                    self.set_state(ChannelConnectionState::Connected);
                    info!(
                        endpoint = %self.connector.endpoint(),
                        connection_id = %link.connection_id.as_deref().unwrap_or("-"),
                        "live_channel_connected"
                    );
                    self.publish(ChannelEvent::Connect { connection_id: link.connection_id.clone() });

                    let Some(reason) = self.serve(link).await else {
                        break;
                    };
                    warn!(reason = %reason, "live_channel_link_lost");
                    self.metrics.record_live_disconnect();
                    self.set_state(ChannelConnectionState::Disconnected);
                    self.publish(ChannelEvent::Disconnect { reason });
                }
                Err(error) => {
                    log_connect_error(&self.connector.endpoint(), &error, attempt);
                    self.set_state(ChannelConnectionState::Disconnected);
                    self.publish(ChannelEvent::ConnectError { error });
                }
            }

            if attempt >= self.config.reconnect_attempts {
                warn!(attempts = %attempt, "live_channel_reconnect_failed");
                self.publish(ChannelEvent::ReconnectFailed);
                break;
            }
            attempt += 1;
            self.metrics.record_reconnect_attempt();

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        debug!("live_channel_driver_exited");
    }

    /// Serve queued messages until the link drops (`Some(reason)`) or a
    /// shutdown is requested (`None`).
    async fn serve(&mut self, link: PushLink) -> Option<String> {
        let PushLink { emitter, mut lost, .. } = link;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break None,
                reason = &mut lost => {
                    break Some(reason.unwrap_or_else(|_| "transport closed".to_string()));
                }
                message = self.messages.recv() => match message {
                    Some(message) => self.deliver(emitter.as_ref(), &message).await,
                    None => break None,
                },
            }
        };

        match outcome {
            None => {
                while let Ok(message) = self.messages.try_recv() {
                    self.deliver(emitter.as_ref(), &message).await;
                }
                emitter.close().await;
            }
            Some(_) => {
                let mut stale = 0u32;
                while self.messages.try_recv().is_ok() {
                    self.metrics.record_live_push(false);
                    stale += 1;
                }
                if stale > 0 {
                    debug!(count = %stale, "live_channel_stale_messages_dropped");
                }
            }
        }
        outcome
    }

    async fn deliver(&self, emitter: &dyn PushEmitter, message: &PushMessage) {
        match emitter.emit(message).await {
            Ok(()) => {
                self.metrics.record_live_push(true);
                debug!(event = %message.event_name(), "live_channel_emitted");
            }
            Err(e) => {
                self.metrics.record_live_push(false);
                warn!(event = %message.event_name(), error = %e, "live_channel_emit_failed");
            }
        }
    }

    fn is_current(&self) -> bool {
        self.current_generation.load(Ordering::SeqCst) == self.generation
    }

    fn set_state(&self, new_state: ChannelConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if !self.is_current() || *state == new_state {
                return false;
            }
            *state = new_state;
            true
        });
        if changed {
            self.metrics.set_live_state(new_state.as_gauge());
        }
    }

    /// Events are sent under the state lock so they serialize with disconnect()
    fn publish(&self, event: ChannelEvent) {
        self.state.send_if_modified(|_| {
            if self.is_current() {
                let _ = self.events.send(event.clone());
            }
            false
        });
    }
}

#[cold]
fn log_connect_error(endpoint: &str, error: &ChannelError, attempt: u32) {
    warn!(endpoint = %endpoint, error = %error, attempt = %attempt, "live_channel_connect_error");
}
