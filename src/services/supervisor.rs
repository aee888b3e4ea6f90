//! Tracking session supervisor
//!
//! Owns one sampler and one live channel for a driver/bus pair and fans
//! every sample out to both delivery channels:
//! - Durable channel: one spawned request per sample, never awaited by the
//!   session loop, failures logged and counted
//! - Live channel: non-blocking enqueue, dropped while not connected
//!
//! The session loop is the only place either component is touched. It
//! re-joins the driver room on every live `Connect` event and runs the
//! shutdown sequence (stop sampler, leave room, disconnect) on every exit
//! path, including the handle being dropped.

use crate::domain::error::SensorError;
use crate::domain::types::{
    epoch_ms, ChannelConnectionState, LocationSample, SamplerState, SessionStatistics,
    TrackingIdentity,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::backend::DurableChannel;
use crate::io::live_channel::{ChannelEvent, LiveChannel, LiveChannelConfig, PushConnector};
use crate::services::geolocation::{GeolocationSource, DEFAULT_MIN_DISTANCE_M};
use crate::services::sampler::{Sampler, SamplerEvent, SamplerOptions, DEFAULT_RESTART_DELAY};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SAMPLE_BUFFER: usize = 64;
const COMMAND_BUFFER: usize = 8;
const SESSION_EVENT_BUFFER: usize = 64;

/// Log a failed durable delivery (cold path)
#[cold]
fn log_durable_failure(identity: &TrackingIdentity, e: &crate::domain::error::DeliveryError) {
    warn!(identity = %identity, error = %e, "durable_update_failed");
}

/// Everything a session talks to
#[derive(Clone)]
pub struct SessionDeps {
    pub source: Arc<dyn GeolocationSource>,
    pub durable: Arc<dyn DurableChannel>,
    pub connector: Arc<dyn PushConnector>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub interval: Duration,
    pub min_distance_m: f64,
    pub restart_delay: Duration,
    pub live: LiveChannelConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            min_distance_m: DEFAULT_MIN_DISTANCE_M,
            restart_delay: DEFAULT_RESTART_DELAY,
            live: LiveChannelConfig::default(),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.sample_interval(),
            min_distance_m: config.min_distance_m(),
            restart_delay: config.restart_delay(),
            live: LiveChannelConfig::from_config(config),
        }
    }
}

/// Observable session state
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub identity: TrackingIdentity,
    pub connection: ChannelConnectionState,
    pub connection_id: Option<String>,
    pub sampler: SamplerState,
    pub statistics: SessionStatistics,
    pub last_sample: Option<LocationSample>,
    /// False once the shutdown sequence has run
    pub tracking: bool,
}

impl SessionStatus {
    fn new(identity: TrackingIdentity) -> Self {
        Self {
            session_id: Uuid::now_v7(),
            identity,
            connection: ChannelConnectionState::Disconnected,
            connection_id: None,
            sampler: SamplerState::Idle,
            statistics: SessionStatistics::new(epoch_ms()),
            last_sample: None,
            tracking: true,
        }
    }
}

/// What the session reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Sample(LocationSample),
    /// Sensor failed; the owner may `retry()` now or `stop()` the session.
    /// The sampler restarts on its own after the restart delay otherwise.
    SensorAlert(SensorError),
    Connectivity(ChannelConnectionState),
}

/// Result of stopping a session. Local tracking has ended either way.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Ended,
    /// The backend did not acknowledge the end of the session
    EndedWithWarning(String),
}

enum Command {
    Retry(oneshot::Sender<bool>),
    Resume(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

pub struct TrackingSession;

impl TrackingSession {
    /// Start tracking for `identity`.
    ///
    /// Order: live channel opened (with the room re-join handler already
    /// subscribed), then the sampler started. A sampler that cannot get
    /// access surfaces as a `SensorAlert`; the session keeps running so
    /// the owner can retry.
    pub async fn start(
        identity: TrackingIdentity,
        deps: SessionDeps,
        settings: SessionSettings,
    ) -> SessionHandle {
        let SessionDeps { source, durable, connector, metrics } = deps;

        let mut live = LiveChannel::new(settings.live.clone(), metrics.clone());
        let channel_events = live.subscribe();
        let channel_state = live.state_watch();
        live.connect(connector.clone());

        let mut sampler = Sampler::new(source, metrics.clone())
            .with_restart_delay(settings.restart_delay)
            .with_min_distance(settings.min_distance_m);
        let sampler_state = sampler.subscribe_state();
        let (sample_tx, sample_rx) = mpsc::channel(SAMPLE_BUFFER);
        sampler.start(SamplerOptions { interval: settings.interval, events: sample_tx.clone() }).await;

        let mut initial = SessionStatus::new(identity.clone());
        initial.connection = live.connection_state();
        initial.sampler = sampler.state();
        let (status_tx, status_rx) = watch::channel(initial);
        let (events, _) = broadcast::channel(SESSION_EVENT_BUFFER);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        info!(
            identity = %identity,
            session_id = %status_tx.borrow().session_id,
            interval_ms = %settings.interval.as_millis(),
            "session_started"
        );

        let session = Session {
            identity: identity.clone(),
            interval: settings.interval,
            live,
            connector,
            sampler,
            sample_tx,
            sample_rx,
            durable: durable.clone(),
            metrics,
            status: status_tx,
            events: events.clone(),
            channel_events,
            channel_state,
            sampler_state,
            commands: command_rx,
        };
        let task = tokio::spawn(session.run());

        SessionHandle { commands: command_tx, status: status_rx, events, durable, identity, task }
    }
}

/// Owner's handle on a running session. Dropping it shuts the session
/// down locally without notifying the backend.
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    durable: Arc<dyn DurableChannel>,
    identity: TrackingIdentity,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn identity(&self) -> &TrackingIdentity {
        &self.identity
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Restart the sampler now (the "retry" answer to a sensor alert)
    pub async fn retry(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Retry(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Bring a resumed session back up: restart the sampler unless it is
    /// active and reconnect the live channel if it is disconnected
    pub async fn resume(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Resume(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Run the shutdown sequence, then tell the backend the session ended
    pub async fn stop(self) -> StopOutcome {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "session_task_failed");
        }

        match self.durable.end_session(&self.identity).await {
            Ok(()) => {
                info!(identity = %self.identity, "session_ended");
                StopOutcome::Ended
            }
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "session_end_not_acknowledged");
                StopOutcome::EndedWithWarning(e.to_string())
            }
        }
    }
}

/// Stop the sampler, leave the room, disconnect the live channel.
///
/// Every step runs regardless of the state the others are in; afterwards
/// the sampler is idle and the channel disconnected.
pub async fn shutdown_sequence(
    sampler: &mut Sampler,
    live: &mut LiveChannel,
    identity: &TrackingIdentity,
) {
    sampler.stop();
    if !live.leave_room(identity) {
        debug!(identity = %identity, "session_leave_room_skipped");
    }
    live.disconnect().await;
}

struct Session {
    identity: TrackingIdentity,
    interval: Duration,
    live: LiveChannel,
    connector: Arc<dyn PushConnector>,
    sampler: Sampler,
    sample_tx: mpsc::Sender<SamplerEvent>,
    sample_rx: mpsc::Receiver<SamplerEvent>,
    durable: Arc<dyn DurableChannel>,
    metrics: Arc<Metrics>,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    channel_events: broadcast::Receiver<ChannelEvent>,
    channel_state: watch::Receiver<ChannelConnectionState>,
    sampler_state: watch::Receiver<SamplerState>,
    commands: mpsc::Receiver<Command>,
}

impl Session {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Retry(reply)) => {
                        let started = self.restart_sampler().await;
                        let _ = reply.send(started);
                    }
                    Some(Command::Resume(reply)) => {
                        self.resume().await;
                        let _ = reply.send(());
                    }
                    Some(Command::Stop(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = self.sample_rx.recv() => self.on_sampler_event(event),
                event = self.channel_events.recv() => self.on_channel_event(event),
                Ok(()) = self.channel_state.changed() => {
                    let state = *self.channel_state.borrow_and_update();
                    self.status.send_modify(|s| s.connection = state);
                    let _ = self.events.send(SessionEvent::Connectivity(state));
                }
                Ok(()) = self.sampler_state.changed() => {
                    let state = *self.sampler_state.borrow_and_update();
                    self.status.send_modify(|s| s.sampler = state);
                }
            }
        }
    }

    fn on_sampler_event(&mut self, event: SamplerEvent) {
        match event {
            SamplerEvent::Sample(sample) => self.on_sample(sample),
            SamplerEvent::Failure(error) => {
                warn!(identity = %self.identity, error = %error, "session_sensor_alert");
                let _ = self.events.send(SessionEvent::SensorAlert(error));
            }
        }
    }

    fn on_sample(&mut self, sample: LocationSample) {
        self.metrics.record_sample();
        self.status.send_modify(|s| {
            s.statistics.record(&sample);
            s.last_sample = Some(sample.clone());
        });

        // Durable channel: independent request, never awaited here
        let durable = self.durable.clone();
        let metrics = self.metrics.clone();
        let identity = self.identity.clone();
        let outgoing = sample.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = durable.send(&outgoing, &identity).await;
            metrics.record_durable_delivery(result.is_ok(), started.elapsed().as_millis() as u64);
            if let Err(e) = result {
                log_durable_failure(&identity, &e);
            }
        });

        // Live channel: enqueue or drop
        self.live.push_sample(&sample, &self.identity, Utc::now());

        debug!(
            identity = %self.identity,
            lat = %sample.latitude,
            lon = %sample.longitude,
            "session_sample"
        );
        let _ = self.events.send(SessionEvent::Sample(sample));
    }

    fn on_channel_event(&mut self, event: Result<ChannelEvent, RecvError>) {
        match event {
            Ok(ChannelEvent::Connect { connection_id }) => {
                self.status.send_modify(|s| s.connection_id = connection_id);
                if self.live.join_room(&self.identity) {
                    info!(identity = %self.identity, "session_room_joined");
                }
            }
            Ok(ChannelEvent::ReconnectFailed) => {
                warn!(identity = %self.identity, "session_live_channel_gave_up");
            }
            Ok(other) => debug!(event = ?other, "session_channel_event"),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped = %skipped, "session_channel_events_lagged");
            }
            Err(RecvError::Closed) => {}
        }
    }

    async fn restart_sampler(&mut self) -> bool {
        let options = SamplerOptions { interval: self.interval, events: self.sample_tx.clone() };
        self.sampler.start(options).await
    }

    async fn resume(&mut self) {
        if self.sampler.state() != SamplerState::Active {
            info!(identity = %self.identity, "session_resume_sampler");
            self.restart_sampler().await;
        }
        if self.live.connection_state() == ChannelConnectionState::Disconnected {
            info!(identity = %self.identity, "session_resume_live_channel");
            self.live.connect(self.connector.clone());
        }
    }

    async fn shutdown(&mut self) {
        shutdown_sequence(&mut self.sampler, &mut self.live, &self.identity).await;
        let connection = self.live.connection_state();
        let sampler = self.sampler.state();
        self.status.send_modify(|s| {
            s.tracking = false;
            s.connection = connection;
            s.sampler = sampler;
        });
        let samples = self.status.borrow().statistics.sample_count;
        info!(identity = %self.identity, samples = %samples, "session_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::DeliveryError;
    use crate::domain::types::RawFix;
    use crate::io::feed_source::FeedSource;
    use crate::io::live_channel::{PushMessage, EVENT_JOIN_ROOM, EVENT_LEAVE_ROOM};
    use crate::io::loopback::LoopbackConnector;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Durable channel that records calls; optionally fails them
    #[derive(Default)]
    struct RecordingDurable {
        sent: Mutex<Vec<(LocationSample, TrackingIdentity)>>,
        ended: Mutex<Vec<TrackingIdentity>>,
        fail: bool,
    }

    #[async_trait]
    impl DurableChannel for RecordingDurable {
        async fn send(
            &self,
            sample: &LocationSample,
            identity: &TrackingIdentity,
        ) -> Result<(), DeliveryError> {
            self.sent.lock().push((sample.clone(), identity.clone()));
            if self.fail {
                return Err(DeliveryError::Status(503));
            }
            Ok(())
        }

        async fn end_session(&self, identity: &TrackingIdentity) -> Result<(), DeliveryError> {
            self.ended.lock().push(identity.clone());
            if self.fail {
                return Err(DeliveryError::Rejected(Some("No active session".to_string())));
            }
            Ok(())
        }
    }

    struct Harness {
        feed: FeedSource,
        connector: LoopbackConnector,
        durable: Arc<RecordingDurable>,
        metrics: Arc<Metrics>,
    }

    impl Harness {
        fn new(fail_durable: bool) -> Self {
            Self {
                feed: FeedSource::new(),
                connector: LoopbackConnector::new(),
                durable: Arc::new(RecordingDurable { fail: fail_durable, ..Default::default() }),
                metrics: Arc::new(Metrics::new()),
            }
        }

        fn deps(&self) -> SessionDeps {
            SessionDeps {
                source: Arc::new(self.feed.clone()),
                durable: self.durable.clone(),
                connector: Arc::new(self.connector.clone()),
                metrics: self.metrics.clone(),
            }
        }

        async fn start(&self) -> SessionHandle {
            let handle =
                TrackingSession::start(identity(), self.deps(), SessionSettings::default()).await;
            settle().await;
            handle
        }
    }

    fn identity() -> TrackingIdentity {
        TrackingIdentity::new("D1", "B1")
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn fix() -> RawFix {
        RawFix { accuracy: Some(5.0), speed: Some(2.5), ..RawFix::at(12.9, 77.6) }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_fans_out_to_both_channels() {
        let harness = Harness::new(false);
        let handle = harness.start().await;
        assert_eq!(harness.connector.sent_events(), vec![EVENT_JOIN_ROOM]);

        assert!(harness.feed.push_fix(fix()));
        settle().await;

        let sent = harness.durable.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.latitude, 12.9);
        assert_eq!(sent[0].1, identity());

        let pushed = harness.connector.sent();
        assert_eq!(pushed.len(), 2);
        let PushMessage::LocationUpdate(update) = &pushed[1] else {
            panic!("expected location update, got {:?}", pushed[1]);
        };
        assert_eq!((update.latitude, update.longitude), (12.9, 77.6));
        assert_eq!(update.bus_id, "B1");
        assert_eq!(update.accuracy, Some(5.0));

        let status = handle.status();
        assert_eq!(status.statistics.sample_count, 1);
        assert_eq!(status.connection, ChannelConnectionState::Connected);
        assert_eq!(status.connection_id.as_deref(), Some("loopback-1"));
        assert_eq!(status.sampler, SamplerState::Active);
        assert_eq!(handle.stop().await, StopOutcome::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_count_samples_despite_delivery_failures() {
        let harness = Harness::new(true);
        harness.connector.set_fail_connects(true);
        let handle = harness.start().await;

        harness.feed.push_fix(fix());
        settle().await;
        harness.feed.push_fix(RawFix::at(12.95, 77.6));
        settle().await;

        assert_eq!(handle.status().statistics.sample_count, 2);
        assert_eq!(harness.metrics.durable_failed_total(), 2);
        assert!(harness.connector.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_rejoined_on_reconnect() {
        let harness = Harness::new(false);
        let _handle = harness.start().await;

        assert!(harness.connector.drop_link("ping timeout"));
        settle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(harness.connector.sent_events(), vec![EVENT_JOIN_ROOM, EVENT_JOIN_ROOM]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_runs_shutdown_then_ends_session() {
        let harness = Harness::new(false);
        let handle = harness.start().await;
        let status = handle.status_watch();

        assert_eq!(handle.stop().await, StopOutcome::Ended);
        settle().await;

        assert_eq!(harness.connector.sent_events(), vec![EVENT_JOIN_ROOM, EVENT_LEAVE_ROOM]);
        assert_eq!(harness.feed.active_watches(), 0);
        assert_eq!(harness.durable.ended.lock().as_slice(), &[identity()]);

        let last = status.borrow().clone();
        assert!(!last.tracking);
        assert_eq!(last.sampler, SamplerState::Idle);
        assert_eq!(last.connection, ChannelConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_warns_when_backend_fails() {
        let harness = Harness::new(true);
        let handle = harness.start().await;
        match handle.stop().await {
            StopOutcome::EndedWithWarning(reason) => assert!(reason.contains("No active session")),
            other => panic!("expected warning, got {:?}", other),
        }
        settle().await;
        assert_eq!(harness.feed.active_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_alert_and_retry() {
        let harness = Harness::new(false);
        let handle = harness.start().await;
        let mut events = handle.subscribe();

        harness.feed.fail(SensorError::Unavailable("antenna".to_string()));
        settle().await;
        let mut alerts = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::SensorAlert(_)) {
                alerts += 1;
            }
        }
        assert_eq!(alerts, 1);
        assert_eq!(handle.status().sampler, SamplerState::Restarting);

        assert!(handle.retry().await);
        settle().await;
        assert_eq!(harness.feed.watch_count(), 2);
        assert_eq!(handle.status().sampler, SamplerState::Active);

        // The pending automatic restart was cancelled by the retry
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(harness.feed.watch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_surfaces_as_alert() {
        let harness = Harness::new(false);
        harness.feed.set_access(false);
        let handle =
            TrackingSession::start(identity(), harness.deps(), SessionSettings::default()).await;
        let mut events = handle.subscribe();
        settle().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&SessionEvent::SensorAlert(SensorError::PermissionDenied)));
        assert_eq!(handle.status().sampler, SamplerState::Idle);

        harness.feed.set_access(true);
        assert!(handle.retry().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_restores_sampler_and_channel() {
        let harness = Harness::new(false);
        harness.connector.set_fail_connects(true);
        let handle = harness.start().await;

        // Exhaust the reconnect budget
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(handle.status().connection, ChannelConnectionState::Disconnected);
        let attempts = harness.connector.connect_attempts();

        harness.connector.set_fail_connects(false);
        handle.resume().await;
        settle().await;

        assert_eq!(harness.connector.connect_attempts(), attempts + 1);
        assert_eq!(handle.status().connection, ChannelConnectionState::Connected);
        // Sampler was already active and is left alone
        assert_eq!(harness.feed.watch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_still_shuts_down() {
        let harness = Harness::new(false);
        let handle = harness.start().await;
        drop(handle);
        settle().await;
        settle().await;

        assert_eq!(harness.feed.active_watches(), 0);
        assert_eq!(harness.connector.sent_events(), vec![EVENT_JOIN_ROOM, EVENT_LEAVE_ROOM]);
        assert!(harness.durable.ended.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_samples_after_stop() {
        let harness = Harness::new(false);
        let handle = harness.start().await;
        let mut events = handle.subscribe();
        handle.stop().await;
        settle().await;

        assert!(!harness.feed.push_fix(fix()));
        settle().await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SessionEvent::Sample(_)), "sample after stop: {:?}", event);
        }
        assert!(harness.durable.sent.lock().is_empty());
    }

    /// Shutdown must hold from any combination of already-torn-down parts
    #[tokio::test(start_paused = true)]
    async fn test_shutdown_sequence_any_prior_state() {
        for mask in 0u8..8 {
            let feed = FeedSource::new();
            let connector = LoopbackConnector::new();
            let metrics = Arc::new(Metrics::new());
            let mut sampler = Sampler::new(Arc::new(feed.clone()), metrics.clone());
            let mut live = LiveChannel::new(LiveChannelConfig::default(), metrics);
            let (tx, _rx) = mpsc::channel(8);

            live.connect(Arc::new(connector.clone()));
            sampler.start(SamplerOptions { interval: Duration::from_secs(10), events: tx }).await;
            settle().await;
            live.join_room(&identity());

            if mask & 0b001 != 0 {
                sampler.stop();
            }
            if mask & 0b010 != 0 {
                live.leave_room(&identity());
            }
            if mask & 0b100 != 0 {
                live.disconnect().await;
            }

            shutdown_sequence(&mut sampler, &mut live, &identity()).await;
            shutdown_sequence(&mut sampler, &mut live, &identity()).await;

            assert_eq!(sampler.state(), SamplerState::Idle, "mask {mask:03b}");
            assert_eq!(
                live.connection_state(),
                ChannelConnectionState::Disconnected,
                "mask {mask:03b}"
            );
            settle().await;
            assert_eq!(feed.active_watches(), 0, "mask {mask:03b}");
        }
    }
}
