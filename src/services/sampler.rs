//! Location sampler - turns a geolocation source into a stream of samples
//!
//! The sampler owns at most one running watch. Valid fixes are normalized
//! into [`LocationSample`]s and forwarded on the caller's event channel;
//! invalid fixes are dropped silently. A sensor failure is reported once,
//! the watch is torn down, and a single restart is attempted after
//! `restart_delay`. `stop()` cancels both the watch and any pending restart.
//!
//! Every emission is gated on a generation counter bumped by `start()` and
//! `stop()`, so nothing from a cancelled run reaches the caller.

use crate::domain::error::SensorError;
use crate::domain::types::{LocationSample, SamplerState};
use crate::infra::metrics::Metrics;
use crate::services::geolocation::{GeolocationSource, WatchOptions, DEFAULT_MIN_DISTANCE_M};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay between a sensor failure and the restart attempt
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Output of the sampler
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerEvent {
    Sample(LocationSample),
    Failure(SensorError),
}

/// Per-start options
#[derive(Debug, Clone)]
pub struct SamplerOptions {
    /// Nominal sampling cadence
    pub interval: Duration,
    /// Where samples and failures are delivered
    pub events: mpsc::Sender<SamplerEvent>,
}

pub struct Sampler {
    source: Arc<dyn GeolocationSource>,
    min_distance_m: f64,
    restart_delay: Duration,
    state: Arc<watch::Sender<SamplerState>>,
    generation: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
    metrics: Arc<Metrics>,
}

impl Sampler {
    pub fn new(source: Arc<dyn GeolocationSource>, metrics: Arc<Metrics>) -> Self {
        let (state, _) = watch::channel(SamplerState::Idle);
        Self {
            source,
            min_distance_m: DEFAULT_MIN_DISTANCE_M,
            restart_delay: DEFAULT_RESTART_DELAY,
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            task: None,
            metrics,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_min_distance(mut self, meters: f64) -> Self {
        self.min_distance_m = meters;
        self
    }

    pub fn state(&self) -> SamplerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SamplerState> {
        self.state.subscribe()
    }

    /// Start (or restart) continuous sampling.
    ///
    /// Any running watch or pending restart is cancelled first. Returns
    /// false if the source refuses access; a `PermissionDenied` failure is
    /// emitted in that case and the sampler stays idle.
    pub async fn start(&mut self, options: SamplerOptions) -> bool {
        self.cancel();

        if !self.source.request_access().await {
            warn!(source = %self.source.name(), "sampler_permission_denied");
            self.metrics.record_sensor_failure();
            let _ = options.events.try_send(SamplerEvent::Failure(SensorError::PermissionDenied));
            return false;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let pump = Pump {
            source: self.source.clone(),
            watch_options: WatchOptions::new(options.interval, self.min_distance_m),
            events: options.events.clone(),
            state: self.state.clone(),
            current_generation: self.generation.clone(),
            generation,
            restart_delay: self.restart_delay,
            metrics: self.metrics.clone(),
        };
        pump.set_state(SamplerState::Active);
        self.task = Some(tokio::spawn(pump.run()));

        info!(
            source = %self.source.name(),
            interval_ms = %options.interval.as_millis(),
            min_distance_m = %self.min_distance_m,
            "sampler_started"
        );
        true
    }

    /// Cancel the watch and any pending restart. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let was_running = self.cancel();
        if was_running {
            info!(source = %self.source.name(), "sampler_stopped");
        }
    }

    /// One-shot fix lookup, independent of the continuous watch
    pub async fn current_fix(&self, timeout: Duration) -> Result<LocationSample, SensorError> {
        if !self.source.request_access().await {
            return Err(SensorError::PermissionDenied);
        }

        let options = WatchOptions {
            interval: Duration::ZERO,
            fastest_interval: Duration::ZERO,
            min_distance_m: 0.0,
        };
        let mut subscription = self.source.watch(&options);
        let first_valid = async {
            loop {
                match subscription.next().await {
                    Some(Ok(fix)) => {
                        if let Some(sample) = LocationSample::from_fix(&fix) {
                            return Ok(sample);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(SensorError::StreamEnded),
                }
            }
        };

        match tokio::time::timeout(timeout, first_valid).await {
            Ok(result) => result,
            Err(_) => Err(SensorError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Invalidate the current run. Returns true if a task was running.
    fn cancel(&mut self) -> bool {
        let generation = &self.generation;
        self.state.send_modify(|state| {
            generation.fetch_add(1, Ordering::SeqCst);
            *state = SamplerState::Idle;
        });
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// State moved into the sampling task
struct Pump {
    source: Arc<dyn GeolocationSource>,
    watch_options: WatchOptions,
    events: mpsc::Sender<SamplerEvent>,
    state: Arc<watch::Sender<SamplerState>>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    restart_delay: Duration,
    metrics: Arc<Metrics>,
}

impl Pump {
    async fn run(self) {
        let mut restarting = false;
        loop {
            if restarting {
                if !self.source.request_access().await {
                    warn!(source = %self.source.name(), "sampler_restart_permission_denied");
                    self.metrics.record_sensor_failure();
                    self.emit(SamplerEvent::Failure(SensorError::PermissionDenied));
                    tokio::time::sleep(self.restart_delay).await;
                    continue;
                }
                self.metrics.record_sampler_restart();
                self.set_state(SamplerState::Active);
                info!(source = %self.source.name(), "sampler_restarted");
            }

            let mut subscription = self.source.watch(&self.watch_options);
            let error = loop {
                match subscription.next().await {
                    Some(Ok(fix)) => self.forward(&fix),
                    Some(Err(e)) => break e,
                    None => break SensorError::StreamEnded,
                }
            };
            drop(subscription);

            log_sensor_failure(self.source.name(), &error, self.restart_delay);
            self.metrics.record_sensor_failure();
            self.emit(SamplerEvent::Failure(error));
            self.set_state(SamplerState::Restarting);

            tokio::time::sleep(self.restart_delay).await;
            restarting = true;
        }
    }

    fn forward(&self, fix: &crate::domain::types::RawFix) {
        match LocationSample::from_fix(fix) {
            Some(sample) => self.emit(SamplerEvent::Sample(sample)),
            None => {
                self.metrics.record_fix_discarded();
                debug!(source = %self.source.name(), "sampler_fix_discarded");
            }
        }
    }

    fn is_current(&self) -> bool {
        self.current_generation.load(Ordering::SeqCst) == self.generation
    }

    fn emit(&self, event: SamplerEvent) {
        if !self.is_current() {
            return;
        }
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_sampler_event_dropped();
                warn!(source = %self.source.name(), "sampler_event_dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(source = %self.source.name(), "sampler_receiver_closed");
            }
        }
    }

    fn set_state(&self, new_state: SamplerState) {
        self.state.send_if_modified(|state| {
            if !self.is_current() || *state == new_state {
                return false;
            }
            *state = new_state;
            true
        });
    }
}

#[cold]
fn log_sensor_failure(source: &str, error: &SensorError, restart_delay: Duration) {
    warn!(
        source = %source,
        error = %error,
        restart_in_ms = %restart_delay.as_millis(),
        "sampler_sensor_failure"
    );
}
