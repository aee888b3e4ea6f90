//! In-process geolocation source fed by the embedding application
//!
//! Used when fixes come from somewhere the agent does not own directly
//! (a platform location bridge, a simulator, a test). Every active watch
//! receives each pushed fix; no filtering is applied here.

use crate::domain::error::SensorError;
use crate::domain::types::RawFix;
use crate::services::geolocation::{FixResult, FixSubscription, GeolocationSource, WatchOptions};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const FEED_BUFFER: usize = 64;

struct FeedState {
    access: bool,
    watch_count: u32,
    watchers: Vec<mpsc::Sender<FixResult>>,
    last_options: Option<WatchOptions>,
}

/// Cloneable handle; all clones feed the same watchers
#[derive(Clone)]
pub struct FeedSource {
    state: Arc<Mutex<FeedState>>,
}

impl Default for FeedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FeedState {
                access: true,
                watch_count: 0,
                watchers: Vec::new(),
                last_options: None,
            })),
        }
    }

    /// Grant or revoke access (permission) for subsequent watches
    pub fn set_access(&self, access: bool) {
        self.state.lock().access = access;
    }

    /// Deliver a fix to every active watch. Returns false if nobody is watching.
    pub fn push_fix(&self, fix: RawFix) -> bool {
        self.broadcast(Ok(fix))
    }

    /// Deliver a sensor failure to every active watch
    pub fn fail(&self, error: SensorError) -> bool {
        self.broadcast(Err(error))
    }

    /// Total number of watches ever opened
    pub fn watch_count(&self) -> u32 {
        self.state.lock().watch_count
    }

    /// Number of watches whose subscription is still alive
    pub fn active_watches(&self) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|tx| !tx.is_closed());
        state.watchers.len()
    }

    /// Options passed to the most recent watch
    pub fn last_options(&self) -> Option<WatchOptions> {
        self.state.lock().last_options.clone()
    }

    fn broadcast(&self, item: FixResult) -> bool {
        let mut state = self.state.lock();
        state.watchers.retain(|tx| !tx.is_closed());
        let mut delivered = false;
        for tx in &state.watchers {
            if tx.try_send(item.clone()).is_ok() {
                delivered = true;
            } else {
                debug!("feed_source_watcher_full");
            }
        }
        delivered
    }
}

#[async_trait]
impl GeolocationSource for FeedSource {
    fn name(&self) -> &'static str {
        "feed"
    }

    async fn request_access(&self) -> bool {
        self.state.lock().access
    }

    fn watch(&self, options: &WatchOptions) -> FixSubscription {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let mut state = self.state.lock();
        state.watch_count += 1;
        state.last_options = Some(options.clone());
        state.watchers.push(tx);
        FixSubscription::from_receiver(rx)
    }
}
