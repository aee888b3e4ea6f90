//! In-process push transport
//!
//! Accepts every connection and records emitted messages instead of sending
//! them anywhere. `track --dry-run` uses it to exercise the full pipeline
//! without a broker; the fault switches let callers simulate refused dials,
//! stalled handshakes and dropped links.

use crate::domain::error::ChannelError;
use crate::io::live_channel::{PushConnector, PushEmitter, PushLink, PushMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

#[derive(Default)]
struct LoopbackState {
    fail_connects: bool,
    hang_connects: bool,
    connect_attempts: u32,
    dial_times: Vec<Instant>,
    closed_links: u32,
    sent: Vec<PushMessage>,
    lost_tx: Option<oneshot::Sender<String>>,
}

#[derive(Clone, Default)]
pub struct LoopbackConnector {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse subsequent dials
    pub fn set_fail_connects(&self, fail: bool) {
        self.state.lock().fail_connects = fail;
    }

    /// Never complete subsequent dials
    pub fn set_hang_connects(&self, hang: bool) {
        self.state.lock().hang_connects = hang;
    }

    /// Drop the current link as if the transport closed. False if no link is up.
    pub fn drop_link(&self, reason: &str) -> bool {
        match self.state.lock().lost_tx.take() {
            Some(tx) => tx.send(reason.to_string()).is_ok(),
            None => false,
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// When each dial started, on tokio's clock
    pub fn dial_times(&self) -> Vec<Instant> {
        self.state.lock().dial_times.clone()
    }

    pub fn closed_links(&self) -> u32 {
        self.state.lock().closed_links
    }

    /// Every message emitted so far, in order
    pub fn sent(&self) -> Vec<PushMessage> {
        self.state.lock().sent.clone()
    }

    pub fn sent_events(&self) -> Vec<&'static str> {
        self.state.lock().sent.iter().map(PushMessage::event_name).collect()
    }
}

#[async_trait]
impl PushConnector for LoopbackConnector {
    fn endpoint(&self) -> String {
        "loopback".to_string()
    }

    async fn connect(&self) -> Result<PushLink, ChannelError> {
        let (attempt, fail, hang) = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            state.dial_times.push(Instant::now());
            (state.connect_attempts, state.fail_connects, state.hang_connects)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(ChannelError::Connect("loopback refused connection".to_string()));
        }

        let (lost_tx, lost) = oneshot::channel();
        self.state.lock().lost_tx = Some(lost_tx);
        Ok(PushLink {
            emitter: Box::new(LoopbackEmitter { state: self.state.clone() }),
            lost,
            connection_id: Some(format!("loopback-{attempt}")),
        })
    }
}

struct LoopbackEmitter {
    state: Arc<Mutex<LoopbackState>>,
}

#[async_trait]
impl PushEmitter for LoopbackEmitter {
    async fn emit(&self, message: &PushMessage) -> Result<(), ChannelError> {
        let payload = message.encode()?;
        debug!(
            event = %message.event_name(),
            payload = %String::from_utf8_lossy(&payload),
            "loopback_emit"
        );
        self.state.lock().sent.push(message.clone());
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed_links += 1;
        state.lost_tx = None;
    }
}
