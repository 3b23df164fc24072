//! Live, filtered feed of one table for a set of scopes.
//!
//! A [`ShapeHandle`] owns one backend feed. A single pump task reads it and
//! fans every message out to per-subscriber unbounded queues, so each
//! consumer (matchers, the projector) sees the whole sequence from the moment
//! it registered, in feed order, without taking anything from the others.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::channel::mpsc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::{ShapeFeed, ShapeMessage, ShapeSource, ShapeSpec};
use crate::constants::REPLAY_CAPACITY;
use crate::error::{FeedError, SyncError};
use crate::models::Operation;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeState {
    /// Feed opened, snapshot (or resume backlog) still arriving
    Connecting,
    /// Snapshot complete, tailing live changes
    Live,
    /// Transport failed. The handle is dead and must be reopened.
    Disconnected { reason: String },
    /// Every reference to the handle was released
    Closed,
}

impl ShapeState {
    pub fn is_ended(&self) -> bool {
        matches!(self, ShapeState::Disconnected { .. } | ShapeState::Closed)
    }
}

struct FanOut {
    subscribers: Vec<mpsc::UnboundedSender<ShapeMessage>>,
    /// Queue registered at spawn, so it holds everything since the open
    origin: Option<mpsc::UnboundedReceiver<ShapeMessage>>,
    history: VecDeque<ShapeMessage>,
    cursor: Option<u64>,
    ended: bool,
}

impl FanOut {
    fn publish(&mut self, message: ShapeMessage) {
        let sequence = message.sequence();
        self.cursor = Some(self.cursor.map_or(sequence, |cursor| cursor.max(sequence)));

        self.subscribers
            .retain(|tx| tx.unbounded_send(message.clone()).is_ok());

        if self.history.len() == REPLAY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(message);
    }

    /// Dropping the senders ends every subscriber stream
    fn end(&mut self) {
        self.ended = true;
        self.subscribers.clear();
    }
}

struct HandleInner {
    id: u64,
    spec: ShapeSpec,
    fresh: bool,
    fan_out: Arc<Mutex<FanOut>>,
    state: Arc<watch::Sender<ShapeState>>,
    pump: JoinHandle<()>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.pump.abort();
        self.state.send_if_modified(|state| {
            if state.is_ended() {
                return false;
            }
            *state = ShapeState::Closed;
            true
        });
        self.fan_out.lock().end();
        debug!(handle = self.id, shape = %self.spec, "Shape handle closed");
    }
}

/// Reference-counted handle to one open shape feed.
///
/// Clones share the same connection. The connection is torn down when the
/// last clone is dropped or closed.
#[derive(Clone)]
pub struct ShapeHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ShapeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapeHandle")
            .field("id", &self.inner.id)
            .field("spec", &self.inner.spec)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl ShapeHandle {
    fn spawn(spec: ShapeSpec, resume_after: Option<u64>, feed: ShapeFeed) -> Self {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        let (origin_tx, origin_rx) = mpsc::unbounded();
        let fan_out = Arc::new(Mutex::new(FanOut {
            subscribers: vec![origin_tx],
            origin: Some(origin_rx),
            history: VecDeque::new(),
            cursor: resume_after,
            ended: false,
        }));
        let (state, _) = watch::channel(ShapeState::Connecting);
        let state = Arc::new(state);

        let pump = tokio::spawn(pump(id, feed, fan_out.clone(), state.clone()));

        Self {
            inner: Arc::new(HandleInner {
                id,
                spec,
                fresh: resume_after.is_none(),
                fan_out,
                state,
                pump,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn spec(&self) -> &ShapeSpec {
        &self.inner.spec
    }

    /// True when the handle was opened with a full snapshot rather than a
    /// resume cursor
    pub fn is_fresh(&self) -> bool {
        self.inner.fresh
    }

    pub fn state(&self) -> ShapeState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ShapeState> {
        self.inner.state.subscribe()
    }

    /// Highest sequence delivered so far; reopen with this to resume
    pub fn resume_cursor(&self) -> Option<u64> {
        self.inner.fan_out.lock().cursor
    }

    /// Every feed message from now on. Ends when the handle disconnects or
    /// closes; already ended if it has.
    pub fn messages(&self) -> BoxStream<'static, ShapeMessage> {
        let mut fan_out = self.inner.fan_out.lock();
        if fan_out.ended {
            return stream::empty().boxed();
        }
        let (tx, rx) = mpsc::unbounded();
        fan_out.subscribers.push(tx);
        rx.boxed()
    }

    /// Like [`messages`](Self::messages), but first replays the retained
    /// history of this handle (the most recent messages, oldest first)
    pub fn replay(&self) -> BoxStream<'static, ShapeMessage> {
        let mut fan_out = self.inner.fan_out.lock();
        let (tx, rx) = mpsc::unbounded();
        for message in &fan_out.history {
            let _ = tx.unbounded_send(message.clone());
        }
        if !fan_out.ended {
            fan_out.subscribers.push(tx);
        }
        rx.boxed()
    }

    /// The complete sequence since the feed was opened, snapshot included.
    ///
    /// Only the first caller gets it; the projection that owns this handle
    /// takes it. Later callers get [`replay`](Self::replay), which is
    /// bounded by the retained history.
    pub fn from_open(&self) -> BoxStream<'static, ShapeMessage> {
        let origin = self.inner.fan_out.lock().origin.take();
        match origin {
            Some(rx) => rx.boxed(),
            None => self.replay(),
        }
    }

    /// Operations only
    pub fn operations(&self) -> BoxStream<'static, Operation> {
        self.messages()
            .filter_map(|message| async move {
                match message {
                    ShapeMessage::Operation(op) => Some(op),
                    ShapeMessage::UpToDate { .. } => None,
                }
            })
            .boxed()
    }

    /// Resolves once the snapshot is complete, or fails if the handle ended first
    pub async fn wait_until_live(&self) -> Result<(), SyncError> {
        let mut state = self.watch_state();
        let reached = state
            .wait_for(|state| *state != ShapeState::Connecting)
            .await
            .map(|state| *state == ShapeState::Live)
            .unwrap_or(false);
        if reached {
            Ok(())
        } else {
            Err(SyncError::SubscriptionClosed)
        }
    }

    /// Release this reference
    pub fn close(self) {
        drop(self);
    }
}

async fn pump(
    handle: u64,
    mut feed: ShapeFeed,
    fan_out: Arc<Mutex<FanOut>>,
    state: Arc<watch::Sender<ShapeState>>,
) {
    while let Some(item) = feed.next().await {
        match item {
            Ok(message) => {
                let up_to_date = matches!(message, ShapeMessage::UpToDate { .. });
                fan_out.lock().publish(message);
                if up_to_date {
                    state.send_if_modified(|state| {
                        if *state != ShapeState::Connecting {
                            return false;
                        }
                        *state = ShapeState::Live;
                        true
                    });
                }
            }
            Err(err) => {
                warn!(handle, error = %err, "Shape feed failed");
                disconnect(&fan_out, &state, err.to_string());
                return;
            }
        }
    }
    warn!(handle, "Shape feed ended");
    disconnect(&fan_out, &state, "feed ended".to_string());
}

/// State flips before the streams end, so a consumer whose stream ended
/// always sees an ended state
fn disconnect(fan_out: &Mutex<FanOut>, state: &watch::Sender<ShapeState>, reason: String) {
    state.send_replace(ShapeState::Disconnected { reason });
    fan_out.lock().end();
}

/// Opens shape handles against a backend feed
#[derive(Clone)]
pub struct ShapeSubscription {
    source: Arc<dyn ShapeSource>,
}

impl ShapeSubscription {
    pub fn new(source: Arc<dyn ShapeSource>) -> Self {
        Self { source }
    }

    /// Open with a fresh consistent snapshot
    pub async fn open(&self, spec: ShapeSpec) -> Result<ShapeHandle, FeedError> {
        self.connect(spec, None).await
    }

    /// Reopen after a disconnect, replaying operations after `cursor`
    pub async fn resume(&self, spec: ShapeSpec, cursor: u64) -> Result<ShapeHandle, FeedError> {
        self.connect(spec, Some(cursor)).await
    }

    async fn connect(
        &self,
        spec: ShapeSpec,
        resume_after: Option<u64>,
    ) -> Result<ShapeHandle, FeedError> {
        let feed = self.source.open_shape(&spec, resume_after).await?;
        let handle = ShapeHandle::spawn(spec, resume_after, feed);
        debug!(
            handle = handle.id(),
            shape = %handle.spec(),
            resume_after = ?resume_after,
            "Opened shape"
        );
        Ok(handle)
    }
}
