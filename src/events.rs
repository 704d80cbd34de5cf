//! Event Bus - fan-out of `{type, data}` envelopes to live subscribers
//!
//! Each subscriber owns a bounded queue and delivery uses `try_send`, so the
//! caller never waits on a slow reader. A subscriber whose queue is full is
//! marked lagged and kept; its next receive discards the stale backlog and
//! yields a fresh `services` snapshot instead. Only closed subscribers are
//! removed. The subscriber map has its own lock; the only nested acquisition
//! is bus -> registry during `subscribe`, never the reverse.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::config::defaults::SUBSCRIBER_BUFFER;

/// Envelope discriminator
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Full snapshot sent once to a new subscriber
    Init,
    ServiceUpdate,
    /// Full snapshot: sweep results, refresh requests and lag recovery
    Services,
    RemediationUpdate,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: EventKind,
    data: &'a T,
}

/// Serialize one envelope to its JSON wire form.
pub fn encode<T: Serialize>(kind: EventKind, data: &T) -> Result<Arc<str>, serde_json::Error> {
    serde_json::to_string(&Envelope { kind, data }).map(Arc::from)
}

type Snapshot = Box<dyn Fn() -> Result<Arc<str>, serde_json::Error> + Send + Sync>;

struct Subscriber {
    sink: mpsc::Sender<Arc<str>>,
    lagged: Arc<AtomicBool>,
}

pub struct EventBus {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(SUBSCRIBER_BUFFER)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl EventBus {
    /// `buffer` is the per-subscriber queue depth.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| {
            warn!("Mutex poisoned on EventBus subscribers, recovering");
            e.into_inner()
        })
    }

    /// Register a subscriber whose first envelope is an `init` snapshot.
    ///
    /// `snapshot` runs while the subscriber map is locked, so no broadcast
    /// can slip in between the snapshot and the registration. It is kept
    /// by the subscription and called again whenever the subscriber lags.
    pub fn subscribe<T, F>(self: &Arc<Self>, snapshot: F) -> Result<Subscription, serde_json::Error>
    where
        T: Serialize + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lagged = Arc::new(AtomicBool::new(false));

        let mut subscribers = self.lock();
        let init = encode(EventKind::Init, &snapshot())?;
        if tx.try_send(init).is_err() {
            warn!(subscriber = id, "Could not queue init snapshot");
        }
        subscribers.insert(
            id,
            Subscriber {
                sink: tx,
                lagged: Arc::clone(&lagged),
            },
        );
        let total = subscribers.len();
        drop(subscribers);

        info!(subscriber = id, total, "Subscriber connected");
        Ok(Subscription {
            id,
            rx,
            lagged,
            resync: Box::new(move || encode(EventKind::Services, &snapshot())),
            bus: Arc::clone(self),
        })
    }

    /// Deliver an envelope to every current subscriber without blocking.
    ///
    /// A full queue marks the subscriber lagged; a closed one is removed.
    /// Returns the number of subscribers that accepted the envelope.
    pub fn broadcast<T: Serialize>(&self, kind: EventKind, data: &T) -> usize {
        let message = match encode(kind, data) {
            Ok(m) => m,
            Err(e) => {
                warn!(kind = ?kind, error = %e, "Failed to encode event envelope");
                return 0;
            }
        };

        let mut subscribers = self.lock();
        let mut delivered = 0;
        subscribers.retain(|id, sub| match sub.sink.try_send(Arc::clone(&message)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                if !sub.lagged.swap(true, Ordering::AcqRel) {
                    warn!(subscriber = *id, kind = ?kind, "Subscriber queue full, will resync");
                }
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = *id, "Subscriber gone, removing");
                false
            }
        });
        delivered
    }

    fn unsubscribe(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            info!(subscriber = id, "Subscriber disconnected");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
    lagged: Arc<AtomicBool>,
    resync: Snapshot,
    bus: Arc<EventBus>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("lagged", &self.lagged.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Next envelope, or `None` once the bus has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        if let Some(snapshot) = self.take_resync() {
            return Some(snapshot);
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        if let Some(snapshot) = self.take_resync() {
            return Some(snapshot);
        }
        self.rx.try_recv().ok()
    }

    /// After a lag, drop the queued backlog and hand out a current snapshot.
    ///
    /// The snapshot is taken after the backlog is cleared, so it covers
    /// every envelope that was skipped or discarded.
    fn take_resync(&mut self) -> Option<Arc<str>> {
        if !self.lagged.swap(false, Ordering::AcqRel) {
            return None;
        }
        let mut discarded = 0usize;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        match (self.resync)() {
            Ok(snapshot) => {
                info!(subscriber = self.id, discarded, "Subscriber resynced with snapshot");
                Some(snapshot)
            }
            Err(e) => {
                warn!(subscriber = self.id, error = %e, "Failed to encode resync snapshot");
                None
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
