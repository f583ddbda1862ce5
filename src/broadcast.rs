//! Per-session fan-out of change events to watchers.
//!
//! ```text
//! write ──► WatchBroker::publish ──┬──► watcher queue A ──► drain ──► stream A
//!                                  ├──► watcher queue B ──► drain ──► stream B
//!                                  └──► watcher queue C ──► drain ──► stream C
//! ```
//!
//! Every watcher owns an independent unbounded queue, so a slow
//! consumer never steals events from the others and delivery is
//! exactly-once in publish order. Shutdown and forced unsubscribe are
//! signaled with an explicit close variant rather than a reserved
//! data value, and a blocked drain wakes promptly in either case.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::UpdateEvent;

/// What a watcher queue carries: data events, or the close signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSignal {
    Update(UpdateEvent),
    /// Broker shutdown or forced unsubscribe. Always the last signal
    /// a queue carries.
    Closed,
}

/// Result of draining a watcher queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drained {
    /// At least one pending event, in publish order.
    Events(Vec<UpdateEvent>),
    /// The close signal was reached; no further events will arrive.
    Closed,
}

struct WatcherSlot {
    tx: mpsc::UnboundedSender<WatchSignal>,
    /// Distinguishes a live subscription from a replaced one, so a
    /// stale handle's cleanup cannot remove its successor's queue.
    generation: u64,
}

/// Fan-out broker for one session.
///
/// All operations are safe to call concurrently from any number of
/// connection tasks; only [`WatcherHandle::drain`] suspends.
pub struct WatchBroker {
    watchers: Mutex<HashMap<Uuid, WatcherSlot>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
    events_published: AtomicU64,
}

impl WatchBroker {
    pub fn new() -> Self {
        Self {
            watchers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            events_published: AtomicU64::new(0),
        }
    }

    /// Register a fresh empty queue for `key`.
    ///
    /// Re-subscribing an already registered key replaces its queue;
    /// the prior handle observes the close signal. Subscribing after
    /// shutdown yields a handle whose first drain returns
    /// [`Drained::Closed`].
    pub fn subscribe(self: std::sync::Arc<Self>, key: Uuid) -> WatcherHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            // The closed flag is checked under the table lock: a
            // subscribe racing shutdown either lands before the drain
            // (and is drained with the rest) or observes the flag and
            // is never registered.
            let mut watchers = self.watchers.lock().expect("watcher table poisoned");
            if self.closed.load(Ordering::SeqCst) {
                // Not registered; the handle drains straight to Closed.
                let _ = tx.send(WatchSignal::Closed);
            } else if let Some(old) = watchers.insert(key, WatcherSlot { tx, generation }) {
                let _ = old.tx.send(WatchSignal::Closed);
            }
        }

        log::debug!("watcher {key} subscribed (generation {generation})");
        WatcherHandle {
            key,
            generation,
            rx,
            broker: self,
            closed_seen: false,
        }
    }

    /// Append `event` to every registered queue and wake blocked drains.
    pub fn publish(&self, event: UpdateEvent) {
        let watchers = self.watchers.lock().expect("watcher table poisoned");
        for slot in watchers.values() {
            // A send only fails if the handle is already gone; its
            // slot will be reaped by the handle's drop.
            let _ = slot.tx.send(WatchSignal::Update(event));
        }
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove `key`'s queue; a blocked drain observes the close signal.
    pub fn unsubscribe(&self, key: &Uuid) {
        let mut watchers = self.watchers.lock().expect("watcher table poisoned");
        if let Some(slot) = watchers.remove(key) {
            let _ = slot.tx.send(WatchSignal::Closed);
            log::debug!("watcher {key} unsubscribed");
        }
    }

    /// Close every queue and reject productive re-subscription.
    /// Mirrors process-level shutdown.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut watchers = self.watchers.lock().expect("watcher table poisoned");
        for (key, slot) in watchers.drain() {
            let _ = slot.tx.send(WatchSignal::Closed);
            log::debug!("watcher {key} closed by shutdown");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of currently registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().expect("watcher table poisoned").len()
    }

    /// Total publish calls since creation (lock-free snapshot).
    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    /// Remove `key` only if it still belongs to `generation`.
    fn release(&self, key: &Uuid, generation: u64) {
        let mut watchers = self.watchers.lock().expect("watcher table poisoned");
        if let Some(slot) = watchers.get(key) {
            if slot.generation == generation {
                watchers.remove(key);
                log::debug!("watcher {key} released");
            }
        }
    }
}

impl Default for WatchBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One watcher's end of its event queue.
///
/// Dropping the handle releases the queue, so a disconnected
/// connection can never leak its watcher slot.
pub struct WatcherHandle {
    key: Uuid,
    generation: u64,
    rx: mpsc::UnboundedReceiver<WatchSignal>,
    broker: std::sync::Arc<WatchBroker>,
    closed_seen: bool,
}

impl WatcherHandle {
    pub fn key(&self) -> Uuid {
        self.key
    }

    /// Suspend until at least one signal is queued, then return all
    /// currently queued events in publish order.
    ///
    /// Returns [`Drained::Closed`] once the close signal is reached;
    /// every later call returns `Closed` immediately.
    pub async fn drain(&mut self) -> Drained {
        if self.closed_seen {
            return Drained::Closed;
        }

        let first = match self.rx.recv().await {
            Some(signal) => signal,
            None => {
                self.closed_seen = true;
                return Drained::Closed;
            }
        };

        let mut events = match first {
            WatchSignal::Update(event) => vec![event],
            WatchSignal::Closed => {
                self.closed_seen = true;
                return Drained::Closed;
            }
        };

        // Batch everything already queued; the close signal, if
        // present, is reported on the next drain after the batch.
        while let Ok(signal) = self.rx.try_recv() {
            match signal {
                WatchSignal::Update(event) => events.push(event),
                WatchSignal::Closed => {
                    self.closed_seen = true;
                    break;
                }
            }
        }

        Drained::Events(events)
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.broker.release(&self.key, self.generation);
    }
}
