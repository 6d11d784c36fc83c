//! Client-side observation bookkeeping and push dispatch.
//!
//! ```text
//!  Transport events ──► SyncManager::handle
//!     Connected     → re-observe every key path, drain the queue, resync targets
//!     Disconnected  → nothing to do; requests fail until Connected
//!     Push(event)   → targets registered for event.key_path
//! ```
//!
//! Observation is counted per key path; the transport sees one `observe`
//! for the first observer and one `unobserve` for the last.

use crate::client::{Transport, TransportEvent};
use crate::protocol::PushEvent;
use crate::queue::MutationQueue;
use async_trait::async_trait;
use ginger_core::event::lock;
use ginger_core::{KeyPath, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Something that mirrors server state for one key path.
#[async_trait]
pub trait PushTarget: Send + Sync {
    async fn apply_push(&self, event: &PushEvent);

    /// Reload from the server after a reconnect.
    async fn resync(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u64);

struct Registration {
    id: TargetId,
    target: Weak<dyn PushTarget>,
}

pub struct SyncManager {
    transport: Arc<dyn Transport>,
    queue: Arc<MutationQueue>,
    observations: Mutex<HashMap<KeyPath, usize>>,
    targets: Mutex<HashMap<String, Vec<Registration>>>,
    next_target: AtomicU64,
    events: tokio::sync::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    /// Dropped with the manager, which ends a spawned pump.
    closed: watch::Sender<()>,
}

impl SyncManager {
    /// Manager over `transport`, taking its event stream.
    pub fn new(transport: Arc<dyn Transport>, queue: Arc<MutationQueue>) -> Self {
        let events = transport.take_event_rx();
        if events.is_none() {
            log::warn!("transport events already taken; pushes will not be dispatched");
        }
        Self {
            transport,
            queue,
            observations: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
            next_target: AtomicU64::new(1),
            events: tokio::sync::Mutex::new(events),
            closed: watch::channel(()).0,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// How many local observers `key_path` has.
    pub fn observer_count(&self, key_path: &KeyPath) -> usize {
        lock(&self.observations).get(key_path).copied().unwrap_or(0)
    }

    /// Every key path with at least one local observer.
    pub fn observed(&self) -> Vec<KeyPath> {
        lock(&self.observations).keys().cloned().collect()
    }

    /// Count one more observer. The first one subscribes on the server; if
    /// that fails for lack of a connection it is retried after reconnect.
    pub async fn observe(&self, key_path: &KeyPath) -> Result<()> {
        let first = {
            let mut observations = lock(&self.observations);
            let count = observations.entry(key_path.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if !first {
            return Ok(());
        }
        match self.transport.observe(key_path).await {
            Err(e) if e.is_transient() => {
                log::debug!("observe {} deferred: {}", key_path, e);
                Ok(())
            }
            other => other,
        }
    }

    /// Count one observer less. The last one unsubscribes on the server.
    pub async fn unobserve(&self, key_path: &KeyPath) -> Result<()> {
        let last = {
            let mut observations = lock(&self.observations);
            match observations.get_mut(key_path) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    observations.remove(key_path);
                    true
                }
                None => false,
            }
        };
        if !last {
            return Ok(());
        }
        match self.transport.unobserve(key_path).await {
            Err(e) if e.is_transient() => Ok(()),
            other => other,
        }
    }

    /// Route pushes for `key_path` to `target` until deregistered or dropped.
    pub fn register(&self, key_path: &KeyPath, target: Weak<dyn PushTarget>) -> TargetId {
        let id = TargetId(self.next_target.fetch_add(1, Ordering::Relaxed));
        lock(&self.targets)
            .entry(key_path.room_key())
            .or_default()
            .push(Registration { id, target });
        id
    }

    /// Stop routing pushes to `id`. Returns false if it was unknown.
    pub fn deregister(&self, id: TargetId) -> bool {
        let mut targets = lock(&self.targets);
        let mut removed = false;
        targets.retain(|_, list| {
            let before = list.len();
            list.retain(|r| r.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    fn live_targets(&self, room_key: Option<&str>) -> Vec<Arc<dyn PushTarget>> {
        let mut targets = lock(&self.targets);
        targets.retain(|_, list| {
            list.retain(|r| r.target.strong_count() > 0);
            !list.is_empty()
        });
        match room_key {
            Some(key) => targets
                .get(key)
                .map(|list| list.iter().filter_map(|r| r.target.upgrade()).collect())
                .unwrap_or_default(),
            None => targets.values().flatten().filter_map(|r| r.target.upgrade()).collect(),
        }
    }

    /// React to one transport event.
    pub async fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected().await,
            TransportEvent::Disconnected => log::info!("offline; {} mutations queued", self.queue.len()),
            TransportEvent::Push(event) => {
                let room_key = event.key_path.room_key();
                let targets = self.live_targets(Some(&room_key));
                log::debug!("{} to {} targets", event.event_name(), targets.len());
                for target in targets {
                    target.apply_push(&event).await;
                }
            }
        }
    }

    async fn on_connected(&self) {
        for key_path in self.observed() {
            if let Err(e) = self.transport.observe(&key_path).await {
                log::warn!("re-observe {} failed: {}", key_path, e);
            }
        }
        match self.queue.exec().await {
            Ok(n) if n > 0 => log::info!("replayed {} queued mutations", n),
            Ok(_) => {}
            Err(e) => log::warn!("queue replay stopped: {}", e),
        }
        for target in self.live_targets(None) {
            if let Err(e) = target.resync().await {
                log::warn!("resync after reconnect failed: {}", e);
            }
        }
    }

    /// Handle every event already waiting, without blocking. Does nothing
    /// once a spawned pump owns the stream.
    pub async fn pump_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            let event = {
                let Ok(mut events) = self.events.try_lock() else {
                    break;
                };
                match events.as_mut().map(|rx| rx.try_recv()) {
                    Some(Ok(event)) => event,
                    _ => break,
                }
            };
            self.handle(event).await;
            handled += 1;
        }
        handled
    }

    /// Drive the manager on a background task. The task owns the event
    /// stream and stops when the transport closes or the manager is dropped.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let mut closed = self.closed.subscribe();
        let events = match self.events.try_lock() {
            Ok(mut events) => events.take(),
            Err(_) => None,
        };
        tokio::spawn(async move {
            let Some(mut rx) = events else {
                log::warn!("transport events unavailable; background pump not started");
                return;
            };
            loop {
                let event = tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    _ = closed.changed() => break,
                };
                let Some(m) = manager.upgrade() else { break };
                m.handle(event).await;
            }
            log::debug!("sync manager pump stopped");
        })
    }
}
