//! Per-client wiring of cache, queue, transport and sync manager.
//!
//! Several contexts can live in one process, each with its own client id,
//! which is how the multi-client tests simulate separate devices.
//!
//! The context also keeps a weak registry of live documents so the same
//! server document is represented by one [`Document`] instance per client:
//! a collection and a sequence holding the same animal share it, and a
//! server id assigned through the queue reaches every holder.

use crate::cache::{CacheConfig, LocalCache};
use crate::client::Transport;
use crate::manager::SyncManager;
use crate::queue::{MutationQueue, QueueConfig, QueueEvent};
use crate::storage::{KvBackend, MemoryBackend};
use crate::store::RemoteStore;
use ginger_core::event::lock;
use ginger_core::{fields_of, Document, DocumentRef, KeyPath, ListenerId, Result, SetOptions, SyncError, ID_FIELD};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

#[derive(Default)]
struct Registry {
    by_cid: HashMap<String, Weak<Document>>,
    by_id: HashMap<(String, String), Weak<Document>>,
}

impl Registry {
    fn insert(&mut self, doc: &DocumentRef) {
        self.by_cid.insert(doc.cid().to_string(), Arc::downgrade(doc));
        if let Some(id) = doc.id() {
            self.by_id.insert((doc.bucket().to_string(), id), Arc::downgrade(doc));
        }
    }

    fn prune(&mut self) {
        self.by_cid.retain(|_, d| alive(d).is_some());
        self.by_id.retain(|_, d| alive(d).is_some());
    }
}

fn alive(doc: &Weak<Document>) -> Option<DocumentRef> {
    doc.upgrade().filter(|d| !d.is_destroyed())
}

pub struct SyncContext {
    client_id: String,
    cache: Arc<LocalCache>,
    queue: Arc<MutationQueue>,
    manager: Arc<SyncManager>,
    registry: Mutex<Registry>,
    id_listener: ListenerId,
}

impl SyncContext {
    /// Build a context over `transport`, replaying any mutations left in
    /// `journal` from a previous run.
    pub fn new<T>(transport: Arc<T>, cache: Arc<LocalCache>, journal: Arc<dyn KvBackend>, config: QueueConfig) -> Result<Arc<Self>>
    where
        T: Transport + 'static,
    {
        let client_id = transport.client_id().to_string();
        let remote: Arc<dyn RemoteStore> = transport.clone();
        let transport: Arc<dyn Transport> = transport;
        let queue = Arc::new(MutationQueue::open(client_id.clone(), Arc::clone(&cache), remote, journal, config)?);
        let manager = Arc::new(SyncManager::new(transport, Arc::clone(&queue)));

        Ok(Arc::new_cyclic(|this: &Weak<SyncContext>| {
            let this = this.clone();
            let id_listener = queue.on("id:", move |event| {
                if let (Some(ctx), QueueEvent::IdAssigned { old_id, new_id, .. }) = (this.upgrade(), event) {
                    ctx.promote(old_id, new_id);
                }
            });
            log::debug!("sync context {} ready", client_id);
            Self {
                client_id,
                cache,
                queue,
                manager,
                registry: Mutex::new(Registry::default()),
                id_listener,
            }
        }))
    }

    /// A context with an in-memory cache and journal.
    pub fn in_memory<T>(transport: Arc<T>) -> Result<Arc<Self>>
    where
        T: Transport + 'static,
    {
        let cache = Arc::new(LocalCache::open(Arc::new(MemoryBackend::new()), CacheConfig::default())?);
        Self::new(transport, cache, Arc::new(MemoryBackend::new()), QueueConfig::default())
    }

    /// Id the server uses to skip echoes of this client's own writes.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    /// Outgoing mutations and remote-first reads.
    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    /// Track `doc` so a server id assigned to its creation reaches it.
    pub fn register(&self, doc: &DocumentRef) {
        let mut registry = lock(&self.registry);
        if registry.by_cid.len() % 256 == 255 {
            registry.prune();
        }
        registry.insert(doc);
    }

    /// The live document for `bucket`/`id`, if this client holds one.
    pub fn find_document(&self, bucket: &str, id: &str) -> Option<DocumentRef> {
        let registry = lock(&self.registry);
        registry
            .by_id
            .get(&(bucket.to_string(), id.to_string()))
            .or_else(|| registry.by_cid.get(id))
            .and_then(alive)
    }

    /// Materialize a server document. A live instance is reused and updated
    /// without producing mutations. The caller receives one reference,
    /// which containers adopt.
    pub fn document(&self, bucket: &str, value: &Value) -> Result<DocumentRef> {
        let id = match value.get(ID_FIELD) {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => return Err(SyncError::Serialization(format!("document in {} without _id", bucket))),
        };
        if let Some(doc) = self.find_document(bucket, &id) {
            doc.retain();
            doc.set(fields_of(value.clone()), SetOptions::nosync());
            return Ok(doc);
        }
        let doc = Document::from_persisted(bucket, value)?;
        self.register(&doc);
        Ok(doc)
    }

    /// Read a document through the queue (remote first, cache when offline).
    pub async fn fetch_document(&self, key_path: &KeyPath) -> Result<DocumentRef> {
        let bucket = key_path
            .bucket()
            .ok_or_else(|| SyncError::NotFound(format!("no bucket in {}", key_path)))?
            .to_string();
        let value = self.queue.fetch(key_path).await?;
        self.document(&bucket, &value)
    }

    /// Handle pending transport events, then drain the queue.
    pub async fn sync(&self) -> Result<usize> {
        self.manager.pump_pending().await;
        self.queue.exec().await
    }

    /// Process transport events in the background for as long as this
    /// context lives.
    pub fn spawn(&self) -> JoinHandle<()> {
        self.manager.spawn()
    }

    fn promote(&self, cid: &str, id: &str) {
        let doc = lock(&self.registry).by_cid.get(cid).and_then(alive);
        let Some(doc) = doc else {
            return;
        };
        match doc.assign_id(id) {
            Ok(_) => lock(&self.registry).insert(&doc),
            Err(e) => log::error!("{}", e),
        }
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        self.queue.off(self.id_listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubConfig, SyncHub};
    use crate::loopback::LoopbackTransport;
    use crate::rights::AllowAll;
    use crate::server::Server;
    use crate::store::MemoryStore;
    use ginger_core::MutationRecord;
    use serde_json::json;

    async fn context() -> Arc<SyncContext> {
        let hub = SyncHub::local(HubConfig::for_testing(), None);
        let server = Arc::new(Server::new(Arc::new(MemoryStore::new()), Arc::new(AllowAll), Some(hub)));
        SyncContext::in_memory(LoopbackTransport::connect(server, "alice").await).unwrap()
    }

    #[tokio::test]
    async fn test_document_instances_are_shared() {
        let ctx = context().await;
        let a = ctx.document("animals", &json!({"_id": "1", "name": "ant"})).unwrap();
        let b = ctx.document("animals", &json!({"_id": "1", "name": "anteater"})).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.ref_count(), 2);
        assert_eq!(a.get("name"), Some(json!("anteater")));
        assert!(ctx.document("animals", &json!({"name": "x"})).is_err());
    }

    #[tokio::test]
    async fn test_destroyed_documents_are_not_reused() {
        let ctx = context().await;
        let a = ctx.document("animals", &json!({"_id": "1"})).unwrap();
        a.release().unwrap();
        let b = ctx.document("animals", &json!({"_id": "1"})).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_background_pump_stops_with_context() {
        let ctx = context().await;
        let pump = ctx.spawn();
        tokio::task::yield_now().await;
        assert!(!pump.is_finished());

        drop(ctx);
        tokio::time::timeout(std::time::Duration::from_secs(1), pump)
            .await
            .expect("pump should stop once the context is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn test_delivered_create_assigns_server_id() {
        let ctx = context().await;
        let doc = Document::create("animals", fields_of(json!({"name": "gorilla"})));
        ctx.register(&doc);
        assert!(doc.mark_queued());
        ctx.queue()
            .add(MutationRecord::create(KeyPath::new(["animals"]), doc.cid(), doc.to_value(), ctx.client_id()))
            .unwrap();

        assert_eq!(ctx.sync().await.unwrap(), 1);
        let id = doc.id().unwrap();
        let found = ctx.find_document("animals", &id).unwrap();
        assert!(Arc::ptr_eq(&found, &doc));

        let fetched = ctx.fetch_document(&KeyPath::new(["animals", id.as_str()])).await.unwrap();
        assert!(Arc::ptr_eq(&fetched, &doc));
    }
}
