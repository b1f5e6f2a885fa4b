//! In-process [`super::KvStore`] backend: full CAS + watch semantics
//! without a live etcd cluster. Used by the test suite and by a
//! single-node (`expectedServerNum == 1`) bootstrap where there is no
//! other node to replicate to.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{matches_prior, ChangeKind, Entry, KeyEvent, KvStore, NodeEvent, PutOutcome, StoreEvent};
use crate::error::Result;

const WATCH_CAPACITY: usize = 1024;

struct Row {
    value: Vec<u8>,
    modify_index: u64,
}

#[derive(Default)]
struct Storage {
    stores: HashMap<String, BTreeMap<String, Row>>,
}

pub struct MemoryStore {
    storage: Mutex<Storage>,
    nodes: Mutex<HashSet<String>>,
    next_index: AtomicU64,
    node_watch: Mutex<Option<broadcast::Sender<NodeEvent>>>,
    key_watch: Mutex<HashMap<(String, String), broadcast::Sender<KeyEvent>>>,
    prefix_watch: Mutex<HashMap<String, broadcast::Sender<StoreEvent>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            storage: Mutex::new(Storage::default()),
            nodes: Mutex::new(HashSet::new()),
            next_index: AtomicU64::new(1),
            node_watch: Mutex::new(None),
            key_watch: Mutex::new(HashMap::new()),
            prefix_watch: Mutex::new(HashMap::new()),
        }
    }

    fn next_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }

    fn notify_key(&self, store: &str, key: &str, kind: ChangeKind, value: Vec<u8>) {
        if let Some(sender) = self
            .key_watch
            .lock()
            .unwrap()
            .get(&(store.to_string(), key.to_string()))
        {
            let _ = sender.send(KeyEvent {
                kind,
                key: key.to_string(),
                value: value.clone(),
            });
        }
        if let Some(sender) = self.prefix_watch.lock().unwrap().get(store) {
            let _ = sender.send(StoreEvent {
                kind,
                store: store.to_string(),
                key: key.to_string(),
                value,
            });
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, store: &str, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let storage = self.storage.lock().unwrap();
        Ok(storage
            .stores
            .get(store)
            .and_then(|rows| rows.get(key))
            .map(|row| (row.value.clone(), row.modify_index)))
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Entry>> {
        let storage = self.storage.lock().unwrap();
        Ok(storage
            .stores
            .get(store)
            .map(|rows| {
                rows.iter()
                    .map(|(key, row)| Entry {
                        key: key.clone(),
                        value: row.value.clone(),
                        modify_index: row.modify_index,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put(
        &self,
        store: &str,
        key: &str,
        new_value: &[u8],
        expected_prior: Option<&[u8]>,
    ) -> Result<PutOutcome> {
        let mut storage = self.storage.lock().unwrap();
        let rows = storage.stores.entry(store.to_string()).or_default();
        let current = rows.get(key).map(|row| row.value.as_slice());
        if !matches_prior(current, expected_prior) {
            return Ok(PutOutcome::Outdated);
        }
        let kind = if current.is_some() {
            ChangeKind::Modify
        } else {
            ChangeKind::Add
        };
        let modify_index = self.next_index();
        rows.insert(
            key.to_string(),
            Row {
                value: new_value.to_vec(),
                modify_index,
            },
        );
        drop(storage);
        self.notify_key(store, key, kind, new_value.to_vec());
        Ok(PutOutcome::Ok)
    }

    async fn delete(&self, store: &str, key: &str) -> Result<()> {
        let mut storage = self.storage.lock().unwrap();
        if let Some(rows) = storage.stores.get_mut(store) {
            rows.remove(key);
        }
        drop(storage);
        self.notify_key(store, key, ChangeKind::Delete, Vec::new());
        Ok(())
    }

    async fn register_node(&self, addr: &str) -> Result<()> {
        let inserted = self.nodes.lock().unwrap().insert(addr.to_string());
        if inserted {
            if let Some(sender) = self.node_watch.lock().unwrap().as_ref() {
                let _ = sender.send(NodeEvent {
                    kind: ChangeKind::Add,
                    addr: addr.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn deregister_node(&self, addr: &str) -> Result<()> {
        let removed = self.nodes.lock().unwrap().remove(addr);
        if removed {
            if let Some(sender) = self.node_watch.lock().unwrap().as_ref() {
                let _ = sender.send(NodeEvent {
                    kind: ChangeKind::Delete,
                    addr: addr.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn watch_nodes(&self) -> Result<broadcast::Receiver<NodeEvent>> {
        let mut guard = self.node_watch.lock().unwrap();
        let sender = guard.get_or_insert_with(|| broadcast::channel(WATCH_CAPACITY).0);
        Ok(sender.subscribe())
    }

    async fn watch_key(&self, store: &str, key: &str) -> Result<broadcast::Receiver<KeyEvent>> {
        let mut guard = self.key_watch.lock().unwrap();
        let sender = guard
            .entry((store.to_string(), key.to_string()))
            .or_insert_with(|| broadcast::channel(WATCH_CAPACITY).0);
        Ok(sender.subscribe())
    }

    async fn watch_prefix(&self, store: &str) -> Result<broadcast::Receiver<StoreEvent>> {
        let mut guard = self.prefix_watch.lock().unwrap();
        let sender = guard
            .entry(store.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CAPACITY).0);
        Ok(sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_requires_matching_prior() {
        let store = MemoryStore::new();
        assert_eq!(
            store.put("s", "k", b"v1", None).await.unwrap(),
            PutOutcome::Ok
        );
        assert_eq!(
            store.put("s", "k", b"v2", None).await.unwrap(),
            PutOutcome::Outdated
        );
        assert_eq!(
            store.put("s", "k", b"v2", Some(b"v1")).await.unwrap(),
            PutOutcome::Ok
        );
        let (value, _) = store.get("s", "k").await.unwrap().unwrap();
        assert_eq!(value, b"v2");
    }

    #[tokio::test]
    async fn absent_key_treated_as_empty_prior() {
        let store = MemoryStore::new();
        assert_eq!(
            store.put("s", "k", b"v1", Some(&[])).await.unwrap(),
            PutOutcome::Ok
        );
    }

    #[tokio::test]
    async fn node_watch_delivers_add_and_delete() {
        let store = MemoryStore::new();
        let mut events = store.watch_nodes().await.unwrap();
        store.register_node("1.1.1.1").await.unwrap();
        store.deregister_node("1.1.1.1").await.unwrap();
        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Add);
        assert_eq!(first.addr, "1.1.1.1");
        let second = events.recv().await.unwrap();
        assert_eq!(second.kind, ChangeKind::Delete);
    }

    #[tokio::test]
    async fn multiple_subscribers_share_one_watch() {
        let store = MemoryStore::new();
        let mut a = store.watch_key("s", "k").await.unwrap();
        let mut b = store.watch_key("s", "k").await.unwrap();
        store.put("s", "k", b"v", None).await.unwrap();
        assert_eq!(a.recv().await.unwrap().value, b"v");
        assert_eq!(b.recv().await.unwrap().value, b"v");
    }
}
