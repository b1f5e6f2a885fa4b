//! Production [`super::KvStore`] backend, speaking to a real etcd cluster.
//!
//! CAS is implemented as read-then-guarded-write: read the current value
//! and `mod_revision`, compare against `expected_prior` in Rust (so the
//! absent/empty-equivalence rule in spec §4.2 is exactly the same code
//! path as [`super::memory::MemoryStore`]), then commit the write inside a
//! single-key transaction comparing on that `mod_revision` (or on
//! `version == 0` for an insert), so a racing writer between the read and
//! the write is caught as `Outdated` rather than silently overwritten.
//! This is the same two-phase CAS idiom used by etcd-backed overlay
//! network registries (e.g. flannel's etcd backend).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use futures::StreamExt;
use tokio::sync::broadcast;

use super::{matches_prior, ChangeKind, Entry, KeyEvent, KvStore, NodeEvent, PutOutcome, StoreEvent};
use crate::error::{CoreError, Result};

const WATCH_CAPACITY: usize = 1024;
const NODE_PREFIX: &str = "nodes/";
const NODE_LEASE_TTL_SECS: i64 = 20;

pub struct EtcdStore {
    client: Client,
    node_lease: Mutex<Option<i64>>,
    node_watch: Mutex<Option<broadcast::Sender<NodeEvent>>>,
    key_watch: Mutex<HashMap<(String, String), broadcast::Sender<KeyEvent>>>,
    prefix_watch: Mutex<HashMap<String, broadcast::Sender<StoreEvent>>>,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None::<ConnectOptions>)
            .await
            .map_err(|e| CoreError::Storage(anyhow::anyhow!(e)))?;
        Ok(EtcdStore {
            client,
            node_lease: Mutex::new(None),
            node_watch: Mutex::new(None),
            key_watch: Mutex::new(HashMap::new()),
            prefix_watch: Mutex::new(HashMap::new()),
        })
    }

    fn full_key(store: &str, key: &str) -> String {
        format!("{store}/{key}")
    }

    fn store_prefix(store: &str) -> String {
        format!("{store}/")
    }

    fn strip_prefix<'a>(prefix: &str, key: &'a str) -> &'a str {
        key.strip_prefix(prefix).unwrap_or(key)
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, store: &str, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let full = Self::full_key(store, key);
        let resp = self
            .client
            .kv_client()
            .get(full, None)
            .await
            .map_err(|e| CoreError::Storage(anyhow::anyhow!(e)))?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision() as u64)))
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Entry>> {
        let prefix = Self::store_prefix(store);
        let resp = self
            .client
            .kv_client()
            .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| CoreError::Storage(anyhow::anyhow!(e)))?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| Entry {
                key: Self::strip_prefix(&prefix, &String::from_utf8_lossy(kv.key())).to_string(),
                value: kv.value().to_vec(),
                modify_index: kv.mod_revision() as u64,
            })
            .collect())
    }

    async fn put(
        &self,
        store: &str,
        key: &str,
        new_value: &[u8],
        expected_prior: Option<&[u8]>,
    ) -> Result<PutOutcome> {
        let full = Self::full_key(store, key);
        let current = self.get(store, key).await?;
        let current_bytes = current.as_ref().map(|(v, _)| v.as_slice());
        if !matches_prior(current_bytes, expected_prior) {
            return Ok(PutOutcome::Outdated);
        }

        let cmp = match &current {
            Some((_, mod_revision)) => {
                Compare::mod_revision(full.clone(), CompareOp::Equal, *mod_revision as i64)
            }
            None => Compare::version(full.clone(), CompareOp::Equal, 0),
        };
        let put_op = TxnOp::put(full.clone(), new_value.to_vec(), Some(PutOptions::new()));
        let txn = Txn::new().when([cmp]).and_then([put_op]);
        let resp = self
            .client
            .kv_client()
            .txn(txn)
            .await
            .map_err(|e| CoreError::Storage(anyhow::anyhow!(e)))?;

        if !resp.succeeded() {
            return Ok(PutOutcome::Outdated);
        }
        Ok(PutOutcome::Ok)
    }

    async fn delete(&self, store: &str, key: &str) -> Result<()> {
        let full = Self::full_key(store, key);
        self.client
            .kv_client()
            .delete(full, None)
            .await
            .map_err(|e| CoreError::Storage(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn register_node(&self, addr: &str) -> Result<()> {
        let lease = self
            .client
            .lease_client()
            .grant(NODE_LEASE_TTL_SECS, None)
            .await
            .map_err(|e| CoreError::Storage(anyhow::anyhow!(e)))?;
        let lease_id = lease.id();

        self.client
            .kv_client()
            .put(
                format!("{NODE_PREFIX}{addr}"),
                addr.as_bytes().to_vec(),
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await
            .map_err(|e| CoreError::Storage(anyhow::anyhow!(e)))?;

        *self.node_lease.lock().unwrap() = Some(lease_id);

        let (mut keeper, mut stream) = self
            .client
            .lease_client()
            .keep_alive(lease_id)
            .await
            .map_err(|e| CoreError::Storage(anyhow::anyhow!(e)))?;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                (NODE_LEASE_TTL_SECS / 3).max(1) as u64,
            ));
            loop {
                ticker.tick().await;
                if keeper.keep_alive().await.is_err() {
                    break;
                }
                if stream.message().await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn deregister_node(&self, addr: &str) -> Result<()> {
        if let Some(lease_id) = self.node_lease.lock().unwrap().take() {
            let _ = self.client.lease_client().revoke(lease_id).await;
        }
        self.delete(NODE_PREFIX.trim_end_matches('/'), addr).await
    }

    async fn watch_nodes(&self) -> Result<broadcast::Receiver<NodeEvent>> {
        let mut guard = self.node_watch.lock().unwrap();
        if let Some(sender) = guard.as_ref() {
            return Ok(sender.subscribe());
        }
        let (tx, rx) = broadcast::channel(WATCH_CAPACITY);
        let forward = tx.clone();
        let mut client = self.client.clone();
        tokio::spawn(async move {
            loop {
                let watched = client
                    .watch(NODE_PREFIX, Some(WatchOptions::new().with_prefix()))
                    .await;
                let mut stream = match watched {
                    Ok((_watcher, stream)) => stream,
                    Err(err) => {
                        tracing::warn!("failed to open node watch: {err:?}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                while let Some(Ok(resp)) = stream.next().await {
                    for event in resp.events() {
                        let Some(kv) = event.kv() else { continue };
                        let addr = Self::strip_prefix(NODE_PREFIX, &String::from_utf8_lossy(kv.key()))
                            .to_string();
                        let kind = match event.event_type() {
                            EventType::Put if kv.create_revision() == kv.mod_revision() => {
                                ChangeKind::Add
                            }
                            EventType::Put => ChangeKind::Modify,
                            EventType::Delete => ChangeKind::Delete,
                        };
                        let _ = forward.send(NodeEvent { kind, addr });
                    }
                }
            }
        });
        *guard = Some(tx);
        Ok(rx)
    }

    async fn watch_key(&self, store: &str, key: &str) -> Result<broadcast::Receiver<KeyEvent>> {
        let token = (store.to_string(), key.to_string());
        let mut guard = self.key_watch.lock().unwrap();
        if let Some(sender) = guard.get(&token) {
            return Ok(sender.subscribe());
        }
        let (tx, rx) = broadcast::channel(WATCH_CAPACITY);
        let forward = tx.clone();
        let mut client = self.client.clone();
        let full = Self::full_key(store, key);
        let watch_key_name = key.to_string();
        tokio::spawn(async move {
            loop {
                let watched = client.watch(full.clone(), None).await;
                let mut stream = match watched {
                    Ok((_watcher, stream)) => stream,
                    Err(err) => {
                        tracing::warn!("failed to open key watch for {full}: {err:?}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                while let Some(Ok(resp)) = stream.next().await {
                    for event in resp.events() {
                        let value = event.kv().map(|kv| kv.value().to_vec()).unwrap_or_default();
                        let kind = match (event.event_type(), event.kv()) {
                            (EventType::Put, Some(kv)) if kv.create_revision() == kv.mod_revision() => {
                                ChangeKind::Add
                            }
                            (EventType::Put, _) => ChangeKind::Modify,
                            (EventType::Delete, _) => ChangeKind::Delete,
                        };
                        let _ = forward.send(KeyEvent {
                            kind,
                            key: watch_key_name.clone(),
                            value,
                        });
                    }
                }
            }
        });
        guard.insert(token, tx);
        Ok(rx)
    }

    async fn watch_prefix(&self, store: &str) -> Result<broadcast::Receiver<StoreEvent>> {
        let mut guard = self.prefix_watch.lock().unwrap();
        if let Some(sender) = guard.get(store) {
            return Ok(sender.subscribe());
        }
        let (tx, rx) = broadcast::channel(WATCH_CAPACITY);
        let forward = tx.clone();
        let mut client = self.client.clone();
        let prefix = Self::store_prefix(store);
        let store_name = store.to_string();
        tokio::spawn(async move {
            loop {
                let watched = client
                    .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
                    .await;
                let mut stream = match watched {
                    Ok((_watcher, stream)) => stream,
                    Err(err) => {
                        tracing::warn!("failed to open prefix watch for {prefix}: {err:?}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                while let Some(Ok(resp)) = stream.next().await {
                    for event in resp.events() {
                        let Some(kv) = event.kv() else { continue };
                        let key =
                            Self::strip_prefix(&prefix, &String::from_utf8_lossy(kv.key())).to_string();
                        let kind = match event.event_type() {
                            EventType::Put if kv.create_revision() == kv.mod_revision() => {
                                ChangeKind::Add
                            }
                            EventType::Put => ChangeKind::Modify,
                            EventType::Delete => ChangeKind::Delete,
                        };
                        let _ = forward.send(StoreEvent {
                            kind,
                            store: store_name.clone(),
                            key,
                            value: kv.value().to_vec(),
                        });
                    }
                }
            }
        });
        guard.insert(store.to_string(), tx);
        Ok(rx)
    }
}
