//! Typed wrapper over the cluster's replicated KV store (spec §4.2).
//!
//! The store itself (consensus, persistence, leader election) is an
//! external collaborator, same as OVSDB or netlink are elsewhere in this
//! crate — spec §1 explicitly delegates "graceful leader handoff in the KV
//! store" to that store. What's in scope here is the CAS/watch contract
//! the rest of the core relies on, so [`KvStore`] is implemented twice:
//! [`etcd::EtcdStore`] against a real cluster, and [`memory::MemoryStore`]
//! for tests and single-node bootstrap.

pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

/// Discriminates the three flavors of change a watch can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub kind: ChangeKind,
    pub addr: String,
}

#[derive(Debug, Clone)]
pub struct KeyEvent {
    pub kind: ChangeKind,
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub kind: ChangeKind,
    pub store: String,
    pub key: String,
    pub value: Vec<u8>,
}

/// One row as returned by [`KvStore::get_all`].
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub modify_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Ok,
    Outdated,
}

/// Returns whether `current` (bytewise) matches `expected`, treating an
/// absent value and an empty value as equivalent (spec §4.2 Put semantics).
pub(crate) fn matches_prior(current: Option<&[u8]>, expected: Option<&[u8]>) -> bool {
    current.unwrap_or(&[]) == expected.unwrap_or(&[])
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, store: &str, key: &str) -> Result<Option<(Vec<u8>, u64)>>;

    async fn get_all(&self, store: &str) -> Result<Vec<Entry>>;

    /// CAS put. `expected_prior` of `None` means "key must not already hold
    /// a different value" (absent or empty both satisfy that).
    async fn put(
        &self,
        store: &str,
        key: &str,
        new_value: &[u8],
        expected_prior: Option<&[u8]>,
    ) -> Result<PutOutcome>;

    async fn delete(&self, store: &str, key: &str) -> Result<()>;

    /// Registers this node's bind address as cluster-visible. Corresponds
    /// to the source's `Agent.Join`.
    async fn register_node(&self, addr: &str) -> Result<()>;

    /// Withdraws this node's membership. Corresponds to `Agent.Leave`.
    async fn deregister_node(&self, addr: &str) -> Result<()>;

    async fn watch_nodes(&self) -> Result<broadcast::Receiver<NodeEvent>>;

    async fn watch_key(&self, store: &str, key: &str) -> Result<broadcast::Receiver<KeyEvent>>;

    async fn watch_prefix(&self, store: &str) -> Result<broadcast::Receiver<StoreEvent>>;
}
