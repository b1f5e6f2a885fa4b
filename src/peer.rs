//! Overlay peer reconciliation (spec §4.6): turns node-membership watch
//! events into VXLAN tunnel ports on the local bridge.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::bridge::BridgeManager;
use crate::kv::{ChangeKind, NodeEvent};

pub struct PeerManager {
    bridge: Arc<BridgeManager>,
    local_addr: String,
}

impl PeerManager {
    pub fn new(bridge: Arc<BridgeManager>, local_addr: String) -> Self {
        PeerManager { bridge, local_addr }
    }

    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<NodeEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("peer manager missed {skipped} node events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn handle(&self, event: NodeEvent) {
        if event.addr == self.local_addr {
            return;
        }
        match event.kind {
            ChangeKind::Add => {
                if let Err(err) = self.bridge.add_vxlan_port(&event.addr).await {
                    tracing::warn!("failed to add vxlan port for {}: {err}", event.addr);
                }
            }
            ChangeKind::Delete => {
                let port = format!("vxlan-{}", event.addr);
                if let Err(err) = self.bridge.delete_port(&port).await {
                    tracing::warn!("failed to delete vxlan port for {}: {err}", event.addr);
                }
            }
            ChangeKind::Modify => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovsdb::tests::FakeOvsdb;

    #[tokio::test]
    async fn ignores_events_for_the_local_node() {
        let fake = Arc::new(FakeOvsdb::default());
        let bridge = Arc::new(BridgeManager::new(fake.clone()));
        let manager = PeerManager::new(bridge, "10.0.0.1".to_string());
        manager
            .handle(NodeEvent {
                kind: ChangeKind::Add,
                addr: "10.0.0.1".to_string(),
            })
            .await;
        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn adds_and_removes_peer_vxlan_ports() {
        let fake = Arc::new(FakeOvsdb::default());
        let bridge = Arc::new(BridgeManager::new(fake.clone()));
        let manager = PeerManager::new(bridge, "10.0.0.1".to_string());
        manager
            .handle(NodeEvent {
                kind: ChangeKind::Add,
                addr: "10.0.0.2".to_string(),
            })
            .await;
        manager
            .handle(NodeEvent {
                kind: ChangeKind::Delete,
                addr: "10.0.0.2".to_string(),
            })
            .await;
        let calls = fake.calls.lock().unwrap();
        assert!(calls[0].contains("add_vxlan_port"));
        assert!(calls[0].contains("10.0.0.2"));
        assert!(calls[1].contains("delete_port vxlan-10.0.0.2"));
    }
}
