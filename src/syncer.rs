//! Periodic local reconciler (spec §4.7): converges this node's OVS
//! internal ports against the cluster's network directory.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::bridge::BridgeManager;
use crate::error::Result;
use crate::firewall::Firewall;
use crate::netlink::NetLink;
use crate::network::{Network, MTU};
use crate::registry::NetworkRegistry;

const SYNC_INTERVAL: Duration = Duration::from_secs(5);

pub struct NetworkSyncer {
    registry: Arc<NetworkRegistry>,
    bridge: Arc<BridgeManager>,
    netlink: Arc<dyn NetLink>,
    firewall: Arc<dyn Firewall>,
    gateways: Mutex<HashSet<String>>,
}

impl NetworkSyncer {
    pub fn new(
        registry: Arc<NetworkRegistry>,
        bridge: Arc<BridgeManager>,
        netlink: Arc<dyn NetLink>,
        firewall: Arc<dyn Firewall>,
    ) -> Self {
        NetworkSyncer {
            registry,
            bridge,
            netlink,
            firewall,
            gateways: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = self.sync_once().await {
                tracing::warn!("network syncer iteration failed: {err}");
                continue;
            }
        }
    }

    pub async fn sync_once(&self) -> Result<()> {
        let networks = self.registry.get_networks().await?;
        let mut seen = HashSet::new();
        let mut gateways = self.gateways.lock().await;

        for network in &networks {
            seen.insert(network.name.clone());
            let exists = self
                .netlink
                .interface_ipv4_net(&network.name)
                .await?
                .is_some();
            if !exists {
                if let Err(err) = self.create_local_gateway(network, &networks).await {
                    tracing::warn!("failed to converge network {}: {err}", network.name);
                    continue;
                }
            }
            gateways.insert(network.name.clone());
        }

        let stale: Vec<String> = gateways.difference(&seen).cloned().collect();
        for name in stale {
            if let Err(err) = self.bridge.delete_port(&name).await {
                tracing::warn!("failed to delete orphaned gateway port {name}: {err}");
                continue;
            }
            gateways.remove(&name);
        }
        Ok(())
    }

    async fn create_local_gateway(&self, network: &Network, all: &[Network]) -> Result<()> {
        self.bridge
            .add_internal_port(&network.name, network.vni, MTU)
            .await?;
        self.netlink.set_mtu(None, &network.name, MTU).await?;
        self.netlink
            .assign_address(&network.name, network.gateway, network.subnet.prefix_len())
            .await?;
        self.netlink.link_up(&network.name).await?;
        self.firewall.install_network_rules(network, all).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::tests::NoopFirewall;
    use crate::kv::memory::MemoryStore;
    use crate::netlink::tests::FakeNetLink;
    use crate::ovsdb::tests::FakeOvsdb;
    use ipnet::Ipv4Net;

    #[tokio::test]
    async fn creates_missing_local_gateway_then_reaps_it() {
        let kv = Arc::new(MemoryStore::new());
        let netlink = Arc::new(FakeNetLink::default());
        let bridge = Arc::new(BridgeManager::new(Arc::new(FakeOvsdb::default())));
        let firewall = Arc::new(NoopFirewall::default());
        let registry = Arc::new(NetworkRegistry::new(
            kv,
            netlink.clone(),
            bridge.clone(),
            firewall.clone(),
        ));
        let subnet: Ipv4Net = "10.0.42.0/24".parse().unwrap();
        registry.create_network("cxy", subnet).await.unwrap();

        let syncer = NetworkSyncer::new(registry.clone(), bridge, netlink, firewall);
        syncer.sync_once().await.unwrap();
        assert!(syncer.gateways.lock().await.contains("cxy"));

        registry.delete_network("cxy").await.unwrap();
        syncer.sync_once().await.unwrap();
        assert!(!syncer.gateways.lock().await.contains("cxy"));
    }
}
