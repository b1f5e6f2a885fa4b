//! Cluster-shared allocator and network directory (spec §4.3).
//!
//! Owns `networkStore`, `vlanStore` and `ipStore` through [`KvStore`] and
//! layers the CAS-retry bitmap envelope from spec §4.1 over them.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use serde_json;

use crate::bitmap;
use crate::bridge::BridgeManager;
use crate::error::{CoreError, Result};
use crate::firewall::Firewall;
use crate::kv::{KvStore, PutOutcome};
use crate::netlink::NetLink;
use crate::network::{
    ip_bitmap_len, ip_store_key, vlan_bitmap_len, Network, IP_STORE, MTU, NETWORK_STORE,
    VLAN_STORE,
};

/// Bound on CAS retries before an allocation gives up with `Exhausted`
/// (spec §9: "the source does not bound [retries]; implementers should").
const MAX_CAS_ATTEMPTS: usize = 128;

/// Result of [`NetworkRegistry::create_network`]: distinguishes the
/// winner of a CAS race from a node that observes an already-published
/// record, while handing back the same [`Network`] either way (spec §9
/// open question: racers get success with the existing record).
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Network),
    AlreadyExists(Network),
}

impl CreateOutcome {
    pub fn into_network(self) -> Network {
        match self {
            CreateOutcome::Created(n) | CreateOutcome::AlreadyExists(n) => n,
        }
    }
}

pub struct NetworkRegistry {
    kv: Arc<dyn KvStore>,
    netlink: Arc<dyn NetLink>,
    bridge: Arc<BridgeManager>,
    firewall: Arc<dyn Firewall>,
}

impl NetworkRegistry {
    pub fn new(
        kv: Arc<dyn KvStore>,
        netlink: Arc<dyn NetLink>,
        bridge: Arc<BridgeManager>,
        firewall: Arc<dyn Firewall>,
    ) -> Self {
        NetworkRegistry {
            kv,
            netlink,
            bridge,
            firewall,
        }
    }

    pub async fn get_network(&self, name: &str) -> Result<Network> {
        self.get_network_opt(name).await?.ok_or(CoreError::NotFound)
    }

    pub async fn get_network_opt(&self, name: &str) -> Result<Option<Network>> {
        match self.kv.get(NETWORK_STORE, name).await? {
            Some((bytes, _)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get_networks(&self) -> Result<Vec<Network>> {
        let entries = self.kv.get_all(NETWORK_STORE).await?;
        entries
            .into_iter()
            .map(|entry| serde_json::from_slice(&entry.value).map_err(CoreError::from))
            .collect()
    }

    /// Creates (or joins) the named network. See spec §4.3.
    pub async fn create_network(&self, name: &str, subnet: Ipv4Net) -> Result<CreateOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            if let Some(existing) = self.get_network_opt(name).await? {
                return Ok(CreateOutcome::AlreadyExists(existing));
            }

            let vni = self.allocate_vni().await?;

            let (effective_subnet, gateway, gateway_allocated) =
                match self.netlink.interface_ipv4_net(name).await? {
                    Some((existing_subnet, addr)) => (existing_subnet, addr, false),
                    None => {
                        let addr = self.request_ip(vni, &subnet).await?;
                        (subnet, addr, true)
                    }
                };

            let network = Network {
                name: name.to_string(),
                subnet: effective_subnet,
                gateway,
                vni,
            };

            match self
                .kv
                .put(NETWORK_STORE, name, &serde_json::to_vec(&network)?, None)
                .await?
            {
                PutOutcome::Ok => {
                    if gateway_allocated {
                        self.bridge
                            .add_internal_port(name, network.vni, MTU)
                            .await?;
                        self.netlink.set_mtu(None, name, MTU).await?;
                        self.netlink
                            .assign_address(name, gateway, effective_subnet.prefix_len())
                            .await?;
                        self.netlink.link_up(name).await?;
                    }
                    let all = self.get_networks().await?;
                    self.firewall.install_network_rules(&network, &all).await?;
                    return Ok(CreateOutcome::Created(network));
                }
                PutOutcome::Outdated => {
                    self.release_vni(vni).await?;
                    if gateway_allocated {
                        self.release_ip(gateway, &effective_subnet, vni).await?;
                    }
                    continue;
                }
            }
        }
        Err(CoreError::Exhausted)
    }

    /// Deletes a cluster-wide network record. Does not garbage-collect
    /// `ipStore/{VNI}-...` (spec §9 open question #1).
    pub async fn delete_network(&self, name: &str) -> Result<()> {
        let network = self.get_network(name).await?;
        self.kv.delete(NETWORK_STORE, name).await?;
        self.release_vni(network.vni).await?;
        self.bridge.delete_port(name).await?;
        Ok(())
    }

    pub async fn request_ip(&self, vni: u32, subnet: &Ipv4Net) -> Result<Ipv4Addr> {
        let key = ip_store_key(vni, subnet);
        let len = ip_bitmap_len(subnet);
        let pos = self.cas_bitmap_allocate(IP_STORE, &key, len).await?;
        let base = u32::from(subnet.network());
        Ok(Ipv4Addr::from(base + pos))
    }

    pub async fn release_ip(&self, ip: Ipv4Addr, subnet: &Ipv4Net, vni: u32) -> Result<bool> {
        let key = ip_store_key(vni, subnet);
        let pos = ip_bit_position(ip, subnet);
        self.cas_bitmap_clear(IP_STORE, &key, pos).await
    }

    pub async fn mark_used(&self, vni: u32, ip: Ipv4Addr, subnet: &Ipv4Net) -> Result<bool> {
        let key = ip_store_key(vni, subnet);
        let pos = ip_bit_position(ip, subnet);
        let len = ip_bitmap_len(subnet);
        self.cas_bitmap_set(IP_STORE, &key, pos, len).await
    }

    async fn allocate_vni(&self) -> Result<u32> {
        let pos = self
            .cas_bitmap_allocate(VLAN_STORE, "vlan", vlan_bitmap_len())
            .await?;
        Ok(pos)
    }

    async fn release_vni(&self, vni: u32) -> Result<bool> {
        self.cas_bitmap_clear(VLAN_STORE, "vlan", (vni - 1) as u64)
            .await
    }

    /// Allocate envelope: snapshot -> `TestAndSet` -> CAS put -> retry on
    /// `Outdated` (spec §4.1).
    async fn cas_bitmap_allocate(&self, store: &str, key: &str, len: usize) -> Result<u32> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (snapshot, mut next) = self.load_bitmap(store, key, len).await?;
            let pos = bitmap::test_and_set(&mut next);
            if pos as usize > len * 8 {
                return Err(CoreError::Exhausted);
            }
            match self.kv.put(store, key, &next, snapshot.as_deref()).await? {
                PutOutcome::Ok => return Ok(pos as u32),
                PutOutcome::Outdated => continue,
            }
        }
        Err(CoreError::Exhausted)
    }

    async fn cas_bitmap_clear(&self, store: &str, key: &str, bit: u64) -> Result<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((bytes, _)) = self.kv.get(store, key).await? else {
                return Ok(false);
            };
            let mut next = bytes.clone();
            bitmap::clear(&mut next, bit);
            match self.kv.put(store, key, &next, Some(&bytes)).await? {
                PutOutcome::Ok => return Ok(true),
                PutOutcome::Outdated => continue,
            }
        }
        Err(CoreError::Exhausted)
    }

    /// Unlike `cas_bitmap_clear`, succeeds on an absent key by initializing
    /// a zero-filled bitmap first (spec §9 open question #2).
    async fn cas_bitmap_set(&self, store: &str, key: &str, bit: u64, len: usize) -> Result<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (snapshot, mut next) = self.load_bitmap(store, key, len).await?;
            bitmap::set(&mut next, bit);
            match self.kv.put(store, key, &next, snapshot.as_deref()).await? {
                PutOutcome::Ok => return Ok(true),
                PutOutcome::Outdated => continue,
            }
        }
        Err(CoreError::Exhausted)
    }

    async fn load_bitmap(
        &self,
        store: &str,
        key: &str,
        len: usize,
    ) -> Result<(Option<Vec<u8>>, Vec<u8>)> {
        match self.kv.get(store, key).await? {
            Some((bytes, _)) => Ok((Some(bytes.clone()), bytes)),
            None => Ok((None, vec![0u8; len])),
        }
    }
}

fn ip_bit_position(ip: Ipv4Addr, subnet: &Ipv4Net) -> u64 {
    let base = u32::from(subnet.network());
    (u32::from(ip) - base - 1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::tests::NoopFirewall;
    use crate::kv::memory::MemoryStore;
    use crate::netlink::tests::FakeNetLink;
    use crate::ovsdb::tests::FakeOvsdb;

    fn registry() -> NetworkRegistry {
        let kv = Arc::new(MemoryStore::new());
        let netlink = Arc::new(FakeNetLink::default());
        let bridge = Arc::new(BridgeManager::new(Arc::new(FakeOvsdb::default())));
        let firewall = Arc::new(NoopFirewall::default());
        NetworkRegistry::new(kv, netlink, bridge, firewall)
    }

    // S1. Allocator round trip.
    #[tokio::test]
    async fn request_and_release_ip_round_trip() {
        let reg = registry();
        let subnet: Ipv4Net = "192.168.0.0/16".parse().unwrap();
        let mut ips = vec![];
        for _ in 0..5 {
            ips.push(reg.request_ip(1, &subnet).await.unwrap());
        }
        assert_eq!(
            ips,
            vec![
                "192.168.0.1".parse::<Ipv4Addr>().unwrap(),
                "192.168.0.2".parse().unwrap(),
                "192.168.0.3".parse().unwrap(),
                "192.168.0.4".parse().unwrap(),
                "192.168.0.5".parse().unwrap(),
            ]
        );

        for addr in ["192.168.0.1", "192.168.0.4", "192.168.0.2"] {
            assert!(reg
                .release_ip(addr.parse().unwrap(), &subnet, 1)
                .await
                .unwrap());
        }

        assert_eq!(
            reg.request_ip(1, &subnet).await.unwrap(),
            "192.168.0.1".parse::<Ipv4Addr>().unwrap()
        );
        assert!(reg
            .mark_used(1, "192.168.0.2".parse().unwrap(), &subnet)
            .await
            .unwrap());
        assert_eq!(
            reg.request_ip(1, &subnet).await.unwrap(),
            "192.168.0.4".parse::<Ipv4Addr>().unwrap()
        );
    }

    // S2. VNI allocation.
    #[tokio::test]
    async fn vni_allocation_reuses_released_slots() {
        let reg = registry();
        let mut vnis = vec![];
        for _ in 0..10 {
            vnis.push(reg.allocate_vni().await.unwrap());
        }
        assert_eq!(vnis, (1..=10).collect::<Vec<_>>());

        for vni in [2, 4, 6, 8, 10] {
            assert!(reg.release_vni(vni).await.unwrap());
        }
        let mut reused = vec![];
        for _ in 0..5 {
            reused.push(reg.allocate_vni().await.unwrap());
        }
        assert_eq!(reused, vec![2, 4, 6, 8, 10]);
    }

    // S3. CreateNetwork CAS race, modeled as two sequential callers racing
    // the same CAS-guarded put: the loser observes the winner's record.
    #[tokio::test]
    async fn create_network_is_idempotent_across_racers() {
        let reg = registry();
        let subnet: Ipv4Net = "10.10.1.0/24".parse().unwrap();

        let first = reg
            .create_network("foo", subnet)
            .await
            .unwrap()
            .into_network();
        let second = reg
            .create_network("foo", subnet)
            .await
            .unwrap()
            .into_network();

        assert_eq!(first, second);
        assert_eq!(reg.get_networks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_ip_on_absent_key_returns_false() {
        let reg = registry();
        let subnet: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        assert!(!reg
            .release_ip("10.0.0.5".parse().unwrap(), &subnet, 99)
            .await
            .unwrap());
    }
}
