//! Serialized container-attachment state machine (spec §4.5).
//!
//! `ConnectionEngine` is the sole consumer of `connectionChan`: namespace
//! manipulation for one container never overlaps with another's.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::bridge::BridgeManager;
use crate::error::{CoreError, Result};
use crate::firewall::Firewall;
use crate::netlink::NetLink;
use crate::network::{mac_for_ip, prefix_suffix, DEFAULT_NETWORK, MTU};
use crate::registry::NetworkRegistry;

/// Directory `ip netns` and friends scan for namespace handles (spec §5).
const NETNS_DIR: &str = "/var/run/netns";

/// Sentinel written into `ovs_port_id` when the add path fails after port
/// creation (spec §4.5 step 10).
pub const ENGINE_FAILURE_SENTINEL: &str = "-1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    #[serde(rename = "containerID")]
    pub container_id: String,
    #[serde(rename = "containerPID")]
    pub container_pid: String,
    #[serde(rename = "network", default)]
    pub network_name: String,
    #[serde(rename = "ovsPortID", default)]
    pub ovs_port_id: String,
    #[serde(rename = "requestIP", default)]
    pub request_ip: Option<Ipv4Addr>,
    #[serde(rename = "allocatedIP", default)]
    pub allocated_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub mac: String,
    #[serde(rename = "subnetPrefix", default)]
    pub subnet_prefix: String,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub bandwidth: String,
    #[serde(default)]
    pub delay: String,
    #[serde(rename = "RXTotal", default)]
    pub rx_total: u64,
    #[serde(rename = "TXTotal", default)]
    pub tx_total: u64,
    #[serde(rename = "RXRate", default)]
    pub rx_rate: u64,
    #[serde(rename = "TXRate", default)]
    pub tx_rate: u64,
}

pub type ConnectionTable = Arc<RwLock<HashMap<String, Connection>>>;

pub enum ConnectionAction {
    Add(Connection),
    Delete(String),
}

pub struct ConnectionCtx {
    pub action: ConnectionAction,
    pub reply: oneshot::Sender<Result<Connection>>,
}

pub struct ConnectionEngine {
    registry: Arc<NetworkRegistry>,
    bridge: Arc<BridgeManager>,
    netlink: Arc<dyn NetLink>,
    firewall: Arc<dyn Firewall>,
    table: ConnectionTable,
}

impl ConnectionEngine {
    pub fn new(
        registry: Arc<NetworkRegistry>,
        bridge: Arc<BridgeManager>,
        netlink: Arc<dyn NetLink>,
        firewall: Arc<dyn Firewall>,
        table: ConnectionTable,
    ) -> Self {
        ConnectionEngine {
            registry,
            bridge,
            netlink,
            firewall,
            table,
        }
    }

    pub fn table(&self) -> ConnectionTable {
        self.table.clone()
    }

    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ConnectionCtx>) {
        while let Some(ctx) = rx.recv().await {
            let result = match ctx.action {
                ConnectionAction::Add(conn) => self.add_connection(conn).await,
                ConnectionAction::Delete(id) => self.delete_connection(&id).await,
            };
            let _ = ctx.reply.send(result);
        }
    }

    async fn add_connection(&self, mut conn: Connection) -> Result<Connection> {
        if conn.network_name.is_empty() {
            conn.network_name = DEFAULT_NETWORK.to_string();
        }

        let network = self.registry.get_network(&conn.network_name).await?;

        let port = match self.bridge.add_container_port(network.vni).await {
            Ok(port) => port,
            Err(err) => {
                conn.ovs_port_id = ENGINE_FAILURE_SENTINEL.to_string();
                tracing::warn!("add_container_port failed for {}: {err}", conn.container_id);
                return Ok(conn);
            }
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        if let Err(err) = self
            .finish_add(&mut conn, &network.subnet, &port, network.vni, network.gateway)
            .await
        {
            tracing::warn!("connection setup failed for {}: {err}", conn.container_id);
            if let Err(cleanup_err) = self.bridge.delete_port(&port).await {
                tracing::warn!("failed to roll back port {port}: {cleanup_err}");
            }
            if let Some(ip) = conn.allocated_ip {
                if let Err(cleanup_err) = self.registry.release_ip(ip, &network.subnet, network.vni).await {
                    tracing::warn!("failed to roll back ip {ip}: {cleanup_err}");
                }
            }
            conn.ovs_port_id = ENGINE_FAILURE_SENTINEL.to_string();
            return Ok(conn);
        }

        self.bridge
            .update_port_context(&port, "container_id", &conn.container_id)
            .await
            .ok();

        self.table
            .write()
            .await
            .insert(conn.container_id.clone(), conn.clone());
        spawn_rate_sampler(self.table.clone(), conn.container_id.clone());

        Ok(conn)
    }

    async fn finish_add(
        &self,
        conn: &mut Connection,
        subnet: &Ipv4Net,
        port: &str,
        vni: u32,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        let allocated = match conn.request_ip {
            Some(ip) => {
                self.registry.mark_used(vni, ip, subnet).await?;
                ip
            }
            None => self.registry.request_ip(vni, subnet).await?,
        };
        // Recorded immediately, not after the netlink calls below: the caller's
        // failure handler inspects `conn.allocated_ip` to decide whether to
        // release the bit, and a mid-setup netlink error must not hide the
        // fact that the bit was already taken.
        conn.allocated_ip = Some(allocated);

        let mac = mac_for_ip(allocated);
        let pid = conn.container_pid.clone();
        symlink_netns(&pid).await?;

        self.netlink.move_to_namespace(port, &pid).await?;
        self.netlink.set_mtu(Some(&pid), port, MTU).await?;
        self.netlink
            .assign_address_in_namespace(&pid, port, allocated, subnet.prefix_len())
            .await?;
        self.netlink.set_mac(Some(&pid), port, &mac).await?;
        self.netlink.link_up_in_namespace(&pid, port).await?;
        self.netlink.add_default_route(&pid, gateway).await?;

        conn.ovs_port_id = port.to_string();
        conn.mac = mac;
        conn.subnet_prefix = prefix_suffix(subnet);
        conn.gateway = Some(gateway);
        Ok(())
    }

    async fn delete_connection(&self, id: &str) -> Result<Connection> {
        let conn = self
            .table
            .write()
            .await
            .remove(id)
            .ok_or(CoreError::NotFound)?;

        self.bridge.delete_port(&conn.ovs_port_id).await?;

        if let (Some(ip), Ok(network)) = (
            conn.allocated_ip,
            self.registry.get_network(&conn.network_name).await,
        ) {
            self.registry.release_ip(ip, &network.subnet, network.vni).await?;
        }

        unlink_netns(&conn.container_pid).await;

        Ok(conn)
    }

    pub async fn add_qos(&self, id: &str, bw: Option<&str>, delay: Option<&str>) -> Result<()> {
        let mut table = self.table.write().await;
        let conn = table.get_mut(id).ok_or(CoreError::NotFound)?;
        let delay_ms = delay.unwrap_or("0");
        let rate_kbit = bw.unwrap_or(crate::firewall::UNLIMITED_BANDWIDTH_KBIT);
        self.firewall
            .add_qos(&conn.container_pid, &conn.ovs_port_id, rate_kbit, delay_ms)
            .await?;
        conn.delay = delay_ms.to_string();
        conn.bandwidth = rate_kbit.to_string();
        Ok(())
    }

    pub async fn change_qos(&self, id: &str, bw: Option<&str>, delay: Option<&str>) -> Result<()> {
        let mut table = self.table.write().await;
        let conn = table.get_mut(id).ok_or(CoreError::NotFound)?;
        if let Some(delay_ms) = delay {
            self.firewall
                .change_qos(&conn.container_pid, &conn.ovs_port_id, conn.bandwidth.as_str(), delay_ms)
                .await?;
            conn.delay = delay_ms.to_string();
        }
        if let Some(rate_kbit) = bw {
            self.firewall
                .change_qos(&conn.container_pid, &conn.ovs_port_id, rate_kbit, conn.delay.as_str())
                .await?;
            conn.bandwidth = rate_kbit.to_string();
        }
        Ok(())
    }
}

async fn symlink_netns(pid: &str) -> Result<()> {
    fs::create_dir_all(NETNS_DIR)
        .await
        .map_err(|e| CoreError::OsError(e.to_string()))?;
    let target = format!("/proc/{pid}/ns/net");
    let link = format!("{NETNS_DIR}/{pid}");
    match tokio::fs::symlink(&target, &link).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(CoreError::OsError(format!("symlink {target} -> {link}: {e}"))),
    }
}

async fn unlink_netns(pid: &str) {
    let link = format!("{NETNS_DIR}/{pid}");
    match tokio::fs::remove_file(&link).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("failed to remove netns symlink {link}: {e}"),
    }
}

/// Every 2s, reads `/proc/{pid}/net/dev` for `port`'s RX/TX byte counters
/// and updates the table entry; exits when the connection disappears or
/// the proc file can no longer be read (spec §4.5.2).
fn spawn_rate_sampler(table: ConnectionTable, container_id: String) {
    tokio::spawn(async move {
        const INTERVAL: Duration = Duration::from_secs(2);
        let mut prev: Option<(u64, u64)> = None;
        loop {
            tokio::time::sleep(INTERVAL).await;
            let (pid, port) = {
                let table = table.read().await;
                match table.get(&container_id) {
                    Some(conn) => (conn.container_pid.clone(), conn.ovs_port_id.clone()),
                    None => return,
                }
            };
            let Ok(counters) = read_dev_counters(&pid, &port).await else {
                return;
            };
            let (rx, tx) = counters;
            let mut table = table.write().await;
            let Some(conn) = table.get_mut(&container_id) else {
                return;
            };
            if let Some((prev_rx, prev_tx)) = prev {
                let secs = INTERVAL.as_secs().max(1);
                conn.rx_rate = rx.saturating_sub(prev_rx) * 8 / secs;
                conn.tx_rate = tx.saturating_sub(prev_tx) * 8 / secs;
            }
            conn.rx_total = rx;
            conn.tx_total = tx;
            prev = Some((rx, tx));
        }
    });
}

async fn read_dev_counters(pid: &str, port: &str) -> Result<(u64, u64)> {
    let path = format!("/proc/{pid}/net/dev");
    let content = fs::read_to_string(&path)
        .await
        .map_err(|e| CoreError::OsError(e.to_string()))?;
    for line in content.lines() {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if name.trim() != port {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let rx = fields
            .first()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| CoreError::OsError(format!("malformed {path}")))?;
        let tx = fields
            .get(8)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| CoreError::OsError(format!("malformed {path}")))?;
        return Ok((rx / 1024, tx / 1024));
    }
    Err(CoreError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::tests::NoopFirewall;
    use crate::kv::memory::MemoryStore;
    use crate::netlink::tests::FakeNetLink;
    use crate::ovsdb::tests::FakeOvsdb;

    fn engine() -> (Arc<ConnectionEngine>, Arc<NetworkRegistry>) {
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
        let table: ConnectionTable = Arc::new(RwLock::new(HashMap::new()));
        let engine = Arc::new(ConnectionEngine::new(
            registry.clone(),
            bridge,
            netlink,
            firewall,
            table,
        ));
        (engine, registry)
    }

    #[tokio::test]
    async fn add_connection_fails_fast_on_missing_network() {
        let (engine, _registry) = engine();
        let conn = Connection {
            container_id: "c1".to_string(),
            container_pid: "1234".to_string(),
            network_name: "does-not-exist".to_string(),
            ovs_port_id: String::new(),
            request_ip: None,
            allocated_ip: None,
            mac: String::new(),
            subnet_prefix: String::new(),
            gateway: None,
            bandwidth: String::new(),
            delay: String::new(),
            rx_total: 0,
            tx_total: 0,
            rx_rate: 0,
            tx_rate: 0,
        };
        let result = engine.add_connection(conn).await;
        assert!(matches!(result, Err(CoreError::NotFound)));
    }

    #[tokio::test]
    async fn delete_connection_on_unknown_id_returns_not_found() {
        let (engine, _registry) = engine();
        let result = engine.delete_connection("missing").await;
        assert!(matches!(result, Err(CoreError::NotFound)));
    }

    fn blank_connection(container_id: &str, pid: &str, network_name: &str) -> Connection {
        Connection {
            container_id: container_id.to_string(),
            container_pid: pid.to_string(),
            network_name: network_name.to_string(),
            ovs_port_id: String::new(),
            request_ip: None,
            allocated_ip: None,
            mac: String::new(),
            subnet_prefix: String::new(),
            gateway: None,
            bandwidth: String::new(),
            delay: String::new(),
            rx_total: 0,
            tx_total: 0,
            rx_rate: 0,
            tx_rate: 0,
        }
    }

    // S5/S6 happy path: a container attaches to a network, gets an OVS
    // port, an address out of the subnet, and can have its QoS set then
    // changed.
    #[tokio::test]
    async fn add_connection_then_qos_happy_path() {
        let kv = Arc::new(MemoryStore::new());
        let netlink = Arc::new(FakeNetLink::default());
        let bridge = Arc::new(BridgeManager::new(Arc::new(FakeOvsdb::default())));
        let firewall = Arc::new(NoopFirewall::default());
        let registry = Arc::new(NetworkRegistry::new(
            kv,
            netlink.clone() as Arc<dyn NetLink>,
            bridge.clone(),
            firewall.clone() as Arc<dyn Firewall>,
        ));
        let subnet: Ipv4Net = "10.20.0.0/24".parse().unwrap();
        let network = registry
            .create_network("s5", subnet)
            .await
            .unwrap()
            .into_network();

        let table: ConnectionTable = Arc::new(RwLock::new(HashMap::new()));
        let engine = Arc::new(ConnectionEngine::new(
            registry.clone(),
            bridge,
            netlink as Arc<dyn NetLink>,
            firewall.clone() as Arc<dyn Firewall>,
            table.clone(),
        ));

        let conn = blank_connection("c-happy", "4242", "s5");
        let conn = engine.add_connection(conn).await.unwrap();

        assert_ne!(conn.ovs_port_id, ENGINE_FAILURE_SENTINEL);
        assert!(conn.ovs_port_id.starts_with("ovs"));
        assert!(!conn.mac.is_empty());
        assert_eq!(conn.gateway, Some(network.gateway));
        assert!(conn.allocated_ip.is_some());
        assert!(table.read().await.contains_key("c-happy"));

        engine
            .add_qos("c-happy", Some("500"), Some("50"))
            .await
            .unwrap();
        {
            let table = table.read().await;
            let conn = table.get("c-happy").unwrap();
            assert_eq!(conn.bandwidth, "500");
            assert_eq!(conn.delay, "50");
        }

        engine.change_qos("c-happy", Some("900"), None).await.unwrap();
        let table = table.read().await;
        let conn = table.get("c-happy").unwrap();
        assert_eq!(conn.bandwidth, "900");
        assert_eq!(conn.delay, "50");

        let calls = firewall.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.starts_with("add_qos")));
        assert!(calls.iter().any(|c| c.starts_with("change_qos")));
    }

    // A netlink failure partway through `finish_add` must not leak the IP
    // bit it already allocated: the caller's rollback branch releases it.
    #[tokio::test]
    async fn add_connection_releases_ip_when_netlink_fails_after_allocation() {
        let kv = Arc::new(MemoryStore::new());
        let netlink = Arc::new(FakeNetLink::default());
        let bridge = Arc::new(BridgeManager::new(Arc::new(FakeOvsdb::default())));
        let firewall = Arc::new(NoopFirewall::default());
        let registry = Arc::new(NetworkRegistry::new(
            kv,
            netlink.clone() as Arc<dyn NetLink>,
            bridge.clone(),
            firewall.clone() as Arc<dyn Firewall>,
        ));
        let subnet: Ipv4Net = "10.30.0.0/24".parse().unwrap();
        let network = registry
            .create_network("s-rollback", subnet)
            .await
            .unwrap()
            .into_network();

        netlink
            .fail_move_to_namespace
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let table: ConnectionTable = Arc::new(RwLock::new(HashMap::new()));
        let engine = Arc::new(ConnectionEngine::new(
            registry.clone(),
            bridge,
            netlink as Arc<dyn NetLink>,
            firewall as Arc<dyn Firewall>,
            table.clone(),
        ));

        let conn = blank_connection("c-rollback", "4343", "s-rollback");
        let conn = engine.add_connection(conn).await.unwrap();

        assert_eq!(conn.ovs_port_id, ENGINE_FAILURE_SENTINEL);
        assert!(!table.read().await.contains_key("c-rollback"));

        // The only address in this /24 (after the gateway) is handed back
        // out, proving the earlier allocation was released on rollback
        // rather than leaked.
        let reissued = registry.request_ip(network.vni, &network.subnet).await.unwrap();
        assert_eq!(reissued, "10.30.0.2".parse::<Ipv4Addr>().unwrap());
    }
}
