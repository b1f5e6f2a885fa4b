//! OVS bridge lifecycle (spec §4.4 `BridgeManager`). Thin, all state lives
//! in OVSDB; this module only shapes the calls and generates port names.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde_json::Value;

use crate::error::Result;
use crate::network::BRIDGE_NAME;
use crate::ovsdb::OvsdbClient;

pub struct BridgeManager {
    ovsdb: Arc<dyn OvsdbClient>,
}

impl BridgeManager {
    pub fn new(ovsdb: Arc<dyn OvsdbClient>) -> Self {
        BridgeManager { ovsdb }
    }

    pub async fn ensure_bridge(&self) -> Result<()> {
        self.ovsdb.ensure_bridge(BRIDGE_NAME).await
    }

    /// Adds a per-network gateway port, VLAN-tagged with its VNI.
    pub async fn add_internal_port(&self, name: &str, vni: u32, _mtu: i64) -> Result<()> {
        self.ovsdb.ensure_bridge(BRIDGE_NAME).await?;
        self.ovsdb.add_internal_port(BRIDGE_NAME, name, vni).await
    }

    /// Adds a per-container port with a freshly generated `ovs{7 hex}`
    /// name, VLAN-tagged with its network's VNI (spec §4.5 step 3).
    pub async fn add_container_port(&self, vni: u32) -> Result<String> {
        let port = generate_port_name();
        self.ovsdb.ensure_bridge(BRIDGE_NAME).await?;
        self.ovsdb.add_internal_port(BRIDGE_NAME, &port, vni).await?;
        Ok(port)
    }

    pub async fn add_vxlan_port(&self, peer_ip: &str) -> Result<String> {
        let port = format!("vxlan-{peer_ip}");
        self.ovsdb.add_vxlan_port(BRIDGE_NAME, &port, peer_ip).await?;
        Ok(port)
    }

    pub async fn delete_port(&self, name: &str) -> Result<()> {
        self.ovsdb.delete_port(name).await
    }

    /// Tears the bridge itself down (spec §4.4 `DeleteBridge`, invoked on
    /// shutdown per spec §4.8 step 7).
    pub async fn delete_bridge(&self) -> Result<()> {
        self.ovsdb.delete_bridge(BRIDGE_NAME).await
    }

    pub async fn update_port_context(&self, port: &str, key: &str, value: &str) -> Result<()> {
        self.ovsdb.update_port_context(port, key, value).await
    }

    pub async fn get_table_cache(&self, table: &str) -> Result<HashMap<String, Value>> {
        self.ovsdb.get_table_cache(table).await
    }
}

/// `ovs` + 7 lowercase hex characters, matching the format asserted by
/// spec §8 property S5 (`^ovs[0-9a-f]{7}$`).
fn generate_port_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..7)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect();
    format!("ovs{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovsdb::tests::FakeOvsdb;

    #[test]
    fn generated_port_names_match_expected_shape() {
        let re_chars = "0123456789abcdef";
        for _ in 0..50 {
            let name = generate_port_name();
            assert!(name.starts_with("ovs"));
            assert_eq!(name.len(), 10);
            assert!(name[3..].chars().all(|c| re_chars.contains(c)));
        }
    }

    #[tokio::test]
    async fn add_container_port_ensures_bridge_first() {
        let fake = Arc::new(FakeOvsdb::default());
        let manager = BridgeManager::new(fake.clone());
        let port = manager.add_container_port(7).await.unwrap();
        assert!(port.starts_with("ovs"));
        let calls = fake.calls.lock().unwrap();
        assert!(calls[0].starts_with("ensure_bridge"));
        assert!(calls[1].starts_with("add_internal_port"));
    }
}
