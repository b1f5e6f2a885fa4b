//! Daemon configuration: CLI-derived startup parameters and the
//! mutable `BridgeConf` exposed over `/configuration` (spec §6.1, §6.4).

use serde::{Deserialize, Serialize};

use crate::network::{BRIDGE_NAME, MTU};

/// Parameters the CLI surface collects before `Daemon::run` (spec §6.4).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Bind interface used to derive this node's cluster-visible address.
    pub iface: String,
    /// Whether this node participates as a KV-store coordinator.
    pub is_server: bool,
    /// Bootstrap quorum hint passed to the embedded KV-store agent.
    pub expected_server_num: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            iface: "eth0".to_string(),
            is_server: false,
            expected_server_num: 1,
        }
    }
}

/// Served by `GET /configuration` and updated by `POST /configuration`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeConf {
    #[serde(rename = "bridgeIP")]
    pub bridge_ip: String,
    #[serde(rename = "bridgeName")]
    pub bridge_name: String,
    #[serde(rename = "bridgeCIDR")]
    pub bridge_cidr: String,
    #[serde(rename = "bridgeMTU")]
    pub bridge_mtu: i64,
}

impl Default for BridgeConf {
    fn default() -> Self {
        BridgeConf {
            bridge_ip: String::new(),
            bridge_name: BRIDGE_NAME.to_string(),
            bridge_cidr: String::new(),
            bridge_mtu: MTU,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bridge_conf_uses_build_constants() {
        let conf = BridgeConf::default();
        assert_eq!(conf.bridge_name, "ovs-br0");
        assert_eq!(conf.bridge_mtu, 1440);
    }
}
