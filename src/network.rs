//! Data model shared by the registry, connection engine and HTTP API
//! (spec §3 `Network`, `VNIBitmap`, `IPBitmap`).

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Build constant, must be >= 4096 (spec §4.3 step 2).
pub const VLAN_COUNT: u32 = 4096;

/// MTU assigned to every internal/veth port the core creates.
pub const MTU: i64 = 1440;

/// Single OVS bridge name every node manages.
pub const BRIDGE_NAME: &str = "ovs-br0";

/// Network created automatically when `network` is omitted on a connection
/// request (spec §4.5 step 1).
pub const DEFAULT_NETWORK: &str = "cxy";

pub const NETWORK_STORE: &str = "networkStore";
pub const VLAN_STORE: &str = "vlanStore";
pub const IP_STORE: &str = "ipStore";

/// A logical L2 segment mapped to a VXLAN VNI and a CIDR (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub vni: u32,
}

/// Number of bytes needed to hold one bit per VNI.
pub fn vlan_bitmap_len() -> usize {
    (VLAN_COUNT / 8) as usize
}

/// Number of host addresses in `subnet`, i.e. `2^(32 - prefix_len)`.
pub fn host_count(subnet: &Ipv4Net) -> u64 {
    1u64 << (32 - subnet.prefix_len() as u32)
}

/// Number of bytes needed to hold one bit per host address in `subnet`.
pub fn ip_bitmap_len(subnet: &Ipv4Net) -> usize {
    ((host_count(subnet) + 7) / 8) as usize
}

/// Key under `ipStore` for the per-(VNI, subnet) bitmap (spec §6.2).
pub fn ip_store_key(vni: u32, subnet: &Ipv4Net) -> String {
    format!("{vni}-{subnet}")
}

/// `/NN` CIDR suffix, e.g. `/24` (spec §3 `Connection.subnetPrefix`).
pub fn prefix_suffix(subnet: &Ipv4Net) -> String {
    format!("/{}", subnet.prefix_len())
}

/// Deterministic MAC for an allocated IPv4 address: `02:42:` + the 4 octets
/// (spec §3 invariant, original source `generateMacAddr`).
pub fn mac_for_ip(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!(
        "02:42:{:02x}:{:02x}:{:02x}:{:02x}",
        o[0], o[1], o[2], o[3]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_bijective_and_prefixed() {
        let mut seen = std::collections::HashSet::new();
        for b in [0u8, 1, 42, 255] {
            let ip = Ipv4Addr::new(10, 0, b, 7);
            let mac = mac_for_ip(ip);
            assert!(mac.starts_with("02:42"));
            assert!(seen.insert(mac));
        }
    }

    #[test]
    fn ip_bitmap_len_matches_host_count() {
        let subnet: Ipv4Net = "10.0.42.0/24".parse().unwrap();
        assert_eq!(host_count(&subnet), 256);
        assert_eq!(ip_bitmap_len(&subnet), 32);
    }
}
