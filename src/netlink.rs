//! Host networking primitives: veth pairs, namespaces, addressing.
//!
//! Built on the `ip`-command idiom: every primitive this module needs
//! (namespace add/del, veth add with a namespace peer, address/mtu/up,
//! vxlan add) is expressed as a shelled-out `ip` invocation rather than a
//! raw netlink socket, since OVS ports are attached through OVSDB, not
//! `ip link set master`.

use std::collections::HashMap;
use std::process::{Command, Stdio};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde_json::Value;
use std::net::Ipv4Addr;

use crate::error::{CoreError, Result};

#[async_trait]
pub trait NetLink: Send + Sync {
    async fn move_to_namespace(&self, iface: &str, ns: &str) -> Result<()>;
    async fn set_mtu(&self, ns: Option<&str>, iface: &str, mtu: i64) -> Result<()>;
    async fn set_mac(&self, ns: Option<&str>, iface: &str, mac: &str) -> Result<()>;
    async fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<()>;
    async fn assign_address_in_namespace(
        &self,
        ns: &str,
        iface: &str,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<()>;
    async fn link_up(&self, iface: &str) -> Result<()>;
    async fn link_up_in_namespace(&self, ns: &str, iface: &str) -> Result<()>;
    async fn add_default_route(&self, ns: &str, gateway: Ipv4Addr) -> Result<()>;
    /// Existing IPv4 configured on a host interface, if any: used by
    /// `CreateNetwork` to reuse a preexisting interface as the gateway.
    async fn interface_ipv4_net(&self, iface: &str) -> Result<Option<(Ipv4Net, Ipv4Addr)>>;
}

fn execute(cmd: &str) -> Result<Vec<u8>> {
    tracing::debug!("running: {}", cmd);
    let mut parts = cmd.split_whitespace();
    let command = parts.next().ok_or_else(|| CoreError::OsError(cmd.to_string()))?;
    let args: Vec<_> = parts.collect();

    let child = Command::new(command)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CoreError::OsError(format!("{cmd}: {e}")))?;
    let output = child
        .wait_with_output()
        .map_err(|e| CoreError::OsError(format!("{cmd}: {e}")))?;
    if !output.status.success() {
        return Err(CoreError::OsError(format!(
            "{cmd}: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output.stdout)
}

fn ns_prefix(ns: Option<&str>) -> String {
    match ns {
        Some(name) => format!("ip netns exec {name} "),
        None => String::new(),
    }
}

#[derive(Default)]
pub struct SystemNetLink;

#[async_trait]
impl NetLink for SystemNetLink {
    async fn move_to_namespace(&self, iface: &str, ns: &str) -> Result<()> {
        execute(&format!("ip link set {iface} netns {ns}"))?;
        Ok(())
    }

    async fn set_mtu(&self, ns: Option<&str>, iface: &str, mtu: i64) -> Result<()> {
        execute(&format!(
            "{}ip link set {iface} mtu {mtu}",
            ns_prefix(ns)
        ))?;
        Ok(())
    }

    async fn set_mac(&self, ns: Option<&str>, iface: &str, mac: &str) -> Result<()> {
        execute(&format!(
            "{}ip link set {iface} address {mac}",
            ns_prefix(ns)
        ))?;
        Ok(())
    }

    async fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
        execute(&format!("ip addr add {addr}/{prefix_len} dev {iface}"))?;
        Ok(())
    }

    async fn assign_address_in_namespace(
        &self,
        ns: &str,
        iface: &str,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<()> {
        execute(&format!(
            "ip netns exec {ns} ip addr add {addr}/{prefix_len} dev {iface}"
        ))?;
        Ok(())
    }

    async fn link_up(&self, iface: &str) -> Result<()> {
        execute(&format!("ip link set {iface} up"))?;
        Ok(())
    }

    async fn link_up_in_namespace(&self, ns: &str, iface: &str) -> Result<()> {
        execute(&format!("ip netns exec {ns} ip link set {iface} up"))?;
        Ok(())
    }

    async fn add_default_route(&self, ns: &str, gateway: Ipv4Addr) -> Result<()> {
        execute(&format!(
            "ip netns exec {ns} ip route add default via {gateway}"
        ))?;
        Ok(())
    }

    async fn interface_ipv4_net(&self, iface: &str) -> Result<Option<(Ipv4Net, Ipv4Addr)>> {
        let output = match execute(&format!("ip -json addr show dev {iface}")) {
            Ok(out) => out,
            Err(_) => return Ok(None),
        };
        let parsed: Vec<HashMap<String, Value>> = serde_json::from_slice(&output)?;
        let Some(entry) = parsed.into_iter().next() else {
            return Ok(None);
        };
        let Some(addr_info) = entry.get("addr_info").and_then(|v| v.as_array()) else {
            return Ok(None);
        };
        for info in addr_info {
            if info.get("family").and_then(|v| v.as_str()) != Some("inet") {
                continue;
            }
            let Some(local) = info.get("local").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(prefix_len) = info.get("prefixlen").and_then(|v| v.as_u64()) else {
                continue;
            };
            let addr: Ipv4Addr = local.parse().map_err(|_| CoreError::OsError(local.to_string()))?;
            let net = Ipv4Net::new(addr, prefix_len as u8)
                .map_err(|e| CoreError::OsError(e.to_string()))?
                .trunc();
            return Ok(Some((net, addr)));
        }
        Ok(None)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeNetLink {
        pub calls: Mutex<Vec<String>>,
        pub existing: Mutex<Option<(Ipv4Net, Ipv4Addr)>>,
        /// Makes `move_to_namespace` fail, for exercising rollback paths.
        pub fail_move_to_namespace: std::sync::atomic::AtomicBool,
    }

    impl FakeNetLink {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl NetLink for FakeNetLink {
        async fn move_to_namespace(&self, iface: &str, ns: &str) -> Result<()> {
            self.record(format!("move_to_namespace {iface} {ns}"));
            if self
                .fail_move_to_namespace
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                return Err(CoreError::OsError("move_to_namespace failed".to_string()));
            }
            Ok(())
        }
        async fn set_mtu(&self, ns: Option<&str>, iface: &str, mtu: i64) -> Result<()> {
            self.record(format!("set_mtu {ns:?} {iface} {mtu}"));
            Ok(())
        }
        async fn set_mac(&self, ns: Option<&str>, iface: &str, mac: &str) -> Result<()> {
            self.record(format!("set_mac {ns:?} {iface} {mac}"));
            Ok(())
        }
        async fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
            self.record(format!("assign_address {iface} {addr}/{prefix_len}"));
            Ok(())
        }
        async fn assign_address_in_namespace(
            &self,
            ns: &str,
            iface: &str,
            addr: Ipv4Addr,
            prefix_len: u8,
        ) -> Result<()> {
            self.record(format!(
                "assign_address_in_namespace {ns} {iface} {addr}/{prefix_len}"
            ));
            Ok(())
        }
        async fn link_up(&self, iface: &str) -> Result<()> {
            self.record(format!("link_up {iface}"));
            Ok(())
        }
        async fn link_up_in_namespace(&self, ns: &str, iface: &str) -> Result<()> {
            self.record(format!("link_up_in_namespace {ns} {iface}"));
            Ok(())
        }
        async fn add_default_route(&self, ns: &str, gateway: Ipv4Addr) -> Result<()> {
            self.record(format!("add_default_route {ns} {gateway}"));
            Ok(())
        }
        async fn interface_ipv4_net(&self, iface: &str) -> Result<Option<(Ipv4Net, Ipv4Addr)>> {
            self.record(format!("interface_ipv4_net {iface}"));
            Ok(*self.existing.lock().unwrap())
        }
    }
}
