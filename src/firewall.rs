//! `iptables`/`tc` rule management (spec §4.5.1 QoS, original source
//! `setupIPTables`/`addQos`/`changeQos`).
//!
//! Commands run through the same build-argv/run/check-exit-status shape
//! used throughout this crate. Rule installation is made idempotent
//! (check-then-add) rather than an append-only `-A`, since a node that
//! restarts and replays `install_network_rules` must not accumulate
//! duplicate rules.

use std::process::{Command, Stdio};

use async_trait::async_trait;

use crate::error::{CoreError, Result};
use crate::network::Network;

/// Default ceiling used when no bandwidth limit is requested (original
/// source: "magic number just a large bw").
pub const UNLIMITED_BANDWIDTH_KBIT: &str = "8000000";

#[async_trait]
pub trait Firewall: Send + Sync {
    /// NAT-masquerades traffic leaving `network`'s bridge and drops
    /// forwarding into every other known network (original source
    /// `setupIPTables`).
    async fn install_network_rules(&self, network: &Network, all: &[Network]) -> Result<()>;

    /// Installs the root netem delay qdisc and a child tbf rate qdisc on
    /// `port` inside the container's namespace.
    async fn add_qos(&self, ns: &str, port: &str, rate_kbit: &str, delay_ms: &str) -> Result<()>;

    /// Replaces an existing qdisc's parameters (`tc qdisc change`).
    async fn change_qos(&self, ns: &str, port: &str, rate_kbit: &str, delay_ms: &str)
        -> Result<()>;
}

fn run(cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
    tracing::debug!("running: {} {}", cmd, args.join(" "));
    let output = Command::new(cmd)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| CoreError::OsError(format!("{cmd} not found: {e}")))?;
    if !output.status.success() {
        return Err(CoreError::OsError(format!(
            "{cmd} {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output.stdout)
}

fn rule_exists(args: &[&str]) -> bool {
    let mut check_args: Vec<&str> = vec!["-C"];
    check_args.extend(&args[1..]);
    Command::new("iptables")
        .args(&check_args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn install_rule(args: &[&str]) -> Result<()> {
    if rule_exists(args) {
        return Ok(());
    }
    run("iptables", args)?;
    Ok(())
}

/// Checks `tc qdisc show` for a qdisc already installed at `handle`
/// (e.g. `"1:"` or `"10:"`, as `tc` prints a zero minor with a bare colon).
fn qdisc_exists(ns: &str, port: &str, handle: &str) -> bool {
    Command::new("ip")
        .args(["netns", "exec", ns, "tc", "qdisc", "show", "dev", port])
        .output()
        .map(|output| {
            output.status.success()
                && String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .any(|line| line.contains(&format!(" {handle} ")))
        })
        .unwrap_or(false)
}

#[derive(Default)]
pub struct SystemFirewall;

#[async_trait]
impl Firewall for SystemFirewall {
    async fn install_network_rules(&self, network: &Network, all: &[Network]) -> Result<()> {
        let subnet = network.subnet.to_string();
        install_rule(&[
            "-A",
            "POSTROUTING",
            "-t",
            "nat",
            "-s",
            &subnet,
            "!",
            "-o",
            &network.name,
            "-j",
            "MASQUERADE",
        ])?;

        for other in all {
            if other.name == network.name {
                continue;
            }
            install_rule(&[
                "-A",
                "FORWARD",
                "-i",
                &network.name,
                "-o",
                &other.name,
                "-j",
                "DROP",
            ])?;
        }
        Ok(())
    }

    async fn add_qos(&self, ns: &str, port: &str, rate_kbit: &str, delay_ms: &str) -> Result<()> {
        if !qdisc_exists(ns, port, "1:") {
            run(
                "ip",
                &[
                    "netns", "exec", ns, "tc", "qdisc", "add", "dev", port, "root", "handle",
                    "1:0", "netem", "delay", &format!("{delay_ms}ms"),
                ],
            )?;
        }
        if !qdisc_exists(ns, port, "10:") {
            run(
                "ip",
                &[
                    "netns", "exec", ns, "tc", "qdisc", "add", "dev", port, "parent", "1:1",
                    "handle", "10:", "tbf", "rate", &format!("{rate_kbit}kbit"), "buffer", "1600",
                    "limit", "3000",
                ],
            )?;
        }
        Ok(())
    }

    async fn change_qos(
        &self,
        ns: &str,
        port: &str,
        rate_kbit: &str,
        delay_ms: &str,
    ) -> Result<()> {
        run(
            "ip",
            &[
                "netns", "exec", ns, "tc", "qdisc", "change", "dev", port, "root", "handle",
                "1:0", "netem", "delay", &format!("{delay_ms}ms"),
            ],
        )?;
        run(
            "ip",
            &[
                "netns", "exec", ns, "tc", "qdisc", "change", "dev", port, "parent", "1:1",
                "handle", "10:", "tbf", "rate", &format!("{rate_kbit}kbit"), "buffer", "1600",
                "limit", "3000",
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct NoopFirewall {
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Firewall for NoopFirewall {
        async fn install_network_rules(&self, network: &Network, all: &[Network]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("install_network_rules {} ({})", network.name, all.len()));
            Ok(())
        }

        async fn add_qos(&self, ns: &str, port: &str, rate: &str, delay: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("add_qos {ns} {port} {rate} {delay}"));
            Ok(())
        }

        async fn change_qos(&self, ns: &str, port: &str, rate: &str, delay: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("change_qos {ns} {port} {rate} {delay}"));
            Ok(())
        }
    }
}
