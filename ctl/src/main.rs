use std::collections::HashMap;

use anyhow::Context;
use clap::{error::ErrorKind, CommandFactory, Parser};
use cxynet::connection::Connection;
use cxynet::network::Network;
use prettytable::row;
use tracing::level_filters::LevelFilter;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[clap(
        long = "address",
        short = 'a',
        default_value = "127.0.0.1:8888",
        help = "agent HTTP address to talk to"
    )]
    address: String,
    #[command(subcommand)]
    command: Cmds,
}

#[derive(Debug, clap::Subcommand)]
enum Cmds {
    /// List networks known to the cluster.
    Networks,
    /// Create a network.
    NetworkCreate {
        name: String,
        #[clap(help = "CIDR, e.g. 10.1.0.0/24")]
        subnet: ipnet::Ipv4Net,
    },
    /// Delete a network.
    NetworkDelete { name: String },
    /// List active connections.
    Connections,
    /// Attach a container to a network.
    ConnectionCreate {
        container_id: String,
        container_pid: String,
        #[clap(long)]
        network: Option<String>,
    },
    /// Detach a container.
    ConnectionDelete { id: String },
    /// Install or replace rate limiting on a connection.
    Qos {
        id: String,
        #[clap(long)]
        bw: Option<String>,
        #[clap(long)]
        delay: Option<String>,
        #[clap(long, help = "replace existing qdisc rather than install")]
        change: bool,
    },
    /// Join the cluster via the given peer address.
    ClusterJoin { address: String },
    /// Leave the cluster.
    ClusterLeave,
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .finish();
    if let Err(e) = dispatch(&Cli::parse()).await {
        Cli::command()
            .error(ErrorKind::Io, format!("failed to dispatch: {:?}", e))
            .exit();
    }
}

async fn dispatch(opts: &Cli) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let base = format!("http://{}", opts.address);
    match &opts.command {
        Cmds::Networks => print_networks(&client, &base).await?,
        Cmds::NetworkCreate { name, subnet } => {
            let body = serde_json::json!({"name": name, "subnet": subnet.to_string()});
            let network: Network = client
                .post(format!("{base}/network"))
                .json(&body)
                .send()
                .await
                .context("failed to create network")?
                .error_for_status()?
                .json()
                .await?;
            println!("created {} ({})", network.name, network.subnet);
        }
        Cmds::NetworkDelete { name } => {
            client
                .delete(format!("{base}/network/{name}"))
                .send()
                .await
                .context("failed to delete network")?
                .error_for_status()?;
        }
        Cmds::Connections => print_connections(&client, &base).await?,
        Cmds::ConnectionCreate {
            container_id,
            container_pid,
            network,
        } => {
            let body = serde_json::json!({
                "containerID": container_id,
                "containerPID": container_pid,
                "network": network.clone().unwrap_or_default(),
            });
            let conn: Connection = client
                .post(format!("{base}/connection"))
                .json(&body)
                .send()
                .await
                .context("failed to create connection")?
                .error_for_status()?
                .json()
                .await?;
            println!("{} -> port {} ip {:?}", conn.container_id, conn.ovs_port_id, conn.allocated_ip);
        }
        Cmds::ConnectionDelete { id } => {
            client
                .delete(format!("{base}/connection/{id}"))
                .send()
                .await
                .context("failed to delete connection")?
                .error_for_status()?;
        }
        Cmds::Qos { id, bw, delay, change } => {
            let mut url = reqwest::Url::parse(&format!("{base}/qos/{id}"))?;
            {
                let mut query = url.query_pairs_mut();
                if let Some(bw) = bw {
                    query.append_pair("bw", bw);
                }
                if let Some(delay) = delay {
                    query.append_pair("delay", delay);
                }
            }
            let request = if *change {
                client.put(url)
            } else {
                client.post(url)
            };
            request.send().await.context("failed to set qos")?.error_for_status()?;
        }
        Cmds::ClusterJoin { address } => {
            client
                .post(format!("{base}/cluster/join"))
                .query(&[("address", address)])
                .send()
                .await
                .context("failed to join cluster")?
                .error_for_status()?;
        }
        Cmds::ClusterLeave => {
            client
                .post(format!("{base}/cluster/leave"))
                .send()
                .await
                .context("failed to leave cluster")?
                .error_for_status()?;
        }
    }
    Ok(())
}

async fn print_networks(client: &reqwest::Client, base: &str) -> anyhow::Result<()> {
    let networks: Vec<Network> = client
        .get(format!("{base}/networks"))
        .send()
        .await
        .context("failed to list networks")?
        .error_for_status()?
        .json()
        .await?;

    let mut table = prettytable::Table::new();
    table.add_row(row!["name", "subnet", "gateway", "vni"]);
    for network in networks {
        table.add_row(row![network.name, network.subnet, network.gateway, network.vni]);
    }
    table.printstd();
    Ok(())
}

async fn print_connections(client: &reqwest::Client, base: &str) -> anyhow::Result<()> {
    let connections: HashMap<String, Connection> = client
        .get(format!("{base}/connections"))
        .send()
        .await
        .context("failed to list connections")?
        .error_for_status()?
        .json()
        .await?;

    let mut table = prettytable::Table::new();
    table.add_row(row!["container", "network", "port", "ip", "rx/s", "tx/s"]);
    for (id, conn) in connections {
        table.add_row(row![
            id,
            conn.network_name,
            conn.ovs_port_id,
            conn.allocated_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            conn.rx_rate,
            conn.tx_rate
        ]);
    }
    table.printstd();
    Ok(())
}
