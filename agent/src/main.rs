mod api;

use std::sync::Arc;

use clap::{error::ErrorKind, CommandFactory, Parser};
use tracing::level_filters::LevelFilter;

use cxynet::bridge::BridgeManager;
use cxynet::config::DaemonConfig;
use cxynet::daemon::Daemon;
use cxynet::firewall::{Firewall, SystemFirewall};
use cxynet::kv::etcd::EtcdStore;
use cxynet::kv::memory::MemoryStore;
use cxynet::kv::KvStore;
use cxynet::netlink::{NetLink, SystemNetLink};
use cxynet::ovsdb::UnixSocketOvsdb;

const OVSDB_SOCKET: &str = "/var/run/openvswitch/db.sock";
const ETCD_ENDPOINT: &str = "127.0.0.1:2379";

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[clap(long = "iface", short = 'i', default_value = "eth0", help = "bind interface")]
    iface: String,

    #[clap(long = "server", short = 's', help = "participate as a KV-store coordinator")]
    server: bool,

    #[clap(
        long = "expectedServerNum",
        short = 'n',
        default_value = "1",
        help = "bootstrap quorum hint"
    )]
    expected_server_num: usize,

    #[clap(
        long = "listen",
        short = 'l',
        default_value = "127.0.0.1:8888",
        help = "HTTP API bind address"
    )]
    listen: String,
}

#[tokio::main]
async fn main() {
    if let Err(e) = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .finish(),
    ) {
        Cli::command()
            .error(
                ErrorKind::Io,
                format!("failed to set global default subscriber: {:?}", e),
            )
            .exit();
    }

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => tracing::info!("agent stopped"),
        Err(e) => {
            Cli::command()
                .error(ErrorKind::Io, format!("agent exited with error: {:?}", e))
                .exit();
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let listen = cli.listen;
    let config = DaemonConfig {
        iface: cli.iface,
        is_server: cli.server,
        expected_server_num: cli.expected_server_num,
    };

    let netlink: Arc<dyn NetLink> = Arc::new(SystemNetLink);
    let local_addr = match netlink.interface_ipv4_net(&config.iface).await? {
        Some((_, addr)) => addr.to_string(),
        None => {
            tracing::warn!(
                "no IPv4 address found on {}, falling back to loopback",
                config.iface
            );
            "127.0.0.1".to_string()
        }
    };

    let kv: Arc<dyn KvStore> = if config.expected_server_num <= 1 {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(EtcdStore::connect(&[ETCD_ENDPOINT.to_string()]).await?)
    };

    let ovsdb = Arc::new(UnixSocketOvsdb::connect(OVSDB_SOCKET).await?);
    let bridge = Arc::new(BridgeManager::new(ovsdb));
    let firewall: Arc<dyn Firewall> = Arc::new(SystemFirewall);

    let daemon = Arc::new(Daemon::new(
        config,
        kv,
        netlink,
        bridge.clone(),
        firewall,
        local_addr,
    ));
    daemon.clone().run().await?;

    let app = api::router(daemon);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!("listening on: {}", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let shutdown_tx = std::sync::Mutex::new(Some(shutdown_tx));
    ctrlc::set_handler(move || {
        if let Some(tx) = shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    })?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await?;

    if let Err(err) = bridge.delete_bridge().await {
        tracing::warn!("failed to delete bridge on shutdown: {err}");
    }
    Ok(())
}
