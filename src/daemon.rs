//! Composes the core components and drives the startup sequence (spec
//! §4.8/§4.9). Process glue — signal handling, the HTTP front door — is
//! deliberately left to the binary crates; this module only owns the
//! channels and background tasks that make up "the core".

use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio::sync::{mpsc, oneshot, watch, RwLock};

use crate::bridge::BridgeManager;
use crate::config::{BridgeConf, DaemonConfig};
use crate::connection::{ConnectionCtx, ConnectionEngine, ConnectionTable};
use crate::error::Result;
use crate::firewall::Firewall;
use crate::kv::KvStore;
use crate::netlink::NetLink;
use crate::network::DEFAULT_NETWORK;
use crate::peer::PeerManager;
use crate::registry::NetworkRegistry;
use crate::syncer::NetworkSyncer;

/// Default subnet for the network created automatically on the bootstrap
/// node (original source `CreateDefaultNetwork`, adapted to this spec's
/// default network name).
const DEFAULT_SUBNET: &str = "10.0.42.0/24";

const CONNECTION_CHANNEL_CAPACITY: usize = 64;
const CLUSTER_CHANNEL_CAPACITY: usize = 16;

pub enum NodeAction {
    Join(String),
    Leave,
}

pub struct NodeCtx {
    pub action: NodeAction,
    pub reply: oneshot::Sender<Result<()>>,
}

pub struct Daemon {
    pub config: DaemonConfig,
    pub kv: Arc<dyn KvStore>,
    pub registry: Arc<NetworkRegistry>,
    pub bridge: Arc<BridgeManager>,
    pub connection_engine: Arc<ConnectionEngine>,
    pub connection_tx: mpsc::Sender<ConnectionCtx>,
    pub cluster_tx: mpsc::Sender<NodeCtx>,
    pub bridge_conf: Arc<RwLock<BridgeConf>>,
    pub ready: watch::Receiver<bool>,
    connection_rx: RwLock<Option<mpsc::Receiver<ConnectionCtx>>>,
    cluster_rx: RwLock<Option<mpsc::Receiver<NodeCtx>>>,
    ready_tx: watch::Sender<bool>,
    local_addr: String,
    syncer: Arc<NetworkSyncer>,
    peer_manager: Arc<PeerManager>,
}

impl Daemon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DaemonConfig,
        kv: Arc<dyn KvStore>,
        netlink: Arc<dyn NetLink>,
        bridge: Arc<BridgeManager>,
        firewall: Arc<dyn Firewall>,
        local_addr: String,
    ) -> Self {
        let registry = Arc::new(NetworkRegistry::new(
            kv.clone(),
            netlink.clone(),
            bridge.clone(),
            firewall.clone(),
        ));
        let table: ConnectionTable = Arc::new(RwLock::new(std::collections::HashMap::new()));
        let connection_engine = Arc::new(ConnectionEngine::new(
            registry.clone(),
            bridge.clone(),
            netlink.clone(),
            firewall.clone(),
            table,
        ));
        let syncer = Arc::new(NetworkSyncer::new(
            registry.clone(),
            bridge.clone(),
            netlink,
            firewall,
        ));
        let peer_manager = Arc::new(PeerManager::new(bridge.clone(), local_addr.clone()));

        let (connection_tx, connection_rx) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);
        let (cluster_tx, cluster_rx) = mpsc::channel(CLUSTER_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = watch::channel(false);

        Daemon {
            config,
            kv,
            registry,
            bridge,
            connection_engine,
            connection_tx,
            cluster_tx,
            bridge_conf: Arc::new(RwLock::new(BridgeConf::default())),
            ready: ready_rx,
            connection_rx: RwLock::new(Some(connection_rx)),
            cluster_rx: RwLock::new(Some(cluster_rx)),
            ready_tx,
            local_addr,
            syncer,
            peer_manager,
        }
    }

    pub fn connection_table(&self) -> ConnectionTable {
        self.connection_engine.table()
    }

    /// Runs every background task named in the startup sequence except
    /// API-gateway and signal-handler wiring, which the binary owns.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tokio::fs::create_dir_all("/var/run/netns")
            .await
            .map_err(|e| crate::error::CoreError::OsError(e.to_string()))?;

        self.kv.register_node(&self.local_addr).await?;
        let node_events = self.kv.watch_nodes().await?;

        tokio::spawn(self.clone().ready_signal_task(self.kv.watch_nodes().await?));
        tokio::spawn(self.peer_manager.clone().run(node_events));

        let cluster_rx = self
            .cluster_rx
            .write()
            .await
            .take()
            .expect("Daemon::run must only be called once");
        tokio::spawn(self.clone().node_handler(cluster_rx));

        tokio::spawn(self.clone().startup_background_task());

        let connection_rx = self
            .connection_rx
            .write()
            .await
            .take()
            .expect("Daemon::run must only be called once");
        tokio::spawn(self.connection_engine.clone().run(connection_rx));

        Ok(())
    }

    async fn ready_signal_task(self: Arc<Self>, mut events: tokio::sync::broadcast::Receiver<crate::kv::NodeEvent>) {
        if self.config.is_server {
            let _ = self.ready_tx.send(true);
            return;
        }
        if events.recv().await.is_ok() {
            let _ = self.ready_tx.send(true);
        }
    }

    async fn startup_background_task(self: Arc<Self>) {
        if let Err(err) = self.bridge.ensure_bridge().await {
            tracing::error!("failed to ensure bridge: {err}");
        }

        let mut ready = self.ready.clone();
        let _ = ready.wait_for(|r| *r).await;
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        if self.config.is_server {
            if let Err(err) = self.create_default_network().await {
                tracing::error!("failed to create default network: {err}");
            }
        }

        self.syncer.clone().run().await;
    }

    async fn create_default_network(&self) -> Result<()> {
        let subnet: Ipv4Net = DEFAULT_SUBNET
            .parse()
            .expect("DEFAULT_SUBNET is a valid CIDR literal");
        self.registry.create_network(DEFAULT_NETWORK, subnet).await?;
        Ok(())
    }

    /// Consumes `clusterChan`: `Join`/`Leave` requests submitted by the API
    /// (spec §4.9). Errors are logged, never propagated.
    async fn node_handler(self: Arc<Self>, mut rx: mpsc::Receiver<NodeCtx>) {
        while let Some(ctx) = rx.recv().await {
            let result = match &ctx.action {
                NodeAction::Join(addr) => self.kv.register_node(addr).await,
                NodeAction::Leave => self.kv.deregister_node(&self.local_addr).await,
            };
            if let Err(err) = &result {
                tracing::warn!("node handler action failed: {err}");
            }
            let _ = ctx.reply.send(result);
        }
    }
}
