//! Node assembly.
//!
//! Wires membership, placement, storage, router and gateway into one running
//! process and owns the background tasks they need.

use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::gateway::{self, Gateway};
use crate::membership::service::{MembershipService, now_ms};
use crate::membership::types::NodeId;
use crate::placement::Placement;
use crate::router::QueryRouter;
use crate::rpc::{ClusterClient, HttpNodeClient, NodeClient};
use crate::storage::handlers::internal_routes;
use crate::storage::node::StorageNode;

/// Holds the node id across restarts.
const NODE_ID_FILE: &str = "node.id";
const STATS_INTERVAL: Duration = Duration::from_secs(30);

pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    membership: Arc<MembershipService>,
    storage: Arc<StorageNode>,
    router: Arc<QueryRouter>,
    app: Router,
    cancel: CancellationToken,
    server: JoinHandle<()>,
}

impl Node {
    /// Starts every subsystem and begins serving HTTP.
    ///
    /// Ports may be 0; the bound addresses are in [`Node::gossip_addr`] and
    /// [`Node::http_addr`], and the HTTP address is what peers learn through
    /// gossip.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
        let id = load_or_create_id(&config.data_dir).await?;

        // 1. HTTP listener first, so gossip carries the real address:
        let listener = TcpListener::bind(config.http_addr())
            .await
            .with_context(|| format!("binding HTTP on {}", config.http_addr()))?;
        let http_addr = listener.local_addr()?;

        // 2. Membership (UDP gossip):
        let membership = MembershipService::new(
            id.clone(),
            config.bind,
            http_addr,
            config.seeds.clone(),
            now_ms(),
            config.membership.clone(),
        )
        .await?;
        let gossip_addr = membership.gossip_addr();

        // 3. Placement, storage and routing:
        let placement = Placement::new(membership.watch_view(), config.placement.clone());
        let remote: Arc<dyn NodeClient> = Arc::new(HttpNodeClient::new(&config.router));
        let storage = StorageNode::open(
            &config.data_dir,
            membership.clone(),
            placement.clone(),
            remote.clone(),
        )
        .await?;
        let client: Arc<dyn NodeClient> = Arc::new(ClusterClient::new(storage.clone(), remote));
        let router = Arc::new(QueryRouter::new(placement.clone(), client, config.router.clone()));

        // 4. HTTP surface:
        let cancel = CancellationToken::new();
        let gateway = Gateway::new(router.clone(), membership.clone(), storage.clone(), cancel.clone());
        let app = gateway::handlers::routes(gateway).merge(internal_routes(storage.clone()));

        // 5. Background tasks:
        membership.clone().start().await;
        tokio::spawn(placement.clone().run(membership.subscribe(), cancel.clone()));
        tokio::spawn(
            storage
                .clone()
                .run_maintenance(config.membership.heartbeat_interval(), cancel.clone()),
        );
        tokio::spawn(report_stats(membership.clone(), storage.clone(), cancel.clone()));

        let server = {
            let app = app.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let shutdown = async move { cancel.cancelled().await };
                if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                    tracing::error!("HTTP server failed: {}", e);
                }
            })
        };

        tracing::info!("Node {} up: gossip={} http={}", id, gossip_addr, http_addr);

        Ok(Self {
            id,
            gossip_addr,
            http_addr,
            membership,
            storage,
            router,
            app,
            cancel,
            server,
        })
    }

    /// The full HTTP application: client API plus `/internal` routes.
    pub fn app(&self) -> Router {
        self.app.clone()
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    pub fn storage(&self) -> &Arc<StorageNode> {
        &self.storage
    }

    pub fn router(&self) -> &Arc<QueryRouter> {
        &self.router
    }

    /// Leaves the cluster, stops background tasks and drains the HTTP server.
    pub async fn shutdown(self) {
        self.membership.shutdown().await;
        self.cancel.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!("HTTP server task ended abnormally: {}", e);
        }
        tracing::info!("Node {} stopped", self.id);
    }
}

async fn load_or_create_id(data_dir: &Path) -> Result<NodeId> {
    let path = data_dir.join(NODE_ID_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) if !raw.trim().is_empty() => Ok(NodeId(raw.trim().to_string())),
        Ok(_) => write_new_id(&path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => write_new_id(&path).await,
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

async fn write_new_id(path: &Path) -> Result<NodeId> {
    let id = NodeId::new();
    tokio::fs::write(path, &id.0)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(id)
}

async fn report_stats(membership: Arc<MembershipService>, storage: Arc<StorageNode>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let alive = membership.get_alive_members();
        tracing::info!(
            "Cluster stats: {} alive node(s), {} local file(s)",
            alive.len(),
            storage.file_count()
        );
        for node in alive {
            tracing::debug!(
                "  - {} gossip={} http={} (inc={}, epoch={})",
                node.id,
                node.gossip_addr,
                node.http_addr,
                node.incarnation,
                node.ownership.epoch
            );
        }
    }
}
