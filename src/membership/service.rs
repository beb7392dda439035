use anyhow::Result;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::events::MembershipEvents;
use super::table::{MembershipTable, Timing};
use super::types::{
    Ack, GossipMessage, MembershipEvent, MembershipView, NodeId, NodeRecord, NodeState,
    ShardOwnership,
};
use crate::config::MembershipConfig;

/// Cap on relayed records per message, keeps datagrams well under 64 KiB.
const MAX_DIGEST: usize = 16;
const EVENT_BUFFER: usize = 256;

pub struct MembershipService {
    pub local_id: NodeId,
    config: MembershipConfig,
    table: Mutex<MembershipTable>,
    socket: Arc<UdpSocket>,
    seeds: Vec<SocketAddr>,
    view_tx: watch::Sender<Arc<MembershipView>>,
    events_tx: broadcast::Sender<MembershipEvent>,
    cancel: CancellationToken,
}

impl MembershipService {
    /// Binds the gossip socket and announces the node to its seeds.
    ///
    /// `incarnation` should be larger than any incarnation this node id used
    /// before, so that a restart revives a record peers marked DEAD.
    pub async fn new(
        local_id: NodeId,
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
        incarnation: u64,
        config: MembershipConfig,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let gossip_addr = socket.local_addr()?;

        let local = NodeRecord::new(local_id.clone(), gossip_addr, http_addr, incarnation);
        let table = MembershipTable::new(local.clone(), Timing::from(&config));
        let (view_tx, _) = watch::channel(Arc::new(table.view()));
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            let encoded = bincode::serialize(&GossipMessage::Join { record: local })?;
            for seed_node in seed_nodes.iter().filter(|s| **s != gossip_addr) {
                if let Err(e) = socket.send_to(&encoded, seed_node).await {
                    tracing::warn!("Failed to send join request to {}: {}", seed_node, e);
                } else {
                    info!("Sent join request to {}", seed_node);
                }
            }
        }

        Ok(Arc::new(Self {
            local_id,
            config,
            table: Mutex::new(table),
            socket: Arc::new(socket),
            seeds: seed_nodes,
            view_tx,
            events_tx,
            cancel: CancellationToken::new(),
        }))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            });
        }

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            });
        }

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            });
        }

        tracing::info!("All membership background tasks started");
    }

    /// Announces departure and stops the background loops.
    pub async fn shutdown(&self) {
        let msg = {
            let table = self.table.lock();
            GossipMessage::Leave {
                node_id: self.local_id.clone(),
                incarnation: table.local().incarnation,
            }
        };
        self.broadcast_message(msg).await;
        self.cancel.cancel();
    }

    // --- Public contract ---

    /// Applies a heartbeat received from a peer and returns our acknowledgement.
    pub fn heartbeat(&self, record: NodeRecord, members: Vec<NodeRecord>) -> Ack {
        let now = Instant::now();
        let (events, ack) = {
            let mut table = self.table.lock();
            let mut events = table.merge(record, now);
            for member in members {
                events.extend(table.merge(member, now));
            }
            let ack = Ack {
                record: table.local().clone(),
                members: sample_digest(table.digest()),
            };
            (events, ack)
        };
        self.publish(events);
        ack
    }

    pub fn get_view(&self) -> Arc<MembershipView> {
        self.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> MembershipEvents {
        MembershipEvents::new(self.events_tx.subscribe(), self.view_tx.subscribe())
    }

    pub fn watch_view(&self) -> watch::Receiver<Arc<MembershipView>> {
        self.view_tx.subscribe()
    }

    /// Replaces what this node declares it owns. The change reaches peers
    /// with the next heartbeat.
    pub fn update_ownership(&self, ownership: ShardOwnership) -> Option<u64> {
        let event = {
            let mut table = self.table.lock();
            table.set_local_ownership(ownership)
        };
        let epoch = match &event {
            Some(MembershipEvent::OwnershipChanged { epoch, .. }) => Some(*epoch),
            _ => None,
        };
        self.publish(event.into_iter().collect());
        epoch
    }

    pub fn local_record(&self) -> NodeRecord {
        self.table.lock().local().clone()
    }

    pub fn get_member(&self, id: &NodeId) -> Option<NodeRecord> {
        self.table.lock().get(id).cloned()
    }

    pub fn get_alive_members(&self) -> Vec<NodeRecord> {
        self.get_view().alive().cloned().collect()
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        self.local_record().gossip_addr
    }

    // --- Internals ---

    /// Publishes a fresh snapshot and fans events out to subscribers.
    fn publish(&self, events: Vec<MembershipEvent>) {
        let view = Arc::new(self.table.lock().view());
        if view.version != self.view_tx.borrow().version {
            self.view_tx.send_replace(view);
        }
        for event in events {
            // No subscribers is fine.
            let _ = self.events_tx.send(event);
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let (msg, targets) = {
                let mut table = self.table.lock();
                let record = table.bump_heartbeat(now_ms());
                let members = sample_digest(table.digest());
                let mut peers = table.gossip_targets();
                peers.shuffle(&mut rand::thread_rng());
                let mut targets: Vec<SocketAddr> = if peers.is_empty() {
                    self.seeds.clone()
                } else {
                    peers
                        .into_iter()
                        .take(self.config.fanout.max(1))
                        .map(|p| p.gossip_addr)
                        .collect()
                };
                if let Some(dead) = table.revival_target() {
                    tracing::debug!("Gossiping to dead member {} at {}", dead.id, dead.gossip_addr);
                    targets.push(dead.gossip_addr);
                }
                (GossipMessage::Heartbeat { record, members }, targets)
            };
            self.publish(Vec::new());

            let encoded = match bincode::serialize(&msg) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::error!("Failed to serialize heartbeat: {}", e);
                    continue;
                }
            };

            let own = self.gossip_addr();
            for target in targets.into_iter().filter(|t| *t != own) {
                if let Err(e) = self.socket.send_to(&encoded, target).await {
                    tracing::warn!("Failed to send heartbeat to {}: {}", target, e);
                } else {
                    tracing::trace!("Sent heartbeat to {}", target);
                }
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => r,
            };

            match received {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Heartbeat { record, members } => {
                tracing::trace!("Received heartbeat from {}", record.id);
                let ack = self.heartbeat(record, members);
                self.send_to(&GossipMessage::Ack(ack), src).await?;
            }

            GossipMessage::Ack(ack) => {
                tracing::trace!("Received ack from {} with {} members", ack.record.id, ack.members.len());
                self.heartbeat(ack.record, ack.members);
            }

            GossipMessage::Join { record } => {
                tracing::info!("Node {} joining cluster at {}", record.id, record.gossip_addr);
                let ack = self.heartbeat(record, Vec::new());
                self.send_to(&GossipMessage::Ack(ack), src).await?;
            }

            GossipMessage::Suspect { node_id, incarnation } => {
                let refute = {
                    let mut table = self.table.lock();
                    table.apply_suspect(&node_id, incarnation);
                    table.take_refute()
                };
                self.publish(Vec::new());
                if let Some(incarnation) = refute {
                    self.broadcast_message(GossipMessage::Alive {
                        node_id: self.local_id.clone(),
                        incarnation,
                    })
                    .await;
                }
            }

            GossipMessage::Alive { node_id, incarnation } => {
                let events = self
                    .table
                    .lock()
                    .apply_alive(&node_id, incarnation, Instant::now());
                self.publish(events);
            }

            GossipMessage::Leave { node_id, incarnation } => {
                let events = self
                    .table
                    .lock()
                    .apply_leave(&node_id, incarnation, Instant::now());
                self.publish(events);
            }
        }

        let refute = self.table.lock().take_refute();
        if let Some(incarnation) = refute {
            self.broadcast_message(GossipMessage::Alive {
                node_id: self.local_id.clone(),
                incarnation,
            })
            .await;
        }

        Ok(())
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let events = self.table.lock().tick(Instant::now());
            if events.is_empty() {
                continue;
            }

            let mut rumours = Vec::new();
            for event in &events {
                if let MembershipEvent::Suspected(id) = event
                    && let Some(member) = self.get_member(id)
                {
                    rumours.push(member);
                }
                if let MembershipEvent::Died(_) = event {
                    tracing::info!(
                        "Cluster size now: {} alive nodes",
                        self.get_alive_members().len()
                    );
                }
            }
            self.publish(events);

            for suspect in rumours {
                let msg = GossipMessage::Suspect {
                    node_id: suspect.id.clone(),
                    incarnation: suspect.incarnation,
                };
                // The suspect itself gets a copy so it can refute.
                if let Err(e) = self.send_to(&msg, suspect.gossip_addr).await {
                    tracing::debug!("Failed to notify suspect {}: {}", suspect.id, e);
                }
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn send_to(&self, msg: &GossipMessage, target: SocketAddr) -> Result<()> {
        let encoded = bincode::serialize(msg)?;
        self.socket.send_to(&encoded, target).await?;
        Ok(())
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let Ok(encoded) = bincode::serialize(&msg) else {
            tracing::error!("Failed to serialize broadcast message");
            return;
        };

        let targets: Vec<NodeRecord> = self.table.lock().gossip_targets();
        for member in targets {
            if member.state == NodeState::Alive
                && let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await
            {
                tracing::warn!("Failed to broadcast to {}: {}", member.id, e);
            }
        }
    }
}

fn sample_digest(mut records: Vec<NodeRecord>) -> Vec<NodeRecord> {
    if records.len() > MAX_DIGEST {
        records.shuffle(&mut rand::thread_rng());
        records.truncate(MAX_DIGEST);
    }
    records
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
