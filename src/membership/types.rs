use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// What a node declares it serves.
///
/// `epoch` increases on every change so peers can tell a newer declaration
/// from a stale one relayed through gossip.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardOwnership {
    pub epoch: u64,
    /// Buckets this node has adopted as primary after a rebalance.
    pub primary_claims: BTreeSet<u32>,
    /// File-id buckets for which this node holds blobs.
    pub file_buckets: BTreeSet<u32>,
    /// Tag buckets for which this node holds tag entries.
    pub tag_buckets: BTreeSet<u32>,
}

/// A single member in the cluster as seen by the local node.
///
/// `incarnation` is the membership epoch: a node bumps it to refute a
/// suspicion, and a restarted node comes back with a higher one, which is
/// the only way to revive a DEAD record. `heartbeat_seq` is bumped by the
/// owner on every gossip round and lets liveness travel through third
/// parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,
    pub heartbeat_seq: u64,
    /// Origin wall-clock time of the last heartbeat, informational only.
    pub timestamp_ms: u64,
    pub ownership: ShardOwnership,

    #[serde(skip)]
    pub last_heard: Option<Instant>,
    #[serde(skip)]
    pub state_changed: Option<Instant>,
}

impl NodeRecord {
    pub fn new(id: NodeId, gossip_addr: SocketAddr, http_addr: SocketAddr, incarnation: u64) -> Self {
        Self {
            id,
            gossip_addr,
            http_addr,
            state: NodeState::Alive,
            incarnation,
            heartbeat_seq: 0,
            timestamp_ms: 0,
            ownership: ShardOwnership::default(),
            last_heard: Some(Instant::now()),
            state_changed: Some(Instant::now()),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == NodeState::Alive
    }
}

/// Reply to a heartbeat: the responder's own record plus a digest of what it
/// knows about the rest of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub record: NodeRecord,
    pub members: Vec<NodeRecord>,
}

/// The UDP wire protocol between membership services.
///
/// - `Heartbeat/Ack`: periodic liveness plus state synchronization.
/// - `Join`: sent by a starting node to its seeds.
/// - `Suspect/Alive`: suspicion rumours and their refutation.
/// - `Leave`: graceful shutdown, peers mark the sender DEAD at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Heartbeat {
        record: NodeRecord,
        members: Vec<NodeRecord>,
    },

    Ack(Ack),

    Join {
        record: NodeRecord,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },

    Leave {
        node_id: NodeId,
        incarnation: u64,
    },
}

/// Immutable snapshot of the membership table.
#[derive(Debug, Clone)]
pub struct MembershipView {
    pub local_id: NodeId,
    /// Increases on every change to the table.
    pub version: u64,
    /// All known records including the local one, sorted by id.
    pub members: Vec<NodeRecord>,
}

impl MembershipView {
    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.members.iter().find(|m| &m.id == id)
    }

    pub fn alive(&self) -> impl Iterator<Item = &NodeRecord> {
        self.members.iter().filter(|m| m.state == NodeState::Alive)
    }

    pub fn state_of(&self, id: &NodeId) -> Option<NodeState> {
        self.get(id).map(|m| m.state)
    }
}

#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Joined(NodeRecord),
    Suspected(NodeId),
    Recovered(NodeId),
    Died(NodeId),
    Purged(NodeId),
    OwnershipChanged { node: NodeId, epoch: u64 },
    /// Emitted to a subscriber that fell behind; carries the current view so
    /// it can rebuild whatever it derives from membership.
    Resync(Arc<MembershipView>),
}

impl MembershipEvent {
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            MembershipEvent::Joined(record) => Some(&record.id),
            MembershipEvent::Suspected(id)
            | MembershipEvent::Recovered(id)
            | MembershipEvent::Died(id)
            | MembershipEvent::Purged(id) => Some(id),
            MembershipEvent::OwnershipChanged { node, .. } => Some(node),
            MembershipEvent::Resync(_) => None,
        }
    }
}
