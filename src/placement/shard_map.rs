use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::SocketAddr;

use super::ring::{HashRing, bucket_point, file_bucket, tag_bucket};
use crate::config::PlacementConfig;
use crate::membership::table::compare_claims;
use crate::membership::types::{MembershipView, NodeId, NodeRecord, NodeState};

/// A node a request may be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: NodeId,
    pub http_addr: SocketAddr,
}

impl From<&NodeRecord> for Candidate {
    fn from(r: &NodeRecord) -> Self {
        Self {
            id: r.id.clone(),
            http_addr: r.http_addr,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TagResolution {
    pub bucket: u32,
    /// Reachable holders of the tag's shard, in ring order.
    pub candidates: Vec<Candidate>,
    /// Nodes that advertise the shard but are SUSPECT, DEAD or gone from
    /// the view before a live node took over their files.
    pub unavailable: Vec<NodeId>,
}

/// Placement derived from one membership snapshot.
///
/// Buckets are laid on a consistent-hash ring of ALIVE nodes. A bucket's
/// owners are its first `replication_factor` ring successors, except that an
/// ALIVE node claiming the bucket as primary takes the first slot.
#[derive(Debug, Clone)]
pub struct ShardMap {
    pub view_version: u64,
    pub local_id: NodeId,
    num_buckets: u32,
    replication_factor: usize,
    ring: HashRing,
    records: HashMap<NodeId, NodeRecord>,
    departed: Vec<NodeRecord>,
}

impl ShardMap {
    pub fn build(view: &MembershipView, config: &PlacementConfig) -> Self {
        let alive: Vec<&NodeId> = view.alive().map(|r| &r.id).collect();
        Self {
            view_version: view.version,
            local_id: view.local_id.clone(),
            num_buckets: config.num_buckets,
            replication_factor: config.replication_factor,
            ring: HashRing::new(alive, config.virtual_nodes),
            records: view
                .members
                .iter()
                .map(|r| (r.id.clone(), r.clone()))
                .collect(),
            departed: Vec::new(),
        }
    }

    /// Adds holders that were purged from the view while their tag buckets
    /// were still unadopted. They resolve as unavailable, never as candidates.
    pub fn with_departed(mut self, departed: Vec<NodeRecord>) -> Self {
        self.departed = departed;
        self
    }

    /// Every record of the snapshot, in no particular order.
    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.values()
    }

    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    pub fn bucket_for_file(&self, file_id: &str) -> u32 {
        file_bucket(file_id, self.num_buckets)
    }

    pub fn bucket_for_tag(&self, tag: &str) -> u32 {
        tag_bucket(tag, self.num_buckets)
    }

    pub fn record(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.records.get(id)
    }

    fn is_alive(&self, id: &NodeId) -> bool {
        self.records
            .get(id)
            .map(|r| r.state == NodeState::Alive)
            .unwrap_or(false)
    }

    /// Primary for a bucket: the winning live claim, or the ring's choice.
    pub fn primary(&self, bucket: u32) -> Option<NodeId> {
        let claimed = self
            .records
            .values()
            .filter(|r| r.state == NodeState::Alive && r.ownership.primary_claims.contains(&bucket))
            .max_by(|a, b| compare_claims((&a.id, a.ownership.epoch), (&b.id, b.ownership.epoch)))
            .map(|r| r.id.clone());

        claimed.or_else(|| {
            self.ring
                .successors(bucket_point(bucket), 1)
                .into_iter()
                .next()
        })
    }

    /// Ordered owners of a bucket, primary first. Empty only when no node is
    /// alive.
    pub fn owners(&self, bucket: u32) -> Vec<Candidate> {
        let Some(primary) = self.primary(bucket) else {
            return Vec::new();
        };

        let mut ids = vec![primary.clone()];
        for id in self
            .ring
            .successors(bucket_point(bucket), self.replication_factor + 1)
        {
            if ids.len() == self.replication_factor {
                break;
            }
            if id != primary {
                ids.push(id);
            }
        }

        ids.iter()
            .filter_map(|id| self.records.get(id))
            .map(Candidate::from)
            .collect()
    }

    pub fn is_owner(&self, bucket: u32, node: &NodeId) -> bool {
        self.owners(bucket).iter().any(|c| &c.id == node)
    }

    pub fn is_primary(&self, bucket: u32, node: &NodeId) -> bool {
        self.primary(bucket).as_ref() == Some(node)
    }

    /// Alive nodes other than `exclude` that advertise blobs for `bucket`;
    /// the sources for pulling a bucket on adoption.
    pub fn file_bucket_holders(&self, bucket: u32, exclude: Option<&NodeId>) -> Vec<Candidate> {
        self.ring_ordered(bucket)
            .into_iter()
            .filter(|r| Some(&r.id) != exclude && r.ownership.file_buckets.contains(&bucket))
            .map(Candidate::from)
            .collect()
    }

    /// Nodes that may hold entries for `tag`.
    pub fn resolve_tag(&self, tag: &str) -> TagResolution {
        let bucket = self.bucket_for_tag(tag);

        // Ring owners of the tag bucket are asked too: a holder whose summary
        // has not reached us yet is usually one of them.
        let ring_owners: Vec<NodeId> = self
            .ring
            .successors(bucket_point(bucket), self.replication_factor);
        let candidates = self
            .ring_ordered(bucket)
            .into_iter()
            .filter(|r| r.ownership.tag_buckets.contains(&bucket) || ring_owners.contains(&r.id))
            .map(Candidate::from)
            .collect();

        let mut unavailable: Vec<NodeId> = self
            .records
            .values()
            .chain(&self.departed)
            .filter(|r| r.state != NodeState::Alive && r.ownership.tag_buckets.contains(&bucket))
            .map(|r| r.id.clone())
            .collect();
        unavailable.sort();
        unavailable.dedup();

        TagResolution {
            bucket,
            candidates,
            unavailable,
        }
    }

    /// All alive records, ordered clockwise from the bucket's point.
    fn ring_ordered(&self, bucket: u32) -> Vec<&NodeRecord> {
        self.ring
            .successors(bucket_point(bucket), self.ring.node_count())
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| self.is_alive(&r.id))
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.ring.node_count()
    }

    /// Claims in `claims` the local node has lost to a live competitor.
    pub fn lost_claims(&self, node: &NodeId, epoch: u64, claims: impl IntoIterator<Item = u32>) -> Vec<u32> {
        claims
            .into_iter()
            .filter(|bucket| {
                self.records.values().any(|r| {
                    &r.id != node
                        && r.state == NodeState::Alive
                        && r.ownership.primary_claims.contains(bucket)
                        && compare_claims((&r.id, r.ownership.epoch), (node, epoch)) == Ordering::Greater
                })
            })
            .collect()
    }
}
