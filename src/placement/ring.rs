//! Consistent-hash ring with virtual nodes.
//!
//! Keys and node points share one SHA-256-derived 64-bit space. Adding or
//! removing a node only moves the keys between that node's points and their
//! predecessors.

use sha2::{Digest, Sha256};

use crate::membership::types::NodeId;

pub fn hash64(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

pub fn bucket_of(key: &str, num_buckets: u32) -> u32 {
    (hash64(key) % num_buckets as u64) as u32
}

pub fn file_bucket(file_id: &str, num_buckets: u32) -> u32 {
    bucket_of(&format!("file:{}", file_id), num_buckets)
}

pub fn tag_bucket(tag: &str, num_buckets: u32) -> u32 {
    bucket_of(&format!("tag:{}", tag), num_buckets)
}

/// Ring position a bucket is looked up from.
pub fn bucket_point(bucket: u32) -> u64 {
    hash64(&format!("bucket#{}", bucket))
}

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: Vec<(u64, NodeId)>,
    node_count: usize,
}

impl HashRing {
    pub fn new<'a>(nodes: impl IntoIterator<Item = &'a NodeId>, virtual_nodes: usize) -> Self {
        let mut points = Vec::new();
        let mut node_count = 0;
        for node in nodes {
            node_count += 1;
            for v in 0..virtual_nodes.max(1) {
                points.push((hash64(&format!("{}#{}", node.0, v)), node.clone()));
            }
        }
        // Ties on the point are broken by id so every node builds the same ring.
        points.sort();
        Self { points, node_count }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Up to `n` distinct nodes met walking clockwise from `point`.
    pub fn successors(&self, point: u64, n: usize) -> Vec<NodeId> {
        let mut result: Vec<NodeId> = Vec::with_capacity(n.min(self.node_count));
        if self.points.is_empty() || n == 0 {
            return result;
        }

        let start = self.points.partition_point(|(p, _)| *p < point);
        for i in 0..self.points.len() {
            let (_, node) = &self.points[(start + i) % self.points.len()];
            if !result.contains(node) {
                result.push(node.clone());
                if result.len() == n || result.len() == self.node_count {
                    break;
                }
            }
        }
        result
    }
}
