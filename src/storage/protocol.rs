//! Storage Network Protocol
//!
//! Endpoints and DTOs of the node-to-node HTTP API. Everything here lives
//! under `/internal` and is spoken only between cluster members; clients go
//! through the gateway.
//!
//! Every request body carries an [`OpId`] (`origin` + `seq`). For mutations
//! it lets a retried request be answered from the first execution instead of
//! being applied twice; for queries it ties sub-queries to their query in
//! the logs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{FileSummary, ReplicaOp, TagSet, hex_bytes};
use crate::membership::types::NodeId;

// --- API Endpoints ---

/// POST: write a whole file on its bucket's primary.
pub const ENDPOINT_FILES: &str = "/internal/files";
/// POST: add/remove tags of a file on its bucket's primary.
pub const ENDPOINT_TAGS: &str = "/internal/tags";
/// POST: delete a file on its bucket's primary.
pub const ENDPOINT_DELETE: &str = "/internal/delete";
/// POST: match tags against the local index only.
pub const ENDPOINT_QUERY: &str = "/internal/query";
/// POST: primary -> backup change propagation.
pub const ENDPOINT_REPLICATE: &str = "/internal/replicate";
/// GET `/internal/bucket/<n>`: full contents of a bucket, used on adoption.
pub const ENDPOINT_BUCKET: &str = "/internal/bucket";

// --- Data Transfer Objects ---

/// Identity of one logical request, stable across retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub origin: String,
    pub seq: u64,
    /// Set on the per-file parts of a bulk request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<String>,
}

impl OpId {
    pub fn new(origin: impl Into<String>, seq: u64) -> Self {
        Self {
            origin: origin.into(),
            seq,
            part: None,
        }
    }

    /// The id of the part of a bulk request that touches one file.
    pub fn child(&self, file_id: &str) -> Self {
        Self {
            origin: self.origin.clone(),
            seq: self.seq,
            part: Some(file_id.to_string()),
        }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.part {
            Some(part) => write!(f, "{}:{}/{}", self.origin, self.seq, part),
            None => write!(f, "{}:{}", self.origin, self.seq),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutFileRequest {
    #[serde(flatten)]
    pub op: OpId,
    pub file_id: String,
    pub tags: TagSet,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagUpdateRequest {
    #[serde(flatten)]
    pub op: OpId,
    pub file_id: String,
    #[serde(default)]
    pub add: TagSet,
    #[serde(default)]
    pub remove: TagSet,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFileRequest {
    #[serde(flatten)]
    pub op: OpId,
    pub file_id: String,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

/// Asks one node about tags, file ids, or both.
///
/// `files` is the confirmation round of a query: the node reports what it
/// knows of each id whether or not the file still matches any tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLocalRequest {
    #[serde(flatten)]
    pub op: OpId,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

/// What a node knows about one file id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileState {
    Live(FileSummary),
    Deleted { version: u64 },
}

impl FileState {
    pub fn version(&self) -> u64 {
        match self {
            FileState::Live(summary) => summary.version,
            FileState::Deleted { version } => *version,
        }
    }
}

/// Per-tag matches from one node's local index, plus the state of every
/// requested file id the node has heard of.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryLocalResponse {
    pub node: NodeId,
    pub matches: BTreeMap<String, Vec<FileSummary>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub origin: NodeId,
    pub change: ReplicaOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateResponse {
    /// False when the backup already had this version or a newer one.
    pub applied: bool,
}
