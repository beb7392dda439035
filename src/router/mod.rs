//! Query Router
//!
//! Turns tag expressions and file-id requests into calls on the right storage
//! nodes.
//!
//! ## Core Concepts
//! - **Fan-out**: a query resolves every distinct tag to its holders, sends each holder one
//!   sub-query listing the tags it is asked about, and merges the answers. File versions
//!   deduplicate replicas: the highest version of a file decides which tags it carries, and a
//!   confirmation round asks each candidate's owners for that version before evaluating.
//! - **Partial answers**: holders that fail or miss the deadline are reported back instead of
//!   failing the query, unless a tag every match must carry was served only by them.
//! - **Point requests**: writes go to the file bucket's primary and fail over to the next
//!   owner; transport retries live in the RPC client only. Reads fall back through the
//!   bucket's replicas.

pub mod expr;
pub mod files;
pub mod query;


use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::RouterConfig;
use crate::error::ErrorBody;
use crate::membership::types::NodeId;
use crate::placement::Placement;
use crate::rpc::NodeClient;
use crate::storage::protocol::OpId;
use crate::storage::types::{FileSummary, MutationOutcome};

pub use expr::TagExpr;

pub struct QueryRouter {
    placement: Arc<Placement>,
    client: Arc<dyn NodeClient>,
    config: RouterConfig,
    next_seq: AtomicU64,
}

impl QueryRouter {
    pub fn new(placement: Arc<Placement>, client: Arc<dyn NodeClient>, config: RouterConfig) -> Self {
        Self {
            placement,
            client,
            config,
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn placement(&self) -> &Arc<Placement> {
        &self.placement
    }

    /// Shared by the sub-queries of one query so node logs can be joined up.
    fn next_query_op(&self) -> OpId {
        OpId::new(
            format!("router:{}", self.placement.current().local_id),
            self.next_seq.fetch_add(1, Ordering::Relaxed),
        )
    }
}

/// Files matching a query, plus the holders that could not be asked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOutcome {
    /// Sorted by file id.
    pub files: Vec<FileSummary>,
    pub unreachable: Vec<NodeId>,
    /// True when `unreachable` is not empty and the result may be incomplete.
    pub partial: bool,
}

/// Result of a query-driven bulk change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub applied: Vec<MutationOutcome>,
    pub failed: Vec<BulkFailure>,
    pub unreachable: Vec<NodeId>,
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkFailure {
    pub file_id: String,
    pub error: ErrorBody,
}
