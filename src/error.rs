//! Error taxonomy shared by the storage node, router and gateway.
//!
//! Plumbing code (sockets, start-up, serialization glue) keeps using
//! `anyhow::Result`; anything that crosses a component boundary and must be
//! reported to a client is expressed as a [`TagFsError`].

use crate::membership::types::NodeId;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

pub type TagFsResult<T> = std::result::Result<T, TagFsError>;

#[derive(Debug, thiserror::Error)]
pub enum TagFsError {
    /// The file id is unknown to the node that was asked. It may still exist
    /// elsewhere in the cluster.
    #[error("file {0} not found")]
    NotFound(String),

    #[error("query incomplete, unreachable nodes: {}", fmt_nodes(.unreachable))]
    PartialUnavailable { unreachable: Vec<NodeId> },

    /// The target node no longer owns the bucket; re-resolve and retry.
    #[error("stale write: node does not own bucket {bucket}")]
    StaleWrite { bucket: u32 },

    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },

    #[error("invalid tag {tag:?}: {reason}")]
    InvalidTag { tag: String, reason: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid file id {0:?}")]
    InvalidFileId(String),

    /// The sequence number is older than anything still remembered for its
    /// origin, so a replay can no longer be told apart from a new request.
    #[error("request {origin}:{seq} is older than the replay window")]
    ExpiredRequest { origin: String, seq: u64 },

    #[error("request cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

impl TagFsError {
    /// Stable machine-readable name, used in response envelopes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TagFsError::NotFound(_) => ErrorKind::NotFound,
            TagFsError::PartialUnavailable { .. } => ErrorKind::PartialUnavailable,
            TagFsError::StaleWrite { .. } => ErrorKind::StaleWrite,
            TagFsError::Conflict { .. } => ErrorKind::Conflict,
            TagFsError::Unreachable { .. } => ErrorKind::Unreachable,
            TagFsError::InvalidTag { .. } => ErrorKind::InvalidTag,
            TagFsError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            TagFsError::InvalidFileId(_) => ErrorKind::InvalidFileId,
            TagFsError::ExpiredRequest { .. } => ErrorKind::ExpiredRequest,
            TagFsError::Cancelled => ErrorKind::Cancelled,
            TagFsError::Io(_) => ErrorKind::Io,
            TagFsError::Codec(_) => ErrorKind::Codec,
        }
    }

    /// Transport and staleness failures are worth retrying locally.
    /// `NotFound` and `Conflict` are surfaced to the caller untouched.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TagFsError::Unreachable { .. } | TagFsError::StaleWrite { .. }
        )
    }

    pub fn status(&self) -> StatusCode {
        self.kind().status()
    }

    pub fn unreachable_nodes(&self) -> Vec<NodeId> {
        match self {
            TagFsError::PartialUnavailable { unreachable } => unreachable.clone(),
            TagFsError::Unreachable { node, .. } => vec![node.clone()],
            _ => Vec::new(),
        }
    }

    /// Rebuilds an error from the wire form produced by [`ErrorBody`]. A body
    /// missing the fields its kind needs decodes as a `Codec` error.
    pub fn from_body(body: ErrorBody) -> Self {
        let kind = body.kind;
        let missing = |field: &str| {
            TagFsError::Codec(format!("{} error body without {}", kind.as_str(), field))
        };

        match kind {
            ErrorKind::NotFound => TagFsError::NotFound(body.message),
            ErrorKind::PartialUnavailable => TagFsError::PartialUnavailable {
                unreachable: body.unreachable,
            },
            ErrorKind::StaleWrite => match body.bucket {
                Some(bucket) => TagFsError::StaleWrite { bucket },
                None => missing("bucket"),
            },
            ErrorKind::Conflict => match (body.expected, body.actual) {
                (Some(expected), Some(actual)) => TagFsError::Conflict { expected, actual },
                _ => missing("expected/actual versions"),
            },
            ErrorKind::Unreachable => {
                match body.node.or_else(|| body.unreachable.into_iter().next()) {
                    Some(node) => TagFsError::Unreachable {
                        node,
                        reason: body.message,
                    },
                    None => missing("node"),
                }
            }
            ErrorKind::InvalidTag => match (body.tag, body.reason) {
                (Some(tag), Some(reason)) => TagFsError::InvalidTag { tag, reason },
                _ => missing("tag/reason"),
            },
            ErrorKind::InvalidQuery => TagFsError::InvalidQuery(body.message),
            ErrorKind::InvalidFileId => TagFsError::InvalidFileId(body.message),
            ErrorKind::ExpiredRequest => match (body.origin, body.seq) {
                (Some(origin), Some(seq)) => TagFsError::ExpiredRequest { origin, seq },
                _ => missing("origin/seq"),
            },
            ErrorKind::Cancelled => TagFsError::Cancelled,
            ErrorKind::Io => TagFsError::Io(std::io::Error::other(body.message)),
            ErrorKind::Codec => TagFsError::Codec(body.message),
        }
    }
}

impl From<serde_json::Error> for TagFsError {
    fn from(e: serde_json::Error) -> Self {
        TagFsError::Codec(e.to_string())
    }
}

impl From<bincode::Error> for TagFsError {
    fn from(e: bincode::Error) -> Self {
        TagFsError::Codec(e.to_string())
    }
}

/// One kind per [`TagFsError`] variant, so the wire form loses nothing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PartialUnavailable,
    StaleWrite,
    Conflict,
    Unreachable,
    InvalidTag,
    InvalidQuery,
    InvalidFileId,
    ExpiredRequest,
    Cancelled,
    Io,
    Codec,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::PartialUnavailable => "partial_unavailable",
            ErrorKind::StaleWrite => "stale_write",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::InvalidTag => "invalid_tag",
            ErrorKind::InvalidQuery => "invalid_query",
            ErrorKind::InvalidFileId => "invalid_file_id",
            ErrorKind::ExpiredRequest => "expired_request",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
            ErrorKind::Codec => "codec",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::PartialUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::StaleWrite | ErrorKind::Conflict | ErrorKind::ExpiredRequest => {
                StatusCode::CONFLICT
            }
            ErrorKind::Unreachable => StatusCode::BAD_GATEWAY,
            ErrorKind::InvalidTag | ErrorKind::InvalidQuery | ErrorKind::InvalidFileId => {
                StatusCode::BAD_REQUEST
            }
            // Nginx's "client closed request".
            ErrorKind::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            ErrorKind::Io | ErrorKind::Codec => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Failures of the node itself rather than of the request.
    pub fn is_internal(&self) -> bool {
        matches!(self, ErrorKind::Io | ErrorKind::Codec)
    }
}

/// Serialized form of a [`TagFsError`] inside a response envelope.
///
/// `message` carries the variant's text payload (file id, reason, query
/// error) where it has one and the display string otherwise. Structured
/// fields are only present for the kinds that use them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unreachable: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl From<&TagFsError> for ErrorBody {
    fn from(e: &TagFsError) -> Self {
        let mut body = ErrorBody {
            kind: e.kind(),
            message: e.to_string(),
            unreachable: e.unreachable_nodes(),
            node: None,
            bucket: None,
            expected: None,
            actual: None,
            tag: None,
            reason: None,
            origin: None,
            seq: None,
        };
        match e {
            TagFsError::NotFound(text)
            | TagFsError::InvalidQuery(text)
            | TagFsError::InvalidFileId(text)
            | TagFsError::Codec(text) => body.message = text.clone(),
            TagFsError::Io(io) => body.message = io.to_string(),
            TagFsError::Unreachable { node, reason } => {
                body.message = reason.clone();
                body.node = Some(node.clone());
            }
            TagFsError::StaleWrite { bucket } => body.bucket = Some(*bucket),
            TagFsError::Conflict { expected, actual } => {
                body.expected = Some(*expected);
                body.actual = Some(*actual);
            }
            TagFsError::InvalidTag { tag, reason } => {
                body.tag = Some(tag.clone());
                body.reason = Some(reason.clone());
            }
            TagFsError::ExpiredRequest { origin, seq } => {
                body.origin = Some(origin.clone());
                body.seq = Some(*seq);
            }
            TagFsError::PartialUnavailable { .. } | TagFsError::Cancelled => {}
        }
        body
    }
}

fn fmt_nodes(nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .map(|n| n.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
