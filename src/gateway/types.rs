use serde::{Deserialize, Serialize};

use crate::error::{ErrorBody, TagFsError};
use crate::membership::types::{NodeId, NodeRecord};

/// Client identity header; with [`HEADER_REQUEST_SEQ`] it names one logical request.
pub const HEADER_CLIENT_ID: &str = "x-client-id";
pub const HEADER_REQUEST_SEQ: &str = "x-request-seq";

/// Metadata sent alongside raw file bytes.
pub const HEADER_FILE_VERSION: &str = "x-file-version";
pub const HEADER_FILE_DIGEST: &str = "x-file-digest";
pub const HEADER_FILE_TAGS: &str = "x-file-tags";

/// Body of every JSON response of the client API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub unreachable: Vec<NodeId>,
}

impl Envelope {
    pub fn data<T: Serialize>(data: &T) -> Result<Self, TagFsError> {
        Ok(Self {
            ok: true,
            data: Some(serde_json::to_value(data)?),
            ..Default::default()
        })
    }

    pub fn error(e: &TagFsError) -> Self {
        Self {
            ok: false,
            error: Some(ErrorBody::from(e)),
            partial: matches!(e, TagFsError::PartialUnavailable { .. }),
            unreachable: e.unreachable_nodes(),
            ..Default::default()
        }
    }

    pub fn with_unreachable(mut self, partial: bool, unreachable: Vec<NodeId>) -> Self {
        self.partial = partial;
        self.unreachable = unreachable;
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct PutParams {
    /// Comma-separated tags.
    #[serde(default)]
    pub tags: String,
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct AddTagRequest {
    pub tag: String,
}

#[derive(Debug, Deserialize)]
pub struct RetagRequest {
    pub query: String,
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMatchingRequest {
    pub query: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterView {
    pub local_id: NodeId,
    pub version: u64,
    pub members: Vec<NodeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub node: NodeId,
    pub alive_members: usize,
    pub files: usize,
}
