use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::error::{TagFsError, TagFsResult};

pub const MAX_TAG_LEN: usize = 20;

pub type TagSet = BTreeSet<String>;

/// Normalises a tag to its stored form, rejecting anything a query could not
/// spell.
pub fn normalize_tag(raw: &str) -> TagFsResult<String> {
    let tag = raw.trim().to_lowercase();
    let invalid = |reason: &str| TagFsError::InvalidTag {
        tag: raw.to_string(),
        reason: reason.to_string(),
    };

    if tag.is_empty() {
        return Err(invalid("empty"));
    }
    if tag.chars().count() > MAX_TAG_LEN {
        return Err(invalid("longer than 20 characters"));
    }
    if tag.chars().any(char::is_whitespace) {
        return Err(invalid("contains whitespace"));
    }
    if tag.contains(['(', ')', ',']) {
        return Err(invalid("contains a reserved character"));
    }
    Ok(tag)
}

pub fn normalize_tags<I, S>(raw: I) -> TagFsResult<TagSet>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter().map(|t| normalize_tag(t.as_ref())).collect()
}

/// File ids are UUIDs; anything else never reaches the disk layer.
pub fn validate_file_id(file_id: &str) -> TagFsResult<()> {
    uuid::Uuid::parse_str(file_id)
        .map(|_| ())
        .map_err(|_| TagFsError::InvalidFileId(file_id.to_string()))
}

pub fn new_file_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn digest_of(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Everything known about a file except its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub file_id: String,
    pub tags: TagSet,
    pub version: u64,
    pub size: u64,
    pub digest: String,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Result of any committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub file_id: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub summary: FileSummary,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

/// On-disk blob: the payload plus the tags and version it was written with,
/// so the index can be rebuilt from blobs alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobEnvelope {
    pub file_id: String,
    pub version: u64,
    pub tags: TagSet,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub payload: Vec<u8>,
}

impl BlobEnvelope {
    pub fn summary(&self) -> FileSummary {
        FileSummary {
            file_id: self.file_id.clone(),
            tags: self.tags.clone(),
            version: self.version,
            size: self.payload.len() as u64,
            digest: digest_of(&self.payload),
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        }
    }

    pub fn into_content(self) -> FileContent {
        FileContent {
            summary: self.summary(),
            payload: self.payload,
        }
    }
}

impl From<FileContent> for BlobEnvelope {
    fn from(content: FileContent) -> Self {
        let s = content.summary;
        Self {
            file_id: s.file_id,
            version: s.version,
            tags: s.tags,
            created_at_ms: s.created_at_ms,
            updated_at_ms: s.updated_at_ms,
            payload: content.payload,
        }
    }
}

/// Primary index record, one JSON file per blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    #[serde(flatten)]
    pub summary: FileSummary,
    /// Blob path relative to the data directory.
    pub blob: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub version: u64,
    pub deleted_at_ms: u64,
}

/// A change shipped from a primary to its backups, or pulled on adoption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ReplicaOp {
    Upsert(FileContent),
    Delete { file_id: String, version: u64 },
}

impl ReplicaOp {
    pub fn file_id(&self) -> &str {
        match self {
            ReplicaOp::Upsert(content) => &content.summary.file_id,
            ReplicaOp::Delete { file_id, .. } => file_id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            ReplicaOp::Upsert(content) => content.summary.version,
            ReplicaOp::Delete { version, .. } => *version,
        }
    }
}

/// Full contents of one file bucket as held by one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketDump {
    pub bucket: u32,
    pub files: Vec<FileContent>,
    pub tombstones: Vec<(String, u64)>,
}

/// Byte payloads travel as hex strings inside JSON bodies.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
