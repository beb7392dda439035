//! Persisted layout of a storage node.
//!
//! ```text
//! <data_dir>/blobs/<file_id>.blob   bincode BlobEnvelope
//! <data_dir>/index/<file_id>.json   primary IndexRecord
//! <data_dir>/tombstones.json        file_id -> Tombstone
//! ```
//!
//! Every write goes to a `.tmp` sibling first and is renamed into place, so a
//! crash leaves either the old file or the new one. A file commit stages both
//! the blob and its record before renaming either; the blob rename is the
//! commit point.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::types::{BlobEnvelope, IndexRecord, Tombstone};
use crate::error::TagFsResult;

const BLOB_DIR: &str = "blobs";
const INDEX_DIR: &str = "index";
const TOMBSTONES: &str = "tombstones.json";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub async fn open(root: impl Into<PathBuf>) -> TagFsResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(BLOB_DIR)).await?;
        fs::create_dir_all(root.join(INDEX_DIR)).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_rel_path(file_id: &str) -> String {
        format!("{}/{}.blob", BLOB_DIR, file_id)
    }

    fn blob_path(&self, file_id: &str) -> PathBuf {
        self.root.join(Self::blob_rel_path(file_id))
    }

    fn record_path(&self, file_id: &str) -> PathBuf {
        self.root.join(INDEX_DIR).join(format!("{}.json", file_id))
    }

    // --- Blobs ---

    pub async fn write_blob(&self, blob: &BlobEnvelope) -> TagFsResult<()> {
        let bytes = bincode::serialize(blob)?;
        write_atomic(&self.blob_path(&blob.file_id), &bytes).await
    }

    pub async fn read_blob(&self, file_id: &str) -> TagFsResult<Option<BlobEnvelope>> {
        match fs::read(self.blob_path(file_id)).await {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_blob(&self, file_id: &str) -> TagFsResult<()> {
        remove_if_exists(&self.blob_path(file_id)).await
    }

    /// Writes a new version of a file. Both files are staged, then the
    /// record is renamed into place and finally the blob. If the record
    /// cannot be placed nothing changes; if the blob cannot, `previous` is put
    /// back. Either way the old version stays the visible one, and recovery
    /// rebuilds a record from whichever blob is in place.
    pub async fn commit_file(
        &self,
        blob: &BlobEnvelope,
        record: &IndexRecord,
        previous: Option<&IndexRecord>,
    ) -> TagFsResult<()> {
        let blob_path = self.blob_path(&blob.file_id);
        let record_path = self.record_path(&blob.file_id);

        let blob_tmp = stage(&blob_path, &bincode::serialize(blob)?).await?;
        let record_tmp = match serde_json::to_vec_pretty(record) {
            Ok(bytes) => stage(&record_path, &bytes).await,
            Err(e) => Err(e.into()),
        };
        let record_tmp = match record_tmp {
            Ok(tmp) => tmp,
            Err(e) => {
                discard(&blob_tmp).await;
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&record_tmp, &record_path).await {
            discard(&record_tmp).await;
            discard(&blob_tmp).await;
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&blob_tmp, &blob_path).await {
            discard(&blob_tmp).await;
            let restored = match previous {
                Some(previous) => self.write_record(previous).await,
                None => self.remove_record(&blob.file_id).await,
            };
            if let Err(restore) = restored {
                tracing::warn!(
                    "Could not restore index record of {} after failed commit: {}",
                    blob.file_id,
                    restore
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn blob_ids(&self) -> TagFsResult<Vec<String>> {
        list_ids(&self.root.join(BLOB_DIR), ".blob").await
    }

    // --- Primary index records ---

    pub async fn write_record(&self, record: &IndexRecord) -> TagFsResult<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.record_path(&record.summary.file_id), &bytes).await
    }

    pub async fn read_record(&self, file_id: &str) -> TagFsResult<Option<IndexRecord>> {
        match fs::read(self.record_path(file_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_record(&self, file_id: &str) -> TagFsResult<()> {
        remove_if_exists(&self.record_path(file_id)).await
    }

    pub async fn record_ids(&self) -> TagFsResult<Vec<String>> {
        list_ids(&self.root.join(INDEX_DIR), ".json").await
    }

    // --- Tombstones ---

    pub async fn load_tombstones(&self) -> TagFsResult<BTreeMap<String, Tombstone>> {
        match fs::read(self.root.join(TOMBSTONES)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_tombstones(&self, tombstones: &BTreeMap<String, Tombstone>) -> TagFsResult<()> {
        let bytes = serde_json::to_vec_pretty(tombstones)?;
        write_atomic(&self.root.join(TOMBSTONES), &bytes).await
    }

    /// Deletes leftovers of interrupted writes. Returns how many were found.
    pub async fn remove_temp_files(&self) -> TagFsResult<usize> {
        let mut removed = 0;
        for dir in [self.root.clone(), self.root.join(BLOB_DIR), self.root.join(INDEX_DIR)] {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
                    remove_if_exists(&entry.path()).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> TagFsResult<()> {
    let tmp = stage(path, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        discard(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Writes `bytes` next to `path` and returns the temporary file.
async fn stage(path: &Path, bytes: &[u8]) -> TagFsResult<PathBuf> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    if let Err(e) = fs::write(&tmp, bytes).await {
        discard(&tmp).await;
        return Err(e.into());
    }
    Ok(tmp)
}

/// Best effort; recovery sweeps whatever is left.
async fn discard(tmp: &Path) {
    if let Err(e) = remove_if_exists(tmp).await {
        tracing::debug!("Could not remove {}: {}", tmp.display(), e);
    }
}

async fn remove_if_exists(path: &Path) -> TagFsResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn list_ids(dir: &Path, suffix: &str) -> TagFsResult<Vec<String>> {
    let mut ids = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(id) = name.strip_suffix(suffix) {
            ids.push(id.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}
