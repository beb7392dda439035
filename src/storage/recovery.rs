//! Start-up reconciliation of blobs and index records.
//!
//! Blobs are the source of truth: they embed the tags and version they were
//! committed with, and the blob rename is the last step of a commit.
//!
//! - a blob without a matching record gets its record rewritten from the blob;
//! - a record without a blob is dropped;
//! - a blob at or below its tombstone's version is deleted;
//! - the secondary tag index is derived from the surviving records.

use std::collections::HashSet;

use super::disk::DiskStore;
use super::index::LocalIndex;
use super::types::IndexRecord;
use crate::error::TagFsResult;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub files: usize,
    /// Records rewritten from their blob.
    pub completed: usize,
    pub dropped_records: usize,
    pub dropped_blobs: usize,
    pub temp_files: usize,
}

pub async fn recover(disk: &DiskStore) -> TagFsResult<(LocalIndex, RecoveryReport)> {
    let mut report = RecoveryReport {
        temp_files: disk.remove_temp_files().await?,
        ..RecoveryReport::default()
    };
    let tombstones = disk.load_tombstones().await?;

    let mut summaries = Vec::new();
    let mut live: HashSet<String> = HashSet::new();

    for id in disk.blob_ids().await? {
        let blob = match disk.read_blob(&id).await {
            Ok(Some(blob)) if blob.file_id == id => blob,
            Ok(None) => continue,
            Ok(Some(_)) | Err(_) => {
                tracing::warn!("Dropping unreadable blob {}", id);
                disk.remove_blob(&id).await?;
                report.dropped_blobs += 1;
                continue;
            }
        };

        if let Some(t) = tombstones.get(&id)
            && t.version >= blob.version
        {
            disk.remove_blob(&id).await?;
            report.dropped_blobs += 1;
            continue;
        }

        let summary = blob.summary();
        let record = disk.read_record(&id).await.unwrap_or_else(|e| {
            tracing::warn!("Unreadable index record {}: {}", id, e);
            None
        });
        if record.as_ref().map(|r| &r.summary) != Some(&summary) {
            disk.write_record(&IndexRecord {
                summary: summary.clone(),
                blob: DiskStore::blob_rel_path(&id),
            })
            .await?;
            report.completed += 1;
        }

        live.insert(id);
        summaries.push(summary);
    }

    for id in disk.record_ids().await? {
        if !live.contains(&id) {
            disk.remove_record(&id).await?;
            report.dropped_records += 1;
        }
    }

    report.files = summaries.len();
    let mut index = LocalIndex::from_parts(summaries, tombstones);
    if !index.is_consistent() {
        index.rebuild_secondary();
    }
    Ok((index, report))
}
