use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use super::disk::DiskStore;
use super::index::LocalIndex;
use super::ledger::{DEFAULT_MAX_ORIGINS, DEFAULT_WINDOW, OpLedger};
use super::protocol::{
    DeleteFileRequest, FileState, OpId, PutFileRequest, QueryLocalRequest, QueryLocalResponse,
    ReplicateRequest, TagUpdateRequest,
};
use super::recovery;
use super::types::{
    BlobEnvelope, BucketDump, FileContent, FileSummary, IndexRecord, MutationOutcome, ReplicaOp,
    TagSet, Tombstone, normalize_tag, normalize_tags, validate_file_id,
};
use crate::error::{TagFsError, TagFsResult};
use crate::membership::service::{MembershipService, now_ms};
use crate::membership::types::{NodeId, ShardOwnership};
use crate::placement::Placement;
use crate::placement::ring::{file_bucket, tag_bucket};
use crate::placement::shard_map::Candidate;
use crate::rpc::NodeClient;

/// Maintenance ticks between full index consistency checks.
const CONSISTENCY_EVERY: u64 = 20;

/// One node's shard of blobs and tag entries.
///
/// Mutations are accepted only for buckets this node is primary for and are
/// pushed to the bucket's backups after the local commit. A backup that
/// could not be reached is retried from the maintenance loop. Writes to one file
/// are serialised by a per-file lock; the index lock is only held for the
/// in-memory update, never across I/O.
pub struct StorageNode {
    local_id: NodeId,
    num_buckets: u32,
    disk: DiskStore,
    index: RwLock<LocalIndex>,
    file_locks: DashMap<String, Arc<Mutex<()>>>,
    bucket_locks: DashMap<u32, Arc<Mutex<()>>>,
    tombstone_io: Mutex<()>,
    /// Buckets whose data has been pulled from previous holders.
    adopted: RwLock<BTreeSet<u32>>,
    /// Buckets adopted as primary after a rebalance.
    claims: RwLock<BTreeSet<u32>>,
    ops: OpLedger<MutationOutcome>,
    /// Changes a backup has not acknowledged yet: node -> file -> newest change.
    lagging: DashMap<NodeId, BTreeMap<String, ReplicaOp>>,
    summary_dirty: AtomicBool,
    membership: Arc<MembershipService>,
    placement: Arc<Placement>,
    peers: Arc<dyn NodeClient>,
}

impl StorageNode {
    /// Opens the data directory, recovers the index from disk and announces
    /// what this node holds.
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        membership: Arc<MembershipService>,
        placement: Arc<Placement>,
        peers: Arc<dyn NodeClient>,
    ) -> TagFsResult<Arc<Self>> {
        let disk = DiskStore::open(data_dir).await?;
        let (index, report) = recovery::recover(&disk).await?;
        tracing::info!(
            "Recovered {} file(s) from {} ({} record(s) completed, {} dropped)",
            report.files,
            disk.root().display(),
            report.completed,
            report.dropped_records + report.dropped_blobs
        );

        let node = Arc::new(Self {
            local_id: membership.local_id.clone(),
            num_buckets: placement.current().num_buckets(),
            disk,
            index: RwLock::new(index),
            file_locks: DashMap::new(),
            bucket_locks: DashMap::new(),
            tombstone_io: Mutex::new(()),
            adopted: RwLock::new(BTreeSet::new()),
            claims: RwLock::new(BTreeSet::new()),
            ops: OpLedger::new(DEFAULT_WINDOW, DEFAULT_MAX_ORIGINS),
            lagging: DashMap::new(),
            summary_dirty: AtomicBool::new(false),
            membership,
            placement,
            peers,
        });
        node.announce_summary();
        Ok(node)
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn bucket_for_file(&self, file_id: &str) -> u32 {
        file_bucket(file_id, self.num_buckets)
    }

    pub fn file_count(&self) -> usize {
        self.index.read().len()
    }

    // ============================================================
    // Client-facing operations
    // ============================================================

    /// Creates or overwrites a file. Returns the committed version.
    pub async fn put(&self, req: PutFileRequest) -> TagFsResult<MutationOutcome> {
        validate_file_id(&req.file_id)?;
        let tags = normalize_tags(&req.tags)?;
        let op = req.op.clone();
        self.ops.run(&op, || self.put_once(req, tags)).await
    }

    async fn put_once(&self, req: PutFileRequest, tags: TagSet) -> TagFsResult<MutationOutcome> {
        let bucket = self.check_primary(&req.file_id).await?;
        let guard = self.lock_file(&req.file_id).await;

        let now = now_ms();
        let (version, created_at_ms) = {
            let index = self.index.read();
            let current = index.get(&req.file_id);
            let actual = current.map(|s| s.version).unwrap_or(0);
            if let Some(expected) = req.expected_version
                && expected != actual
            {
                return Err(TagFsError::Conflict { expected, actual });
            }
            (
                index.latest_version(&req.file_id) + 1,
                current.map(|s| s.created_at_ms).unwrap_or(now),
            )
        };

        let blob = BlobEnvelope {
            file_id: req.file_id.clone(),
            version,
            tags,
            created_at_ms,
            updated_at_ms: now,
            payload: req.payload,
        };
        self.commit(&blob).await?;
        drop(guard);

        let outcome = MutationOutcome {
            file_id: req.file_id,
            version,
        };
        tracing::debug!("Stored {} v{} in bucket {}", outcome.file_id, version, bucket);

        self.replicate(bucket, ReplicaOp::Upsert(blob.into_content()))
            .await;
        Ok(outcome)
    }

    pub async fn get(&self, file_id: &str) -> TagFsResult<FileContent> {
        validate_file_id(file_id)?;
        self.ensure_adopted(self.bucket_for_file(file_id)).await;

        let known = self.index.read().get(file_id).is_some();
        if !known {
            return Err(TagFsError::NotFound(file_id.to_string()));
        }
        match self.disk.read_blob(file_id).await? {
            Some(blob) => Ok(blob.into_content()),
            None => {
                tracing::warn!("Index lists {} but its blob is gone", file_id);
                Err(TagFsError::NotFound(file_id.to_string()))
            }
        }
    }

    pub async fn stat(&self, file_id: &str) -> TagFsResult<FileSummary> {
        validate_file_id(file_id)?;
        self.ensure_adopted(self.bucket_for_file(file_id)).await;

        self.index
            .read()
            .get(file_id)
            .cloned()
            .ok_or_else(|| TagFsError::NotFound(file_id.to_string()))
    }

    pub async fn add_tag(&self, op: OpId, file_id: &str, tag: &str) -> TagFsResult<MutationOutcome> {
        self.update_tags(TagUpdateRequest {
            op,
            file_id: file_id.to_string(),
            add: BTreeSet::from([normalize_tag(tag)?]),
            remove: BTreeSet::new(),
            expected_version: None,
        })
        .await
    }

    pub async fn remove_tag(&self, op: OpId, file_id: &str, tag: &str) -> TagFsResult<MutationOutcome> {
        self.update_tags(TagUpdateRequest {
            op,
            file_id: file_id.to_string(),
            add: BTreeSet::new(),
            remove: BTreeSet::from([normalize_tag(tag)?]),
            expected_version: None,
        })
        .await
    }

    /// Applies tag additions then removals. A request that changes nothing
    /// leaves the version where it was.
    pub async fn update_tags(&self, req: TagUpdateRequest) -> TagFsResult<MutationOutcome> {
        validate_file_id(&req.file_id)?;
        let add = normalize_tags(&req.add)?;
        let remove = normalize_tags(&req.remove)?;
        let op = req.op.clone();
        self.ops
            .run(&op, || self.update_tags_once(req, add, remove))
            .await
    }

    async fn update_tags_once(
        &self,
        req: TagUpdateRequest,
        add: TagSet,
        remove: TagSet,
    ) -> TagFsResult<MutationOutcome> {
        let bucket = self.check_primary(&req.file_id).await?;
        let guard = self.lock_file(&req.file_id).await;

        let current = self
            .index
            .read()
            .get(&req.file_id)
            .cloned()
            .ok_or_else(|| TagFsError::NotFound(req.file_id.clone()))?;
        if let Some(expected) = req.expected_version
            && expected != current.version
        {
            return Err(TagFsError::Conflict {
                expected,
                actual: current.version,
            });
        }

        let mut tags = current.tags.clone();
        tags.extend(add);
        tags.retain(|t| !remove.contains(t));

        let outcome = MutationOutcome {
            file_id: req.file_id.clone(),
            version: current.version,
        };
        if tags == current.tags {
            return Ok(outcome);
        }

        let mut blob = self
            .disk
            .read_blob(&req.file_id)
            .await?
            .ok_or_else(|| TagFsError::NotFound(req.file_id.clone()))?;
        blob.tags = tags;
        blob.version = current.version + 1;
        blob.updated_at_ms = now_ms();
        self.commit(&blob).await?;
        drop(guard);

        let outcome = MutationOutcome {
            version: blob.version,
            ..outcome
        };

        self.replicate(bucket, ReplicaOp::Upsert(blob.into_content()))
            .await;
        Ok(outcome)
    }

    /// Removes the blob and every tag entry of the file, leaving a tombstone.
    /// Deleting an already deleted file returns the tombstone's version.
    pub async fn delete(&self, req: DeleteFileRequest) -> TagFsResult<MutationOutcome> {
        validate_file_id(&req.file_id)?;
        let op = req.op.clone();
        self.ops.run(&op, || self.delete_once(req)).await
    }

    async fn delete_once(&self, req: DeleteFileRequest) -> TagFsResult<MutationOutcome> {
        let bucket = self.check_primary(&req.file_id).await?;
        let guard = self.lock_file(&req.file_id).await;

        let (current, tombstone) = {
            let index = self.index.read();
            (index.get(&req.file_id).cloned(), index.tombstone(&req.file_id))
        };
        let current = match (current, tombstone) {
            (Some(current), _) => current,
            (None, Some(t)) => {
                return Ok(MutationOutcome {
                    file_id: req.file_id,
                    version: t.version,
                });
            }
            (None, None) => return Err(TagFsError::NotFound(req.file_id)),
        };
        if let Some(expected) = req.expected_version
            && expected != current.version
        {
            return Err(TagFsError::Conflict {
                expected,
                actual: current.version,
            });
        }

        let version = current.version + 1;
        self.erase(&req.file_id, version).await?;
        drop(guard);
        self.file_locks.remove(&req.file_id);

        let outcome = MutationOutcome {
            file_id: req.file_id.clone(),
            version,
        };
        tracing::debug!("Deleted {} at v{}", req.file_id, version);

        self.replicate(
            bucket,
            ReplicaOp::Delete {
                file_id: req.file_id,
                version,
            },
        )
        .await;
        Ok(outcome)
    }

    /// Matches each tag against the local index only, and reports what this
    /// node knows of each requested file id, matching or not.
    pub fn query_local(&self, req: &QueryLocalRequest) -> TagFsResult<QueryLocalResponse> {
        let tags = req
            .tags
            .iter()
            .map(|t| normalize_tag(t))
            .collect::<TagFsResult<Vec<_>>>()?;
        for id in &req.files {
            validate_file_id(id)?;
        }

        let index = self.index.read();
        let matches: BTreeMap<String, Vec<FileSummary>> = tags
            .into_iter()
            .map(|tag| {
                let files = index.lookup(&tag);
                (tag, files)
            })
            .collect();
        let files: BTreeMap<String, FileState> = req
            .files
            .iter()
            .filter_map(|id| {
                let state = match index.get(id) {
                    Some(summary) => FileState::Live(summary.clone()),
                    None => FileState::Deleted {
                        version: index.tombstone(id)?.version,
                    },
                };
                Some((id.clone(), state))
            })
            .collect();

        tracing::trace!(
            "Query {}: {} tag(s), {} of {} file(s) known",
            req.op,
            matches.len(),
            files.len(),
            req.files.len()
        );
        Ok(QueryLocalResponse {
            node: self.local_id.clone(),
            matches,
            files,
        })
    }

    // ============================================================
    // Replication and bucket transfer
    // ============================================================

    /// Pushes a committed change to the bucket's other owners.
    async fn replicate(&self, bucket: u32, change: ReplicaOp) {
        let backups: Vec<Candidate> = self
            .placement
            .current()
            .owners(bucket)
            .into_iter()
            .filter(|c| c.id != self.local_id)
            .collect();
        for backup in &backups {
            self.send_replica(backup, change.clone()).await;
        }
    }

    /// A change the backup did not acknowledge is kept for
    /// [`Self::resend_lagging`], newest version per file.
    async fn send_replica(&self, backup: &Candidate, change: ReplicaOp) {
        let file_id = change.file_id().to_string();
        let version = change.version();
        let req = ReplicateRequest {
            origin: self.local_id.clone(),
            change: change.clone(),
        };

        match self.peers.replicate(backup, req).await {
            Ok(resp) => {
                tracing::trace!(
                    "Replicated {} v{} to {} (applied={})",
                    file_id,
                    version,
                    backup.id,
                    resp.applied
                );
                if let Some(mut pending) = self.lagging.get_mut(&backup.id)
                    && pending.get(&file_id).is_some_and(|p| p.version() <= version)
                {
                    pending.remove(&file_id);
                }
                self.lagging.remove_if(&backup.id, |_, pending| pending.is_empty());
            }
            Err(e) => {
                tracing::warn!(
                    "Replication of {} v{} to {} failed: {}",
                    file_id,
                    version,
                    backup.id,
                    e
                );
                let mut pending = self.lagging.entry(backup.id.clone()).or_default();
                if pending.get(&file_id).is_none_or(|p| p.version() < version) {
                    pending.insert(file_id, change);
                }
            }
        }
    }

    /// Sends every unacknowledged change again. Changes for nodes that no
    /// longer own the file's bucket are dropped; the new owner adopts the
    /// bucket from us instead.
    pub async fn resend_lagging(&self) {
        let nodes: Vec<NodeId> = self.lagging.iter().map(|e| e.key().clone()).collect();
        if nodes.is_empty() {
            return;
        }

        let map = self.placement.current();
        for node in nodes {
            let Some((node, pending)) = self.lagging.remove(&node) else {
                continue;
            };
            for change in pending.into_values() {
                let bucket = self.bucket_for_file(change.file_id());
                match map.owners(bucket).into_iter().find(|c| c.id == node) {
                    Some(backup) => self.send_replica(&backup, change).await,
                    None => tracing::debug!(
                        "Dropping replica of {} for {}, no longer an owner",
                        change.file_id(),
                        node
                    ),
                }
            }
        }
    }

    /// Number of changes still waiting for a backup's acknowledgement.
    pub fn lagging_replicas(&self) -> usize {
        self.lagging.iter().map(|e| e.value().len()).sum()
    }

    /// Applies a change shipped by a bucket's primary. Older or equal
    /// versions are ignored, so replays and reordering are harmless.
    pub async fn apply_replica(&self, req: ReplicateRequest) -> TagFsResult<bool> {
        validate_file_id(req.change.file_id())?;
        self.ensure_adopted(self.bucket_for_file(req.change.file_id()))
            .await;
        let applied = self.apply_change(req.change).await?;
        if applied {
            tracing::trace!("Applied replica from {}", req.origin);
        }
        Ok(applied)
    }

    async fn apply_change(&self, change: ReplicaOp) -> TagFsResult<bool> {
        let _guard = self.lock_file(change.file_id()).await;
        let latest = self.index.read().latest_version(change.file_id());

        match change {
            ReplicaOp::Upsert(content) => {
                if content.summary.version <= latest {
                    return Ok(false);
                }
                let blob = BlobEnvelope::from(content);
                self.commit(&blob).await?;
                Ok(true)
            }
            ReplicaOp::Delete { file_id, version } => {
                if version <= latest {
                    return Ok(false);
                }
                self.erase(&file_id, version).await?;
                Ok(true)
            }
        }
    }

    /// Everything this node holds for one file bucket, tombstones included.
    pub async fn dump_bucket(&self, bucket: u32) -> TagFsResult<BucketDump> {
        let (ids, tombstones) = {
            let index = self.index.read();
            let ids: Vec<String> = index
                .files()
                .filter(|s| self.bucket_for_file(&s.file_id) == bucket)
                .map(|s| s.file_id.clone())
                .collect();
            let tombstones: Vec<(String, u64)> = index
                .tombstones()
                .iter()
                .filter(|(id, _)| self.bucket_for_file(id) == bucket)
                .map(|(id, t)| (id.clone(), t.version))
                .collect();
            (ids, tombstones)
        };

        let mut files = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(blob) = self.disk.read_blob(&id).await? {
                files.push(blob.into_content());
            }
        }

        Ok(BucketDump {
            bucket,
            files,
            tombstones,
        })
    }

    /// Declared ownership derived from the local index plus current claims.
    pub fn content_summary(&self) -> ShardOwnership {
        let n = self.num_buckets;
        let (file_buckets, tag_buckets) = self
            .index
            .read()
            .content_summary(|id| file_bucket(id, n), |t| tag_bucket(t, n));
        ShardOwnership {
            epoch: 0,
            primary_claims: self.claims.read().clone(),
            file_buckets,
            tag_buckets,
        }
    }

    /// Publishes the content summary through membership. Returns the new
    /// ownership epoch when it changed.
    pub fn announce_summary(&self) -> Option<u64> {
        self.summary_dirty.store(false, Ordering::Release);
        let epoch = self.membership.update_ownership(self.content_summary());
        if let Some(epoch) = epoch {
            tracing::debug!("Announced content summary, ownership epoch {}", epoch);
        }
        epoch
    }

    /// Pulls a bucket from the nodes advertising it the first time this node
    /// finds itself an owner of it. A primary that took data over from
    /// someone else claims the bucket.
    async fn ensure_adopted(&self, bucket: u32) {
        if self.adopted.read().contains(&bucket) {
            return;
        }
        let map = self.placement.current();
        if !map.is_owner(bucket, &self.local_id) {
            return;
        }

        let lock = self
            .bucket_locks
            .entry(bucket)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        if self.adopted.read().contains(&bucket) {
            return;
        }

        let holders = map.file_bucket_holders(bucket, Some(&self.local_id));
        let mut failed = 0;
        let mut applied = 0;
        for holder in &holders {
            let dump = match self.peers.dump_bucket(holder, bucket).await {
                Ok(dump) => dump,
                Err(e) => {
                    tracing::warn!("Failed to pull bucket {} from {}: {}", bucket, holder.id, e);
                    failed += 1;
                    continue;
                }
            };
            for file in dump.files {
                match self.apply_change(ReplicaOp::Upsert(file)).await {
                    Ok(true) => applied += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Failed to adopt file of bucket {}: {}", bucket, e),
                }
            }
            for (file_id, version) in dump.tombstones {
                if let Err(e) = self
                    .apply_change(ReplicaOp::Delete { file_id, version })
                    .await
                {
                    tracing::warn!("Failed to adopt tombstone of bucket {}: {}", bucket, e);
                }
            }
        }

        if failed > 0 && failed == holders.len() {
            // Nobody answered; try again on the next request.
            return;
        }
        self.adopted.write().insert(bucket);

        if !holders.is_empty() && map.is_primary(bucket, &self.local_id) {
            self.claims.write().insert(bucket);
            let epoch = self.announce_summary();
            tracing::info!(
                "Adopted bucket {} as primary ({} file(s) pulled from {} holder(s), epoch {:?})",
                bucket,
                applied,
                holders.len(),
                epoch
            );
        } else if applied > 0 {
            tracing::info!("Adopted bucket {} ({} file(s) pulled)", bucket, applied);
        }
    }

    /// Periodic upkeep: drops lost primary claims, re-sends changes backups
    /// missed, hands off buckets the node no longer owns, re-announces the
    /// summary after removals and checks the index.
    pub async fn run_maintenance(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            ticks += 1;

            self.drop_lost_claims();
            self.resend_lagging().await;
            if let Err(e) = self.release_handed_off().await {
                tracing::warn!("Bucket handoff failed: {}", e);
            }
            if self.summary_dirty.load(Ordering::Acquire) {
                self.announce_summary();
            }
            if ticks % CONSISTENCY_EVERY == 0 {
                self.check_index();
            }
        }
    }

    fn drop_lost_claims(&self) {
        let claims: Vec<u32> = self.claims.read().iter().copied().collect();
        if claims.is_empty() {
            return;
        }
        let epoch = self.membership.local_record().ownership.epoch;
        let lost = self
            .placement
            .current()
            .lost_claims(&self.local_id, epoch, claims);
        if lost.is_empty() {
            return;
        }

        {
            let mut claims = self.claims.write();
            let mut adopted = self.adopted.write();
            for bucket in &lost {
                claims.remove(bucket);
                adopted.remove(bucket);
            }
        }
        tracing::info!("Lost primary claim on bucket(s) {:?}", lost);
        self.announce_summary();
    }

    /// Forgets files of buckets this node no longer owns once their primary
    /// has claimed them, which means it has pulled them from us.
    async fn release_handed_off(&self) -> TagFsResult<()> {
        let map = self.placement.current();
        let held = self.content_summary().file_buckets;

        for bucket in held {
            if map.is_owner(bucket, &self.local_id) {
                continue;
            }
            let Some(primary) = map.primary(bucket) else {
                continue;
            };
            let claimed = map
                .record(&primary)
                .map(|r| r.ownership.primary_claims.contains(&bucket))
                .unwrap_or(false);
            if !claimed {
                continue;
            }

            let ids: Vec<String> = self
                .index
                .read()
                .files()
                .filter(|s| self.bucket_for_file(&s.file_id) == bucket)
                .map(|s| s.file_id.clone())
                .collect();
            for id in &ids {
                let _guard = self.lock_file(id).await;
                self.disk.remove_blob(id).await?;
                self.disk.remove_record(id).await?;
                self.index.write().forget(id);
            }
            self.adopted.write().remove(&bucket);
            self.summary_dirty.store(true, Ordering::Release);
            tracing::info!("Handed off bucket {} ({} file(s)) to {}", bucket, ids.len(), primary);
        }
        Ok(())
    }

    /// Rebuilds the secondary index if it drifted from the primary records.
    pub fn check_index(&self) -> bool {
        let consistent = self.index.read().is_consistent();
        if !consistent {
            tracing::warn!("Secondary tag index disagrees with primary records, rebuilding");
            self.index.write().rebuild_secondary();
        }
        consistent
    }

    // ============================================================
    // Internals
    // ============================================================

    async fn check_primary(&self, file_id: &str) -> TagFsResult<u32> {
        let bucket = self.bucket_for_file(file_id);
        if !self.placement.current().is_primary(bucket, &self.local_id) {
            return Err(TagFsError::StaleWrite { bucket });
        }
        self.ensure_adopted(bucket).await;
        Ok(bucket)
    }

    async fn lock_file(&self, file_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .file_locks
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Disk first, then memory. A failed disk commit leaves the previous
    /// version in place both on disk and in the index.
    async fn commit(&self, blob: &BlobEnvelope) -> TagFsResult<()> {
        let summary = blob.summary();
        let rel = DiskStore::blob_rel_path(&blob.file_id);
        let previous = self
            .index
            .read()
            .get(&blob.file_id)
            .cloned()
            .map(|summary| IndexRecord {
                summary,
                blob: rel.clone(),
            });
        let record = IndexRecord {
            summary: summary.clone(),
            blob: rel,
        };
        self.disk
            .commit_file(blob, &record, previous.as_ref())
            .await?;

        let had_tombstone = {
            let mut index = self.index.write();
            let had = index.tombstone(&blob.file_id).is_some();
            index.upsert(summary.clone());
            had
        };
        if had_tombstone {
            self.persist_tombstones().await?;
        }
        self.note_new_content(&summary);
        Ok(())
    }

    async fn erase(&self, file_id: &str, version: u64) -> TagFsResult<()> {
        self.disk.remove_blob(file_id).await?;
        self.disk.remove_record(file_id).await?;
        self.index.write().remove(
            file_id,
            Tombstone {
                version,
                deleted_at_ms: now_ms(),
            },
        );
        self.persist_tombstones().await?;
        self.summary_dirty.store(true, Ordering::Release);
        Ok(())
    }

    async fn persist_tombstones(&self) -> TagFsResult<()> {
        let _io = self.tombstone_io.lock().await;
        let snapshot = self.index.read().tombstones().clone();
        self.disk.save_tombstones(&snapshot).await
    }

    /// New buckets are announced right away so queries find the file;
    /// shrinking is left to the maintenance loop.
    fn note_new_content(&self, summary: &FileSummary) {
        let declared = self.membership.local_record().ownership;
        let n = self.num_buckets;
        let grows = !declared
            .file_buckets
            .contains(&file_bucket(&summary.file_id, n))
            || summary
                .tags
                .iter()
                .any(|t| !declared.tag_buckets.contains(&tag_bucket(t, n)));
        if grows {
            self.announce_summary();
        }
    }
}
