use std::future::Future;
use tokio_util::sync::CancellationToken;

use super::expr::TagExpr;
use super::{BulkFailure, BulkOutcome, QueryRouter};
use crate::error::{TagFsError, TagFsResult};
use crate::membership::types::NodeId;
use crate::placement::shard_map::Candidate;
use crate::storage::protocol::{DeleteFileRequest, OpId, PutFileRequest, TagUpdateRequest};
use crate::storage::types::{
    FileContent, FileSummary, MutationOutcome, TagSet, new_file_id, normalize_tag, normalize_tags,
    validate_file_id,
};

impl QueryRouter {
    // ============================================================
    // Point operations
    // ============================================================

    /// Stores a new file under a fresh id on the primary of its bucket.
    pub async fn put(&self, op: OpId, tags: TagSet, payload: Vec<u8>) -> TagFsResult<MutationOutcome> {
        let req = PutFileRequest {
            op,
            file_id: new_file_id(),
            tags: normalize_tags(&tags)?,
            payload,
            expected_version: None,
        };
        let client = &self.client;
        self.on_primary(&req.file_id, |target| {
            let req = req.clone();
            async move { client.put(&target, req).await }
        })
        .await
    }

    pub async fn get(&self, file_id: &str) -> TagFsResult<FileContent> {
        let client = &self.client;
        self.from_replicas(file_id, |target| async move { client.get(&target, file_id).await })
            .await
    }

    pub async fn stat(&self, file_id: &str) -> TagFsResult<FileSummary> {
        let client = &self.client;
        self.from_replicas(file_id, |target| async move { client.stat(&target, file_id).await })
            .await
    }

    pub async fn add_tag(&self, op: OpId, file_id: &str, tag: &str) -> TagFsResult<MutationOutcome> {
        self.update_tags(TagUpdateRequest {
            op,
            file_id: file_id.to_string(),
            add: TagSet::from([normalize_tag(tag)?]),
            remove: TagSet::new(),
            expected_version: None,
        })
        .await
    }

    pub async fn remove_tag(&self, op: OpId, file_id: &str, tag: &str) -> TagFsResult<MutationOutcome> {
        self.update_tags(TagUpdateRequest {
            op,
            file_id: file_id.to_string(),
            add: TagSet::new(),
            remove: TagSet::from([normalize_tag(tag)?]),
            expected_version: None,
        })
        .await
    }

    pub async fn update_tags(&self, req: TagUpdateRequest) -> TagFsResult<MutationOutcome> {
        let client = &self.client;
        let file_id = req.file_id.clone();
        self.on_primary(&file_id, |target| {
            let req = req.clone();
            async move { client.update_tags(&target, req).await }
        })
        .await
    }

    pub async fn delete(&self, op: OpId, file_id: &str) -> TagFsResult<MutationOutcome> {
        let req = DeleteFileRequest {
            op,
            file_id: file_id.to_string(),
            expected_version: None,
        };
        let client = &self.client;
        self.on_primary(file_id, |target| {
            let req = req.clone();
            async move { client.delete(&target, req).await }
        })
        .await
    }

    // ============================================================
    // Bulk operations
    // ============================================================

    /// Adds and removes tags on every file matching `expr`.
    ///
    /// Each file is changed under its own op id derived from `op`, so
    /// re-running a cancelled or half-failed bulk request is safe.
    pub async fn retag(
        &self,
        op: &OpId,
        expr: &TagExpr,
        add: TagSet,
        remove: TagSet,
        cancel: &CancellationToken,
    ) -> TagFsResult<BulkOutcome> {
        let add = normalize_tags(&add)?;
        let remove = normalize_tags(&remove)?;
        if add.is_empty() && remove.is_empty() {
            return Err(TagFsError::InvalidQuery("no tags to add or remove".into()));
        }

        let matched = self.query(expr, cancel).await?;
        let mut outcome = BulkOutcome {
            unreachable: matched.unreachable,
            partial: matched.partial,
            ..Default::default()
        };

        for file in matched.files {
            if cancel.is_cancelled() {
                return Err(TagFsError::Cancelled);
            }
            let req = TagUpdateRequest {
                op: op.child(&file.file_id),
                file_id: file.file_id.clone(),
                add: add.clone(),
                remove: remove.clone(),
                expected_version: None,
            };
            match self.update_tags(req).await {
                Ok(applied) => outcome.applied.push(applied),
                Err(e) => {
                    tracing::warn!("Retag of {} failed: {}", file.file_id, e);
                    outcome.failed.push(BulkFailure {
                        file_id: file.file_id,
                        error: (&e).into(),
                    });
                }
            }
        }

        tracing::info!(
            "Retag '{}': {} applied, {} failed",
            expr,
            outcome.applied.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }

    /// Deletes every file matching `expr`.
    pub async fn delete_matching(
        &self,
        op: &OpId,
        expr: &TagExpr,
        cancel: &CancellationToken,
    ) -> TagFsResult<BulkOutcome> {
        let matched = self.query(expr, cancel).await?;
        let mut outcome = BulkOutcome {
            unreachable: matched.unreachable,
            partial: matched.partial,
            ..Default::default()
        };

        for file in matched.files {
            if cancel.is_cancelled() {
                return Err(TagFsError::Cancelled);
            }
            match self.delete(op.child(&file.file_id), &file.file_id).await {
                Ok(applied) => outcome.applied.push(applied),
                Err(e) => {
                    tracing::warn!("Delete of {} failed: {}", file.file_id, e);
                    outcome.failed.push(BulkFailure {
                        file_id: file.file_id,
                        error: (&e).into(),
                    });
                }
            }
        }

        tracing::info!(
            "Delete '{}': {} deleted, {} failed",
            expr,
            outcome.applied.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }

    // ============================================================
    // Targeting
    // ============================================================

    /// Sends `call` to the primary of the file's bucket.
    ///
    /// The client already retries transport failures, so nothing here
    /// sleeps. `Unreachable` fails over to the next owner. `StaleWrite`
    /// re-reads placement, which may have moved the primary, and otherwise
    /// moves on as well. Each owner is tried at most once.
    async fn on_primary<T, F, Fut>(&self, file_id: &str, call: F) -> TagFsResult<T>
    where
        F: Fn(Candidate) -> Fut,
        Fut: Future<Output = TagFsResult<T>>,
    {
        validate_file_id(file_id)?;
        let mut tried: Vec<NodeId> = Vec::new();
        let mut last_error = None;

        loop {
            let map = self.placement.current();
            let bucket = map.bucket_for_file(file_id);
            let Some(target) = map
                .owners(bucket)
                .into_iter()
                .find(|owner| !tried.contains(&owner.id))
            else {
                break;
            };

            match call(target.clone()).await {
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        "Request for {} on {} failed, trying next owner: {}",
                        file_id,
                        target.id,
                        e
                    );
                    tried.push(target.id);
                    last_error = Some(e);
                }
                other => return other,
            }
        }

        Err(last_error.unwrap_or_else(|| TagFsError::Unreachable {
            node: self.placement.current().local_id.clone(),
            reason: "no alive owner".to_string(),
        }))
    }

    /// Tries the bucket's owners, then any other node advertising the bucket.
    /// `NotFound` from one replica does not stop the search: a new owner may
    /// not have adopted the bucket yet.
    async fn from_replicas<T, F, Fut>(&self, file_id: &str, call: F) -> TagFsResult<T>
    where
        F: Fn(Candidate) -> Fut,
        Fut: Future<Output = TagFsResult<T>>,
    {
        validate_file_id(file_id)?;
        let map = self.placement.current();
        let bucket = map.bucket_for_file(file_id);

        let mut targets = map.owners(bucket);
        for holder in map.file_bucket_holders(bucket, None) {
            if !targets.contains(&holder) {
                targets.push(holder);
            }
        }
        if targets.is_empty() {
            return Err(TagFsError::Unreachable {
                node: map.local_id.clone(),
                reason: "no alive owner".to_string(),
            });
        }

        let mut not_found = false;
        let mut last_error = None;
        for target in targets {
            match call(target.clone()).await {
                Ok(value) => return Ok(value),
                Err(TagFsError::NotFound(_)) => not_found = true,
                Err(e) if e.is_retryable() => {
                    tracing::debug!("Read of {} from {} failed: {}", file_id, target.id, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(e) if !not_found => Err(e),
            _ => Err(TagFsError::NotFound(file_id.to_string())),
        }
    }
}
