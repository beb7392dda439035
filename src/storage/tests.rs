//! Storage Module Tests
//!
//! Validates the local storage mechanics of one node and its interaction with placement.
//!
//! ## Test Scopes
//! - **Tags & ids**: normalisation and validation rules.
//! - **LocalIndex**: primary/secondary consistency and tombstones.
//! - **Disk & recovery**: atomic layout and start-up reconciliation.
//! - **OpLedger**: at-most-once execution, replay window and origin eviction.
//! - **StorageNode**: versioned writes, failed commits, idempotency, ownership checks,
//!   replication and bucket adoption. Peers are faked; real HTTP is covered by the
//!   integration test.

#[cfg(test)]
mod tests {
    use crate::config::{MembershipConfig, PlacementConfig};
    use crate::error::{TagFsError, TagFsResult};
    use crate::membership::service::MembershipService;
    use crate::membership::types::{NodeId, NodeRecord};
    use crate::placement::Placement;
    use crate::placement::ring::{HashRing, bucket_point};
    use crate::placement::shard_map::Candidate;
    use crate::rpc::{NodeClient, RpcFuture};
    use crate::storage::disk::DiskStore;
    use crate::storage::index::LocalIndex;
    use crate::storage::ledger::OpLedger;
    use crate::storage::node::StorageNode;
    use crate::storage::protocol::{
        DeleteFileRequest, FileState, OpId, PutFileRequest, QueryLocalRequest, QueryLocalResponse,
        ReplicateRequest, ReplicateResponse, TagUpdateRequest,
    };
    use crate::storage::recovery::recover;
    use crate::storage::types::{
        BlobEnvelope, BucketDump, FileContent, FileSummary, IndexRecord, MutationOutcome, ReplicaOp,
        TagSet, Tombstone, digest_of, new_file_id, normalize_tag, normalize_tags, validate_file_id,
    };
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    // ============================================================
    // FAKE PEERS
    // ============================================================

    /// Records what the node sends to other nodes; serves canned bucket dumps.
    #[derive(Default)]
    struct FakePeers {
        replicated: Mutex<Vec<(NodeId, ReplicateRequest)>>,
        refuse_replicas: AtomicBool,
        dumps: Mutex<HashMap<u32, BucketDump>>,
    }

    fn down<T>(target: &Candidate) -> TagFsResult<T> {
        Err(TagFsError::Unreachable {
            node: target.id.clone(),
            reason: "fake".into(),
        })
    }

    impl NodeClient for FakePeers {
        fn put<'a>(&'a self, target: &'a Candidate, _: PutFileRequest) -> RpcFuture<'a, MutationOutcome> {
            Box::pin(async move { down(target) })
        }

        fn get<'a>(&'a self, target: &'a Candidate, _: &'a str) -> RpcFuture<'a, FileContent> {
            Box::pin(async move { down(target) })
        }

        fn stat<'a>(&'a self, target: &'a Candidate, _: &'a str) -> RpcFuture<'a, FileSummary> {
            Box::pin(async move { down(target) })
        }

        fn update_tags<'a>(
            &'a self,
            target: &'a Candidate,
            _: TagUpdateRequest,
        ) -> RpcFuture<'a, MutationOutcome> {
            Box::pin(async move { down(target) })
        }

        fn delete<'a>(&'a self, target: &'a Candidate, _: DeleteFileRequest) -> RpcFuture<'a, MutationOutcome> {
            Box::pin(async move { down(target) })
        }

        fn query<'a>(
            &'a self,
            target: &'a Candidate,
            _: QueryLocalRequest,
        ) -> RpcFuture<'a, QueryLocalResponse> {
            Box::pin(async move { down(target) })
        }

        fn replicate<'a>(
            &'a self,
            target: &'a Candidate,
            req: ReplicateRequest,
        ) -> RpcFuture<'a, ReplicateResponse> {
            Box::pin(async move {
                if self.refuse_replicas.load(Ordering::SeqCst) {
                    return down(target);
                }
                self.replicated.lock().push((target.id.clone(), req));
                Ok(ReplicateResponse { applied: true })
            })
        }

        fn dump_bucket<'a>(&'a self, target: &'a Candidate, bucket: u32) -> RpcFuture<'a, BucketDump> {
            Box::pin(async move {
                match self.dumps.lock().get(&bucket) {
                    Some(dump) => Ok(dump.clone()),
                    None => down(target),
                }
            })
        }
    }

    // ============================================================
    // HELPERS
    // ============================================================

    struct Harness {
        node: Arc<StorageNode>,
        membership: Arc<MembershipService>,
        placement: Arc<Placement>,
        peers: Arc<FakePeers>,
    }

    async fn open_node(dir: &Path) -> Harness {
        let membership = MembershipService::new(
            NodeId::new(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            vec![],
            1,
            MembershipConfig::default(),
        )
        .await
        .unwrap();
        let placement = Placement::new(membership.watch_view(), PlacementConfig::default());
        let peers = Arc::new(FakePeers::default());
        let node = StorageNode::open(dir, membership.clone(), placement.clone(), peers.clone())
            .await
            .unwrap();
        Harness {
            node,
            membership,
            placement,
            peers,
        }
    }

    /// Makes a second, alive node `b` known to the harness' membership.
    fn add_peer(h: &Harness, name: &str, configure: impl FnOnce(&mut NodeRecord)) -> NodeId {
        let mut record = NodeRecord::new(
            NodeId(name.to_string()),
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            1,
        );
        record.heartbeat_seq = 1;
        configure(&mut record);
        let id = record.id.clone();
        h.membership.heartbeat(record, vec![]);
        id
    }

    static SEQ: AtomicU64 = AtomicU64::new(1);

    fn op() -> OpId {
        OpId::new("test-client", SEQ.fetch_add(1, Ordering::Relaxed))
    }

    fn ask(t: &[&str]) -> QueryLocalRequest {
        QueryLocalRequest {
            op: op(),
            tags: t.iter().map(|t| t.to_string()).collect(),
            files: Vec::new(),
        }
    }

    fn tags(names: &[&str]) -> TagSet {
        names.iter().map(|t| t.to_string()).collect()
    }

    fn put_req(file_id: &str, t: &[&str], payload: &[u8]) -> PutFileRequest {
        PutFileRequest {
            op: op(),
            file_id: file_id.to_string(),
            tags: tags(t),
            payload: payload.to_vec(),
            expected_version: None,
        }
    }

    fn summary(id: &str, t: &[&str], version: u64) -> FileSummary {
        FileSummary {
            file_id: id.to_string(),
            tags: tags(t),
            version,
            size: 0,
            digest: digest_of(b""),
            created_at_ms: 1,
            updated_at_ms: 1,
        }
    }

    /// A fresh file id whose bucket satisfies `pred`.
    fn file_id_where(h: &Harness, pred: impl Fn(u32) -> bool) -> String {
        let map = h.placement.current();
        loop {
            let id = new_file_id();
            if pred(map.bucket_for_file(&id)) {
                return id;
            }
        }
    }

    // ============================================================
    // TAGS & IDS
    // ============================================================

    #[test]
    fn test_tags_are_lowercased_and_trimmed() {
        assert_eq!(normalize_tag("  Red ").unwrap(), "red");
        assert_eq!(
            normalize_tags(["B", "a", "b"]).unwrap(),
            tags(&["a", "b"]),
            "duplicates collapse after normalisation"
        );
    }

    #[test]
    fn test_invalid_tags_are_rejected() {
        for bad in ["", "   ", "two words", "a(b", "x,y", "abcdefghijklmnopqrstu"] {
            assert!(
                matches!(normalize_tag(bad), Err(TagFsError::InvalidTag { .. })),
                "{:?} should be rejected",
                bad
            );
        }
        assert!(normalize_tag("abcdefghijklmnopqrst").is_ok(), "20 chars is the limit");
    }

    #[test]
    fn test_file_ids_must_be_uuids() {
        assert!(validate_file_id(&new_file_id()).is_ok());
        assert!(matches!(
            validate_file_id("../../etc/passwd"),
            Err(TagFsError::InvalidFileId(_))
        ));
    }

    // ============================================================
    // LOCAL INDEX
    // ============================================================

    #[test]
    fn test_index_retag_moves_secondary_entries() {
        let mut index = LocalIndex::new();
        index.upsert(summary("f1", &["red", "small"], 1));
        index.upsert(summary("f2", &["red"], 1));
        assert_eq!(index.lookup("red").len(), 2);

        index.upsert(summary("f1", &["blue", "small"], 2));
        let red: Vec<String> = index.lookup("red").into_iter().map(|s| s.file_id).collect();
        assert_eq!(red, vec!["f2".to_string()]);
        assert_eq!(index.lookup("blue")[0].version, 2);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_index_remove_leaves_tombstone() {
        let mut index = LocalIndex::new();
        index.upsert(summary("f1", &["red"], 3));
        index.remove(
            "f1",
            Tombstone {
                version: 4,
                deleted_at_ms: 0,
            },
        );

        assert!(index.get("f1").is_none());
        assert!(index.lookup("red").is_empty());
        assert_eq!(index.latest_version("f1"), 4);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_index_detects_and_rebuilds_drifted_secondary() {
        let mut index = LocalIndex::new();
        index.upsert(summary("f1", &["red"], 1));
        index.corrupt_secondary("green", "f1");
        assert!(!index.is_consistent());

        index.rebuild_secondary();
        assert!(index.is_consistent());
        assert!(index.lookup("green").is_empty());
    }

    // ============================================================
    // DISK & RECOVERY
    // ============================================================

    fn blob(id: &str, t: &[&str], version: u64, payload: &[u8]) -> BlobEnvelope {
        BlobEnvelope {
            file_id: id.to_string(),
            version,
            tags: tags(t),
            created_at_ms: 10,
            updated_at_ms: 20,
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_disk_blob_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskStore::open(dir.path()).await.unwrap();
        let id = new_file_id();

        disk.write_blob(&blob(&id, &["red"], 1, b"hello")).await.unwrap();
        let back = disk.read_blob(&id).await.unwrap().unwrap();
        assert_eq!(back.payload, b"hello");
        assert_eq!(back.summary().digest, digest_of(b"hello"));

        assert!(disk.read_blob(&new_file_id()).await.unwrap().is_none());
        assert_eq!(disk.blob_ids().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_recovery_completes_records_from_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskStore::open(dir.path()).await.unwrap();
        let id = new_file_id();

        // Crash between blob write and record write.
        disk.write_blob(&blob(&id, &["red", "small"], 2, b"x")).await.unwrap();

        let (index, report) = recover(&disk).await.unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(index.lookup("small")[0].version, 2);
        assert_eq!(disk.read_record(&id).await.unwrap().unwrap().summary.version, 2);
    }

    #[tokio::test]
    async fn test_recovery_replaces_older_record() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskStore::open(dir.path()).await.unwrap();
        let id = new_file_id();

        let old = blob(&id, &["red"], 1, b"x");
        disk.write_record(&IndexRecord {
            summary: old.summary(),
            blob: DiskStore::blob_rel_path(&id),
        })
        .await
        .unwrap();
        disk.write_blob(&blob(&id, &["blue"], 2, b"x")).await.unwrap();

        let (index, report) = recover(&disk).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(index.lookup("red").is_empty());
        assert_eq!(index.lookup("blue").len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_drops_orphans_tombstoned_blobs_and_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskStore::open(dir.path()).await.unwrap();

        let orphan = new_file_id();
        disk.write_record(&IndexRecord {
            summary: blob(&orphan, &["red"], 1, b"x").summary(),
            blob: DiskStore::blob_rel_path(&orphan),
        })
        .await
        .unwrap();

        let deleted = new_file_id();
        disk.write_blob(&blob(&deleted, &["red"], 1, b"x")).await.unwrap();
        let mut tombstones = BTreeMap::new();
        tombstones.insert(
            deleted.clone(),
            Tombstone {
                version: 2,
                deleted_at_ms: 0,
            },
        );
        disk.save_tombstones(&tombstones).await.unwrap();

        std::fs::write(dir.path().join("blobs").join("junk.blob.tmp"), b"partial").unwrap();

        let (index, report) = recover(&disk).await.unwrap();
        assert_eq!(report.files, 0);
        assert_eq!(report.dropped_records, 1);
        assert_eq!(report.dropped_blobs, 1);
        assert_eq!(report.temp_files, 1);
        assert!(index.is_empty());
        assert_eq!(index.latest_version(&deleted), 2);
        assert!(disk.read_blob(&deleted).await.unwrap().is_none());
    }

    // ============================================================
    // OP LEDGER
    // ============================================================

    #[tokio::test]
    async fn test_ledger_runs_concurrent_duplicates_once() {
        let ledger: OpLedger<u64> = OpLedger::new(8, 8);
        let runs = AtomicU64::new(0);
        let counter = &runs;
        let execute = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok::<u64, TagFsError>(7)
        };
        let op = OpId::new("c", 1);

        let (a, b) = tokio::join!(ledger.run(&op, execute), ledger.run(&op, execute));
        assert_eq!((a.unwrap(), b.unwrap()), (7, 7));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ledger_forgets_failed_executions() {
        let ledger: OpLedger<u64> = OpLedger::new(8, 8);
        let op = OpId::new("c", 1);

        let failed = ledger
            .run(&op, || async { Err::<u64, _>(TagFsError::Cancelled) })
            .await;
        assert!(failed.is_err());
        let retried = ledger.run(&op, || async { Ok::<u64, TagFsError>(3) }).await;
        assert_eq!(retried.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_ledger_refuses_seqs_below_the_window() {
        let ledger: OpLedger<u64> = OpLedger::new(2, 8);
        for seq in 1..=3 {
            ledger
                .run(&OpId::new("c", seq), move || async move { Ok::<u64, TagFsError>(seq) })
                .await
                .unwrap();
        }

        match ledger.run(&OpId::new("c", 1), || async { Ok::<u64, TagFsError>(99) }).await {
            Err(TagFsError::ExpiredRequest { origin, seq }) => assert_eq!((origin.as_str(), seq), ("c", 1)),
            other => panic!("expected expired request, got {:?}", other),
        }
        let replay = ledger.run(&OpId::new("c", 3), || async { Ok::<u64, TagFsError>(99) }).await;
        assert_eq!(replay.unwrap(), 3, "still inside the window");
        let other = ledger.run(&OpId::new("d", 1), || async { Ok::<u64, TagFsError>(5) }).await;
        assert_eq!(other.unwrap(), 5, "windows are per origin");
    }

    #[tokio::test]
    async fn test_ledger_evicts_the_stalest_origin() {
        let ledger: OpLedger<u64> = OpLedger::new(4, 2);
        let value = |v: u64| move || async move { Ok::<u64, TagFsError>(v) };

        ledger.run(&OpId::new("a", 1), value(1)).await.unwrap();
        ledger.run(&OpId::new("b", 1), value(1)).await.unwrap();
        ledger.run(&OpId::new("a", 2), value(2)).await.unwrap();
        ledger.run(&OpId::new("c", 1), value(1)).await.unwrap();
        assert_eq!(ledger.origins(), 2);

        assert_eq!(ledger.run(&OpId::new("a", 1), value(99)).await.unwrap(), 1);
        assert_eq!(
            ledger.run(&OpId::new("b", 1), value(99)).await.unwrap(),
            99,
            "b was heard from least recently and got forgotten"
        );
    }

    #[tokio::test]
    async fn test_ledger_keeps_bulk_parts_apart() {
        let ledger: OpLedger<u64> = OpLedger::new(4, 4);
        let bulk = OpId::new("client:c1", 9);

        let first = ledger.run(&bulk.child("f1"), || async { Ok::<u64, TagFsError>(1) }).await;
        let second = ledger.run(&bulk.child("f2"), || async { Ok::<u64, TagFsError>(2) }).await;
        assert_eq!((first.unwrap(), second.unwrap()), (1, 2));
        assert_eq!(ledger.origins(), 1);
    }

    // ============================================================
    // STORAGE NODE: SINGLE NODE
    // ============================================================

    #[tokio::test]
    async fn test_put_get_roundtrip_with_digest() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();

        let out = h.node.put(put_req(&id, &["Red", "small"], b"blob1")).await.unwrap();
        assert_eq!(out.version, 1);

        let content = h.node.get(&id).await.unwrap();
        assert_eq!(content.payload, b"blob1");
        assert_eq!(content.summary.digest, digest_of(b"blob1"));
        assert_eq!(content.summary.size, 5);
        assert_eq!(content.summary.tags, tags(&["red", "small"]));
    }

    #[tokio::test]
    async fn test_put_announces_content_summary() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();

        h.node.put(put_req(&id, &["red"], b"x")).await.unwrap();

        let map = h.placement.current();
        let own = h.membership.local_record().ownership;
        assert!(own.file_buckets.contains(&map.bucket_for_file(&id)));
        assert!(own.tag_buckets.contains(&map.bucket_for_tag("red")));
        let resolved = h.placement.resolve_tag("red");
        assert!(resolved.candidates.iter().any(|c| &c.id == h.node.local_id()));
    }

    #[tokio::test]
    async fn test_add_tag_twice_equals_once() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();
        h.node.put(put_req(&id, &["red"], b"x")).await.unwrap();

        let first = h.node.add_tag(op(), &id, "blue").await.unwrap();
        let second = h.node.add_tag(op(), &id, "blue").await.unwrap();
        assert_eq!(first.version, 2);
        assert_eq!(second.version, 2);
        assert_eq!(h.node.stat(&id).await.unwrap().tags, tags(&["blue", "red"]));
    }

    #[tokio::test]
    async fn test_remove_tag_updates_index_and_blob() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();
        h.node.put(put_req(&id, &["red", "small"], b"x")).await.unwrap();

        let out = h.node.remove_tag(op(), &id, "small").await.unwrap();
        assert_eq!(out.version, 2);

        let local = h.node.query_local(&ask(&["small"])).unwrap();
        assert!(local.matches["small"].is_empty());
        let content = h.node.get(&id).await.unwrap();
        assert_eq!(content.summary.tags, tags(&["red"]));
        assert_eq!(content.payload, b"x", "payload untouched by retag");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();
        h.node.put(put_req(&id, &["red"], b"x")).await.unwrap();

        let del = |id: &str| DeleteFileRequest {
            op: op(),
            file_id: id.to_string(),
            expected_version: None,
        };
        let first = h.node.delete(del(&id)).await.unwrap();
        let again = h.node.delete(del(&id)).await.unwrap();
        assert_eq!(first.version, 2);
        assert_eq!(again.version, 2);

        assert!(matches!(h.node.get(&id).await, Err(TagFsError::NotFound(_))));
        assert!(h.node.query_local(&ask(&["red"])).unwrap().matches["red"].is_empty());
        assert!(matches!(
            h.node.delete(del(&new_file_id())).await,
            Err(TagFsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expected_version_mismatch_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();
        h.node.put(put_req(&id, &["red"], b"v1")).await.unwrap();

        let mut stale = put_req(&id, &["red"], b"v2");
        stale.expected_version = Some(5);
        match h.node.put(stale).await {
            Err(TagFsError::Conflict { expected, actual }) => {
                assert_eq!((expected, actual), (5, 1));
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let mut fresh = put_req(&id, &["red"], b"v2");
        fresh.expected_version = Some(1);
        assert_eq!(h.node.put(fresh).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_replayed_request_is_answered_without_reapplying() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();
        h.node.put(put_req(&id, &["red"], b"x")).await.unwrap();

        let req = TagUpdateRequest {
            op: op(),
            file_id: id.clone(),
            add: tags(&["blue"]),
            remove: BTreeSet::new(),
            expected_version: None,
        };
        let first = h.node.update_tags(req.clone()).await.unwrap();
        h.node.remove_tag(op(), &id, "blue").await.unwrap();
        let replay = h.node.update_tags(req).await.unwrap();

        assert_eq!(first, replay);
        assert_eq!(h.node.stat(&id).await.unwrap().version, 3, "replay did not re-add blue");
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_apply_once() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();
        let req = put_req(&id, &["red"], b"x");

        let (first, second) = tokio::join!(h.node.put(req.clone()), h.node.put(req));
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(h.node.stat(&id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_failed_record_write_leaves_previous_version_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();
        h.node.put(put_req(&id, &["red"], b"v1")).await.unwrap();

        // A directory in place of the record makes the record rename fail.
        let record = dir.path().join("index").join(format!("{}.json", id));
        std::fs::remove_file(&record).unwrap();
        std::fs::create_dir(&record).unwrap();

        assert!(h.node.add_tag(op(), &id, "blue").await.is_err());

        let content = h.node.get(&id).await.unwrap();
        assert_eq!(content.summary.version, 1);
        assert_eq!(content.summary.tags, tags(&["red"]));
        assert_eq!(h.node.stat(&id).await.unwrap().version, 1);
        assert!(h.node.query_local(&ask(&["blue"])).unwrap().matches["blue"].is_empty());
        assert_eq!(h.node.query_local(&ask(&["red"])).unwrap().matches["red"].len(), 1);
        let staged = std::fs::read_dir(dir.path().join("blobs"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(staged, 0, "staged blob is cleaned up");

        std::fs::remove_dir(&record).unwrap();
        drop(h);
        let h = open_node(dir.path()).await;
        assert_eq!(h.node.stat(&id).await.unwrap().tags, tags(&["red"]));
    }

    #[tokio::test]
    async fn test_failed_blob_rename_restores_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();
        h.node.put(put_req(&id, &["red"], b"v1")).await.unwrap();

        let blob_path = dir.path().join("blobs").join(format!("{}.blob", id));
        std::fs::remove_file(&blob_path).unwrap();
        std::fs::create_dir(&blob_path).unwrap();

        assert!(h.node.put(put_req(&id, &["blue"], b"v2")).await.is_err());
        assert_eq!(h.node.stat(&id).await.unwrap().version, 1);

        let disk = DiskStore::open(dir.path()).await.unwrap();
        let record = disk.read_record(&id).await.unwrap().unwrap();
        assert_eq!(record.summary.version, 1);
        assert_eq!(record.summary.tags, tags(&["red"]));
    }

    #[tokio::test]
    async fn test_query_local_reports_file_states() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let kept = new_file_id();
        let gone = new_file_id();
        h.node.put(put_req(&kept, &["red"], b"x")).await.unwrap();
        h.node.put(put_req(&gone, &["red"], b"y")).await.unwrap();
        h.node
            .delete(DeleteFileRequest {
                op: op(),
                file_id: gone.clone(),
                expected_version: None,
            })
            .await
            .unwrap();

        let resp = h
            .node
            .query_local(&QueryLocalRequest {
                op: op(),
                tags: vec!["blue".to_string()],
                files: vec![kept.clone(), gone.clone(), new_file_id()],
            })
            .unwrap();

        assert!(resp.matches["blue"].is_empty());
        assert_eq!(resp.files.len(), 2, "unknown ids are left out");
        assert!(matches!(&resp.files[&kept], FileState::Live(s) if s.version == 1));
        assert_eq!(resp.files[&gone], FileState::Deleted { version: 2 });
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_before_storage() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;

        assert!(matches!(
            h.node.put(put_req(&new_file_id(), &["bad tag"], b"x")).await,
            Err(TagFsError::InvalidTag { .. })
        ));
        assert!(matches!(
            h.node.put(put_req("not-a-uuid", &["red"], b"x")).await,
            Err(TagFsError::InvalidFileId(_))
        ));
        assert_eq!(h.node.file_count(), 0);
    }

    #[tokio::test]
    async fn test_replica_versions_are_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();
        let origin = NodeId("primary".into());

        let v2 = blob(&id, &["red"], 2, b"new").into_content();
        let v1 = blob(&id, &["old"], 1, b"old").into_content();

        let apply = |c: FileContent| ReplicateRequest {
            origin: origin.clone(),
            change: ReplicaOp::Upsert(c),
        };
        assert!(h.node.apply_replica(apply(v2)).await.unwrap());
        assert!(!h.node.apply_replica(apply(v1)).await.unwrap(), "older version ignored");
        assert_eq!(h.node.get(&id).await.unwrap().payload, b"new");
    }

    #[tokio::test]
    async fn test_tombstone_blocks_stale_replica() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let id = new_file_id();
        let origin = NodeId("primary".into());

        let delete = ReplicateRequest {
            origin: origin.clone(),
            change: ReplicaOp::Delete {
                file_id: id.clone(),
                version: 3,
            },
        };
        assert!(h.node.apply_replica(delete).await.unwrap());

        let stale = ReplicateRequest {
            origin,
            change: ReplicaOp::Upsert(blob(&id, &["red"], 2, b"zombie").into_content()),
        };
        assert!(!h.node.apply_replica(stale).await.unwrap());
        assert!(matches!(h.node.get(&id).await, Err(TagFsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_dump_bucket_lists_files_and_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;

        let kept = new_file_id();
        h.node.put(put_req(&kept, &["red"], b"x")).await.unwrap();
        let bucket = h.node.bucket_for_file(&kept);

        let gone = file_id_where(&h, |b| b == bucket);
        h.node.put(put_req(&gone, &["red"], b"y")).await.unwrap();
        h.node
            .delete(DeleteFileRequest {
                op: op(),
                file_id: gone.clone(),
                expected_version: None,
            })
            .await
            .unwrap();

        let dump = h.node.dump_bucket(bucket).await.unwrap();
        assert_eq!(dump.files.len(), 1);
        assert_eq!(dump.files[0].summary.file_id, kept);
        assert_eq!(dump.tombstones, vec![(gone, 2)]);
    }

    #[tokio::test]
    async fn test_reopened_node_recovers_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let id = new_file_id();
        {
            let h = open_node(dir.path()).await;
            h.node.put(put_req(&id, &["red", "small"], b"persisted")).await.unwrap();
        }

        let h = open_node(dir.path()).await;
        assert_eq!(h.node.get(&id).await.unwrap().payload, b"persisted");
        assert_eq!(h.node.query_local(&ask(&["small"])).unwrap().matches["small"].len(), 1);
        assert!(h.node.check_index());
    }

    // ============================================================
    // STORAGE NODE: WITH PEERS
    // ============================================================

    #[tokio::test]
    async fn test_write_for_foreign_bucket_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let b = add_peer(&h, "node-b", |_| {});

        let map = h.placement.current();
        let id = file_id_where(&h, |bucket| map.primary(bucket).as_ref() == Some(&b));
        match h.node.put(put_req(&id, &["red"], b"x")).await {
            Err(TagFsError::StaleWrite { bucket }) => assert_eq!(bucket, map.bucket_for_file(&id)),
            other => panic!("expected stale write, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_primary_replicates_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let b = add_peer(&h, "node-b", |_| {});
        let local = h.node.local_id().clone();

        let map = h.placement.current();
        let id = file_id_where(&h, |bucket| map.primary(bucket).as_ref() == Some(&local));
        h.node.put(put_req(&id, &["red"], b"x")).await.unwrap();
        h.node.add_tag(op(), &id, "blue").await.unwrap();

        let sent = h.peers.replicated.lock();
        assert_eq!(sent.len(), 2, "one replica per committed mutation");
        assert!(sent.iter().all(|(to, _)| to == &b));
        match &sent[1].1.change {
            ReplicaOp::Upsert(content) => assert_eq!(content.summary.version, 2),
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unacknowledged_replica_is_sent_again() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let b = add_peer(&h, "node-b", |_| {});
        let local = h.node.local_id().clone();

        let map = h.placement.current();
        let id = file_id_where(&h, |bucket| map.primary(bucket).as_ref() == Some(&local));
        h.peers.refuse_replicas.store(true, Ordering::SeqCst);
        h.node.put(put_req(&id, &["red"], b"x")).await.unwrap();
        h.node.add_tag(op(), &id, "blue").await.unwrap();

        assert!(h.peers.replicated.lock().is_empty());
        assert_eq!(h.node.lagging_replicas(), 1, "newest change per file is kept");

        h.peers.refuse_replicas.store(false, Ordering::SeqCst);
        h.node.resend_lagging().await;
        assert_eq!(h.node.lagging_replicas(), 0);

        let sent = h.peers.replicated.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b);
        assert_eq!(&sent[0].1.origin, &local);
        match &sent[0].1.change {
            ReplicaOp::Upsert(content) => assert_eq!(content.summary.version, 2),
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_owner_adopts_bucket_from_previous_holder() {
        let dir = tempfile::tempdir().unwrap();
        let h = open_node(dir.path()).await;
        let local = h.node.local_id().clone();

        // Pick a bucket the local node will be primary of once b joins.
        let solo_map = h.placement.current();
        let peer = NodeId("node-b".into());
        let ring = HashRing::new([&local, &peer], PlacementConfig::default().virtual_nodes);
        let id = loop {
            let id = new_file_id();
            let bucket = solo_map.bucket_for_file(&id);
            if ring.successors(bucket_point(bucket), 1)[0] == local {
                break id;
            }
        };
        let bucket = solo_map.bucket_for_file(&id);

        h.peers.dumps.lock().insert(
            bucket,
            BucketDump {
                bucket,
                files: vec![blob(&id, &["red"], 4, b"moved").into_content()],
                tombstones: vec![],
            },
        );
        add_peer(&h, &peer.0, |r| {
            r.ownership.epoch = 1;
            r.ownership.file_buckets.insert(bucket);
        });

        let content = h.node.get(&id).await.unwrap();
        assert_eq!(content.payload, b"moved");
        assert_eq!(content.summary.version, 4);

        let own = h.membership.local_record().ownership;
        assert!(own.primary_claims.contains(&bucket), "primary claims what it adopted");
        assert!(own.file_buckets.contains(&bucket));
    }
}
