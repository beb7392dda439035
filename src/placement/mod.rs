//! Shard Placement & Tag Index Routing
//!
//! Maps tags and file ids to hash buckets and buckets to nodes.
//!
//! ## Core Concepts
//! - **Buckets**: the tag space and the file-id space are each split into a fixed number of
//!   SHA-256 buckets (shards).
//! - **Ring**: buckets are placed on a consistent-hash ring of ALIVE nodes; a bucket's owners
//!   are its next `R` distinct nodes clockwise, so a membership change moves few buckets.
//! - **Claims**: a node that adopted a bucket after a rebalance claims it as primary; competing
//!   claims resolve by epoch, then by smaller node id.
//! - **Content summaries**: tag entries live next to their files, so a tag resolves to the
//!   nodes whose advertised `tag_buckets` cover the tag's bucket.
//!
//! [`Placement`] caches the `ShardMap` for the latest membership snapshot and rebuilds it on
//! membership events. Holders purged from the view are remembered until a live node
//! advertises all of their file buckets, so their tags keep resolving as unavailable
//! rather than silently empty.

pub mod ring;
pub mod shard_map;


use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::PlacementConfig;
use crate::membership::events::MembershipEvents;
use crate::membership::types::{MembershipEvent, MembershipView, NodeId, NodeRecord, NodeState};
use shard_map::{ShardMap, TagResolution};

pub struct Placement {
    config: PlacementConfig,
    view: watch::Receiver<Arc<MembershipView>>,
    current: RwLock<Arc<ShardMap>>,
    departed: Mutex<HashMap<NodeId, NodeRecord>>,
}

impl Placement {
    pub fn new(view: watch::Receiver<Arc<MembershipView>>, config: PlacementConfig) -> Arc<Self> {
        let initial = ShardMap::build(&view.borrow(), &config);
        Arc::new(Self {
            config,
            view,
            current: RwLock::new(Arc::new(initial)),
            departed: Mutex::new(HashMap::new()),
        })
    }

    /// The shard map for the newest membership snapshot.
    ///
    /// Rebuilds lazily when the snapshot moved on since the last build, so
    /// callers never route on a map older than the view they could read.
    pub fn current(&self) -> Arc<ShardMap> {
        let view = self.view.borrow().clone();
        {
            let current = self.current.read();
            if current.view_version >= view.version {
                return current.clone();
            }
        }
        self.rebuild(&view)
    }

    fn rebuild(&self, view: &MembershipView) -> Arc<ShardMap> {
        let mut current = self.current.write();
        if current.view_version < view.version {
            let departed = self.track_departed(&current, view);
            *current = Arc::new(ShardMap::build(view, &self.config).with_departed(departed));
            tracing::debug!(
                "Rebuilt shard map at view version {} ({} alive nodes)",
                view.version,
                current.alive_count()
            );
        }
        current.clone()
    }

    /// Records of holders that left the view since `previous`, minus those
    /// whose file buckets a live node now advertises.
    fn track_departed(&self, previous: &ShardMap, view: &MembershipView) -> Vec<NodeRecord> {
        let present: HashSet<&NodeId> = view.members.iter().map(|r| &r.id).collect();
        let mut departed = self.departed.lock();
        departed.retain(|id, _| !present.contains(id));

        for record in previous.records() {
            if present.contains(&record.id)
                || record.id == view.local_id
                || record.ownership.tag_buckets.is_empty()
            {
                continue;
            }
            departed.entry(record.id.clone()).or_insert_with(|| {
                tracing::info!("Node {} left the view, its tags stay unavailable until adopted", record.id);
                let mut record = record.clone();
                record.state = NodeState::Dead;
                record
            });
        }

        let adopted: BTreeSet<u32> = view
            .alive()
            .flat_map(|r| r.ownership.file_buckets.iter().chain(&r.ownership.primary_claims))
            .copied()
            .collect();
        departed.retain(|id, record| {
            let covered = record.ownership.file_buckets.is_subset(&adopted);
            if covered {
                tracing::info!("Buckets of departed node {} are held again", id);
            }
            !covered
        });

        departed.values().cloned().collect()
    }

    pub fn on_membership_change(&self, event: &MembershipEvent) {
        match event {
            MembershipEvent::Resync(view) => {
                self.rebuild(view);
            }
            MembershipEvent::Died(id) => {
                tracing::info!("Node {} died, its buckets move to ring successors", id);
                self.current();
            }
            _ => {
                self.current();
            }
        }
    }

    pub fn resolve_tag(&self, tag: &str) -> TagResolution {
        self.current().resolve_tag(tag)
    }

    /// Keeps the cache warm by following membership events until cancelled.
    pub async fn run(self: Arc<Self>, mut events: MembershipEvents, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                e = events.next() => e,
            };
            match event {
                Some(event) => self.on_membership_change(&event),
                None => break,
            }
        }
    }
}
