//! Memory of executed operations, keyed by [`OpId`].
//!
//! Each origin keeps a window of its most recent sequence numbers. A
//! sequence number that falls below the window is refused with
//! [`TagFsError::ExpiredRequest`] instead of being executed a second time.
//! Once too many origins are tracked, the one heard from least recently is
//! forgotten.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::OnceCell;

use super::protocol::OpId;
use crate::error::{TagFsError, TagFsResult};

/// Sequence numbers remembered per origin.
pub const DEFAULT_WINDOW: usize = 1024;
pub const DEFAULT_MAX_ORIGINS: usize = 4096;

/// Result of one execution, shared by every duplicate of the op.
pub type Slot<V> = Arc<OnceCell<V>>;

struct Window<V> {
    /// seq -> part -> slot. Parts split one bulk request into per-file ops.
    by_seq: BTreeMap<u64, HashMap<Option<String>, Slot<V>>>,
    /// Lowest sequence number still answerable.
    floor: u64,
    touched: u64,
}

impl<V> Window<V> {
    fn new() -> Self {
        Self {
            by_seq: BTreeMap::new(),
            floor: 0,
            touched: 0,
        }
    }
}

pub struct OpLedger<V> {
    origins: DashMap<String, Arc<Mutex<Window<V>>>>,
    window: usize,
    max_origins: usize,
    clock: AtomicU64,
}

impl<V: Clone> OpLedger<V> {
    pub fn new(window: usize, max_origins: usize) -> Self {
        Self {
            origins: DashMap::new(),
            window: window.max(1),
            max_origins: max_origins.max(1),
            clock: AtomicU64::new(0),
        }
    }

    /// Runs `execute` at most once per op. Concurrent duplicates wait for
    /// the first execution and get its result. A failed execution leaves
    /// nothing behind, so the next duplicate runs again.
    pub async fn run<F, Fut>(&self, op: &OpId, execute: F) -> TagFsResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TagFsResult<V>>,
    {
        let slot = self.slot(op)?;
        slot.get_or_try_init(execute).await.cloned()
    }

    /// The shared cell for `op`, for callers that need their own error type.
    pub fn slot(&self, op: &OpId) -> TagFsResult<Slot<V>> {
        let now = self.clock.fetch_add(1, Ordering::Relaxed);
        let window = self.window_of(&op.origin);
        let mut window = window.lock();
        window.touched = now;

        if op.seq < window.floor {
            return Err(TagFsError::ExpiredRequest {
                origin: op.origin.clone(),
                seq: op.seq,
            });
        }

        let slot = window
            .by_seq
            .entry(op.seq)
            .or_default()
            .entry(op.part.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        while window.by_seq.len() > self.window {
            if let Some((oldest, _)) = window.by_seq.pop_first() {
                window.floor = oldest + 1;
            }
        }
        Ok(slot)
    }

    pub fn origins(&self) -> usize {
        self.origins.len()
    }

    fn window_of(&self, origin: &str) -> Arc<Mutex<Window<V>>> {
        if let Some(window) = self.origins.get(origin) {
            return window.value().clone();
        }
        self.make_room();
        self.origins
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Window::new())))
            .value()
            .clone()
    }

    fn make_room(&self) {
        while self.origins.len() >= self.max_origins {
            let stalest = self
                .origins
                .iter()
                .min_by_key(|entry| entry.value().lock().touched)
                .map(|entry| entry.key().clone());
            match stalest {
                Some(origin) => {
                    self.origins.remove(&origin);
                    tracing::debug!("Forgot operations of origin {}", origin);
                }
                None => break,
            }
        }
    }
}
