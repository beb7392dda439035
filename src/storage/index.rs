//! In-memory tag index of one storage node.
//!
//! The primary map (`file_id -> FileSummary`) mirrors the on-disk index
//! records; the secondary map (`tag -> file ids`) is derived from it and can
//! always be rebuilt.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::types::{FileSummary, Tombstone};

#[derive(Debug, Default)]
pub struct LocalIndex {
    primary: HashMap<String, FileSummary>,
    by_tag: HashMap<String, BTreeSet<String>>,
    tombstones: BTreeMap<String, Tombstone>,
}

impl LocalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        files: impl IntoIterator<Item = FileSummary>,
        tombstones: BTreeMap<String, Tombstone>,
    ) -> Self {
        let mut index = Self {
            tombstones,
            ..Self::default()
        };
        for summary in files {
            index.upsert(summary);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    pub fn get(&self, file_id: &str) -> Option<&FileSummary> {
        self.primary.get(file_id)
    }

    pub fn tombstone(&self, file_id: &str) -> Option<Tombstone> {
        self.tombstones.get(file_id).copied()
    }

    pub fn tombstones(&self) -> &BTreeMap<String, Tombstone> {
        &self.tombstones
    }

    /// Highest version this node has seen for the id, live or deleted.
    pub fn latest_version(&self, file_id: &str) -> u64 {
        let live = self.primary.get(file_id).map(|s| s.version).unwrap_or(0);
        let dead = self.tombstones.get(file_id).map(|t| t.version).unwrap_or(0);
        live.max(dead)
    }

    pub fn upsert(&mut self, summary: FileSummary) {
        let file_id = summary.file_id.clone();
        if let Some(old) = self.primary.get(&file_id) {
            let stale: Vec<String> = old.tags.difference(&summary.tags).cloned().collect();
            for tag in stale {
                self.unlink(&tag, &file_id);
            }
        }
        for tag in &summary.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(file_id.clone());
        }
        self.tombstones.remove(&file_id);
        self.primary.insert(file_id, summary);
    }

    /// Drops the file and every tag entry pointing at it, leaving a tombstone.
    pub fn remove(&mut self, file_id: &str, tombstone: Tombstone) -> Option<FileSummary> {
        let removed = self.primary.remove(file_id);
        if let Some(old) = &removed {
            for tag in &old.tags {
                self.unlink(tag, file_id);
            }
        }
        self.tombstones.insert(file_id.to_string(), tombstone);
        removed
    }

    /// Drops a file without leaving a tombstone; used when handing a bucket
    /// off to its new owners.
    pub fn forget(&mut self, file_id: &str) -> Option<FileSummary> {
        let removed = self.primary.remove(file_id);
        if let Some(old) = &removed {
            for tag in &old.tags {
                self.unlink(tag, file_id);
            }
        }
        self.tombstones.remove(file_id);
        removed
    }

    fn unlink(&mut self, tag: &str, file_id: &str) {
        if let Some(ids) = self.by_tag.get_mut(tag) {
            ids.remove(file_id);
            if ids.is_empty() {
                self.by_tag.remove(tag);
            }
        }
    }

    pub fn lookup(&self, tag: &str) -> Vec<FileSummary> {
        self.by_tag
            .get(tag)
            .map(|ids| ids.iter().filter_map(|id| self.primary.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn files(&self) -> impl Iterator<Item = &FileSummary> {
        self.primary.values()
    }

    /// `(file_buckets, tag_buckets)` this node holds data for.
    pub fn content_summary(
        &self,
        file_bucket: impl Fn(&str) -> u32,
        tag_bucket: impl Fn(&str) -> u32,
    ) -> (BTreeSet<u32>, BTreeSet<u32>) {
        let files = self.primary.keys().map(|id| file_bucket(id)).collect();
        let tags = self.by_tag.keys().map(|t| tag_bucket(t)).collect();
        (files, tags)
    }

    /// True when the secondary map is exactly what the primary implies.
    pub fn is_consistent(&self) -> bool {
        let expected = Self::derive_secondary(&self.primary);
        expected == self.by_tag
    }

    pub fn rebuild_secondary(&mut self) {
        self.by_tag = Self::derive_secondary(&self.primary);
    }

    fn derive_secondary(primary: &HashMap<String, FileSummary>) -> HashMap<String, BTreeSet<String>> {
        let mut by_tag: HashMap<String, BTreeSet<String>> = HashMap::new();
        for summary in primary.values() {
            for tag in &summary.tags {
                by_tag
                    .entry(tag.clone())
                    .or_default()
                    .insert(summary.file_id.clone());
            }
        }
        by_tag
    }

    #[cfg(test)]
    pub(crate) fn corrupt_secondary(&mut self, tag: &str, file_id: &str) {
        self.by_tag
            .entry(tag.to_string())
            .or_default()
            .insert(file_id.to_string());
    }
}
