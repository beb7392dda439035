//! Storage Node
//!
//! Holds a shard of file blobs plus the tag entries of those files.
//!
//! ## Core Concepts
//! - **Placement**: a file lives in the bucket of its id; the bucket's primary accepts
//!   writes and pushes them to the backups after the local commit.
//! - **Durability**: blobs embed their tags and version, so the primary index records and
//!   the in-memory secondary tag index can be rebuilt from blobs on start.
//! - **Versions**: every mutation bumps the file version; replicas apply last-writer-wins by
//!   version, and deletes leave tombstones so stale replicas cannot resurrect a file.
//! - **At most once**: mutations carry an op id; the [`ledger::OpLedger`] answers
//!   duplicates, concurrent or late, from the first execution.
//! - **Adoption**: a node that finds itself owner of a bucket it has not served yet pulls
//!   the bucket from the nodes advertising it, then claims it as primary.

pub mod disk;
pub mod handlers;
pub mod index;
pub mod ledger;
pub mod node;
pub mod protocol;
pub mod recovery;
pub mod types;

#[cfg(test)]
mod tests;
