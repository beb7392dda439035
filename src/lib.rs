//! Tag-Addressed Distributed Filesystem
//!
//! This library crate defines the subsystems of a cluster node. It serves as
//! the foundation for the node binary (`main.rs`) and the integration tests.
//!
//! ## Architecture Modules
//! - **`membership`**: UDP gossip with failure detection. Tracks every node as ALIVE,
//!   SUSPECT or DEAD and publishes snapshots and change events.
//! - **`placement`**: consistent hashing of tag and file-id buckets onto live nodes with
//!   replication factor R, primary claims and tag resolution.
//! - **`storage`**: the local shard. Versioned blobs on disk, a primary index record per file,
//!   an in-memory tag index, replication to backups and lazy bucket adoption.
//! - **`router`**: tag expressions, concurrent fan-out over the holders of each tag, and
//!   routing of point requests to bucket primaries.
//! - **`gateway`**: the client HTTP API with idempotent retries.
//! - **`rpc`**: the node-to-node transport behind the `NodeClient` trait.
//! - **`node`**: start-up wiring and background tasks.

pub mod config;
pub mod error;
pub mod gateway;
pub mod membership;
pub mod node;
pub mod placement;
pub mod router;
pub mod rpc;
pub mod storage;
pub mod telemetry;
