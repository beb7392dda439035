//! Membership & Discovery Module
//!
//! Gossip-based membership (SWIM-flavoured) that gives every node a
//! bounded-staleness view of which peers are alive and which shards they
//! declare.
//!
//! ## Core Mechanisms
//! - **Heartbeats**: each node gossips its record, with a rising sequence number and its
//!   shard ownership, to a few random peers every interval. Records relayed by third
//!   parties carry liveness further.
//! - **Failure Detection**: ALIVE -> SUSPECT after `k` missed heartbeats, SUSPECT -> DEAD
//!   after a longer timeout, DEAD records purged after a grace period.
//! - **Incarnations**: a node refutes suspicion by bumping its incarnation; a higher
//!   incarnation is also the only way back from DEAD.
//! - **Snapshots & Events**: other components read immutable `MembershipView`s and
//!   subscribe to `MembershipEvent`s, they never touch the table directly.

pub mod events;
pub mod service;
pub mod table;
pub mod types;
