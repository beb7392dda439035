//! The membership table and its single update path.
//!
//! Everything that mutates NodeRecords goes through [`MembershipTable`]; the
//! service only adds sockets, timers and locking around it. Conflicts between
//! reports are settled by the comparison functions below, never by
//! coordination between nodes.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::types::{MembershipEvent, MembershipView, NodeId, NodeRecord, NodeState, ShardOwnership};
use crate::config::MembershipConfig;

/// Every this many heartbeats one DEAD member is gossiped to as well.
pub const REVIVAL_EVERY: u64 = 5;

/// Orders two reports about the same node. The fresher one compares greater.
pub fn compare_records(a: &NodeRecord, b: &NodeRecord) -> Ordering {
    (a.incarnation, a.heartbeat_seq).cmp(&(b.incarnation, b.heartbeat_seq))
}

/// Orders two competing claims on the same shard. The winning claim compares
/// greater: higher epoch first, then the lexicographically smaller node id.
pub fn compare_claims(a: (&NodeId, u64), b: (&NodeId, u64)) -> Ordering {
    a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0))
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub suspect_timeout: Duration,
    pub dead_timeout: Duration,
    pub purge_grace: Duration,
}

impl From<&MembershipConfig> for Timing {
    fn from(cfg: &MembershipConfig) -> Self {
        Self {
            suspect_timeout: cfg.suspect_timeout(),
            dead_timeout: cfg.dead_timeout(),
            purge_grace: cfg.purge_grace(),
        }
    }
}

pub struct MembershipTable {
    local: NodeRecord,
    members: HashMap<NodeId, NodeRecord>,
    /// Last (incarnation, seq) of purged nodes so a lagging peer cannot
    /// reintroduce them with the same record.
    purged: HashMap<NodeId, (u64, u64, Instant)>,
    timing: Timing,
    version: u64,
    pending_refute: bool,
}

impl MembershipTable {
    pub fn new(local: NodeRecord, timing: Timing) -> Self {
        Self {
            local,
            members: HashMap::new(),
            purged: HashMap::new(),
            timing,
            version: 1,
            pending_refute: false,
        }
    }

    pub fn local(&self) -> &NodeRecord {
        &self.local
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        if id == &self.local.id {
            return Some(&self.local);
        }
        self.members.get(id)
    }

    /// Starts a new gossip round for the local node.
    pub fn bump_heartbeat(&mut self, now_ms: u64) -> NodeRecord {
        self.local.heartbeat_seq += 1;
        self.local.timestamp_ms = now_ms;
        self.local.clone()
    }

    /// Replaces the local ownership declaration. Returns the event when it
    /// actually changed.
    pub fn set_local_ownership(&mut self, mut ownership: ShardOwnership) -> Option<MembershipEvent> {
        ownership.epoch = self.local.ownership.epoch;
        if ownership == self.local.ownership {
            return None;
        }
        ownership.epoch += 1;
        self.local.ownership = ownership;
        self.version += 1;
        Some(MembershipEvent::OwnershipChanged {
            node: self.local.id.clone(),
            epoch: self.local.ownership.epoch,
        })
    }

    /// Returns the new incarnation when the local node must announce that it
    /// is alive after hearing it was suspected.
    pub fn take_refute(&mut self) -> Option<u64> {
        if self.pending_refute {
            self.pending_refute = false;
            Some(self.local.incarnation)
        } else {
            None
        }
    }

    /// Merges one report about any node, first or second hand.
    pub fn merge(&mut self, mut incoming: NodeRecord, now: Instant) -> Vec<MembershipEvent> {
        if incoming.id == self.local.id {
            self.merge_about_self(&incoming);
            return Vec::new();
        }

        let mut events = Vec::new();

        if let Some((inc, seq, _)) = self.purged.get(&incoming.id) {
            if (incoming.incarnation, incoming.heartbeat_seq) <= (*inc, *seq) {
                return events;
            }
            self.purged.remove(&incoming.id);
        }

        match self.members.get_mut(&incoming.id) {
            None => {
                if incoming.state == NodeState::Dead {
                    return events;
                }
                incoming.state = NodeState::Alive;
                incoming.last_heard = Some(now);
                incoming.state_changed = Some(now);
                tracing::info!(
                    "Discovered new member {} gossip={} http={}",
                    incoming.id,
                    incoming.gossip_addr,
                    incoming.http_addr
                );
                events.push(MembershipEvent::Joined(incoming.clone()));
                self.members.insert(incoming.id.clone(), incoming);
            }
            Some(existing) => {
                if existing.state == NodeState::Dead {
                    if incoming.incarnation > existing.incarnation {
                        tracing::info!(
                            "Member {} rejoined with incarnation {} (was {})",
                            incoming.id,
                            incoming.incarnation,
                            existing.incarnation
                        );
                        incoming.state = NodeState::Alive;
                        incoming.last_heard = Some(now);
                        incoming.state_changed = Some(now);
                        events.push(MembershipEvent::Joined(incoming.clone()));
                        *existing = incoming;
                    }
                } else {
                    if compare_records(&incoming, existing) == Ordering::Greater {
                        existing.gossip_addr = incoming.gossip_addr;
                        existing.http_addr = incoming.http_addr;
                        existing.incarnation = incoming.incarnation;
                        existing.heartbeat_seq = incoming.heartbeat_seq;
                        existing.timestamp_ms = incoming.timestamp_ms;
                        existing.last_heard = Some(now);

                        if existing.state == NodeState::Suspect {
                            tracing::info!("Member {} recovered from suspicion", existing.id);
                            existing.state = NodeState::Alive;
                            existing.state_changed = Some(now);
                            events.push(MembershipEvent::Recovered(existing.id.clone()));
                        }
                    }

                    if incoming.ownership.epoch > existing.ownership.epoch {
                        tracing::debug!(
                            "Member {} ownership epoch {} -> {}",
                            existing.id,
                            existing.ownership.epoch,
                            incoming.ownership.epoch
                        );
                        existing.ownership = incoming.ownership;
                        events.push(MembershipEvent::OwnershipChanged {
                            node: existing.id.clone(),
                            epoch: existing.ownership.epoch,
                        });
                    }
                }
            }
        }

        if !events.is_empty() {
            self.version += 1;
        }
        events
    }

    fn merge_about_self(&mut self, incoming: &NodeRecord) {
        if incoming.state != NodeState::Alive && incoming.incarnation >= self.local.incarnation {
            self.refute(incoming.incarnation);
        }
    }

    fn refute(&mut self, heard_incarnation: u64) {
        self.local.incarnation = heard_incarnation.max(self.local.incarnation) + 1;
        self.pending_refute = true;
        self.version += 1;
        tracing::info!(
            "Refuting suspicion about local node, incarnation now {}",
            self.local.incarnation
        );
    }

    /// A peer claims `node_id` is suspect. Only the subject acts on it, by
    /// refuting; everyone else trusts its own failure detector.
    pub fn apply_suspect(&mut self, node_id: &NodeId, incarnation: u64) -> Vec<MembershipEvent> {
        if node_id == &self.local.id && incarnation >= self.local.incarnation {
            self.refute(incarnation);
        }
        Vec::new()
    }

    pub fn apply_alive(&mut self, node_id: &NodeId, incarnation: u64, now: Instant) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        let Some(existing) = self.members.get_mut(node_id) else {
            tracing::debug!("Alive message for unknown node {}", node_id);
            return events;
        };

        let fresher = incarnation > existing.incarnation;
        let refutes = incarnation == existing.incarnation && existing.state == NodeState::Suspect;
        if !(fresher || refutes) {
            return events;
        }

        let was = existing.state;
        existing.incarnation = incarnation;
        existing.state = NodeState::Alive;
        existing.last_heard = Some(now);
        existing.state_changed = Some(now);
        match was {
            NodeState::Dead => events.push(MembershipEvent::Joined(existing.clone())),
            NodeState::Suspect => events.push(MembershipEvent::Recovered(node_id.clone())),
            NodeState::Alive => {}
        }
        self.version += 1;
        events
    }

    pub fn apply_leave(&mut self, node_id: &NodeId, incarnation: u64, now: Instant) -> Vec<MembershipEvent> {
        let Some(existing) = self.members.get_mut(node_id) else {
            return Vec::new();
        };
        if incarnation < existing.incarnation || existing.state == NodeState::Dead {
            return Vec::new();
        }
        tracing::info!("Member {} left the cluster", node_id);
        existing.state = NodeState::Dead;
        existing.state_changed = Some(now);
        self.version += 1;
        vec![MembershipEvent::Died(node_id.clone())]
    }

    /// Failure detection pass: ALIVE -> SUSPECT -> DEAD -> purged.
    pub fn tick(&mut self, now: Instant) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        let mut to_purge = Vec::new();

        for member in self.members.values_mut() {
            let last_heard = *member.last_heard.get_or_insert(now);
            let elapsed = now.saturating_duration_since(last_heard);

            match member.state {
                NodeState::Alive => {
                    if elapsed > self.timing.suspect_timeout {
                        tracing::warn!("Node {} suspected (no contact for {:?})", member.id, elapsed);
                        member.state = NodeState::Suspect;
                        member.state_changed = Some(now);
                        events.push(MembershipEvent::Suspected(member.id.clone()));
                    }
                }
                NodeState::Suspect => {
                    if elapsed > self.timing.dead_timeout {
                        tracing::warn!("Node {} declared DEAD (no contact for {:?})", member.id, elapsed);
                        member.state = NodeState::Dead;
                        member.state_changed = Some(now);
                        events.push(MembershipEvent::Died(member.id.clone()));
                    }
                }
                NodeState::Dead => {
                    let since = now.saturating_duration_since(member.state_changed.unwrap_or(now));
                    if since > self.timing.purge_grace {
                        to_purge.push(member.id.clone());
                    }
                }
            }
        }

        for id in to_purge {
            if let Some(record) = self.members.remove(&id) {
                tracing::info!("Purged DEAD node {}", id);
                self.purged
                    .insert(id.clone(), (record.incarnation, record.heartbeat_seq, now));
                events.push(MembershipEvent::Purged(id));
            }
        }

        let purge_grace = self.timing.purge_grace;
        self.purged
            .retain(|_, (_, _, at)| now.saturating_duration_since(*at) <= purge_grace);

        if !events.is_empty() {
            self.version += 1;
        }
        events
    }

    /// Peers worth gossiping to: everyone not known to be DEAD.
    pub fn gossip_targets(&self) -> Vec<NodeRecord> {
        self.members
            .values()
            .filter(|m| m.state != NodeState::Dead)
            .cloned()
            .collect()
    }

    /// The DEAD member to gossip to on this heartbeat, if any. Fires on every
    /// [`REVIVAL_EVERY`]th heartbeat and walks the dead members in turn, so a
    /// healed partition is noticed without waiting for seeds.
    pub fn revival_target(&self) -> Option<NodeRecord> {
        let seq = self.local.heartbeat_seq;
        if seq == 0 || seq % REVIVAL_EVERY != 0 {
            return None;
        }
        let mut dead: Vec<&NodeRecord> = self
            .members
            .values()
            .filter(|m| m.state == NodeState::Dead)
            .collect();
        if dead.is_empty() {
            return None;
        }
        dead.sort_by(|a, b| a.id.cmp(&b.id));
        let turn = (seq / REVIVAL_EVERY) as usize % dead.len();
        Some(dead[turn].clone())
    }

    /// Records relayed in heartbeats and acks.
    pub fn digest(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self.members.values().cloned().collect();
        records.push(self.local.clone());
        records
    }

    pub fn view(&self) -> MembershipView {
        let mut members: Vec<NodeRecord> = self.members.values().cloned().collect();
        members.push(self.local.clone());
        members.sort_by(|a, b| a.id.cmp(&b.id));
        MembershipView {
            local_id: self.local.id.clone(),
            version: self.version,
            members,
        }
    }
}
