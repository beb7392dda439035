use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::expr::TagExpr;
use super::{QueryOutcome, QueryRouter};
use crate::error::{TagFsError, TagFsResult};
use crate::membership::types::NodeId;
use crate::placement::shard_map::{Candidate, ShardMap};
use crate::storage::protocol::{FileState, OpId, QueryLocalRequest, QueryLocalResponse};
use crate::storage::types::FileSummary;

/// One node and what it is asked about.
#[derive(Debug, Clone)]
struct Slot {
    target: Candidate,
    tags: Vec<String>,
    files: Vec<String>,
}

impl Slot {
    fn request(&self, op: &OpId) -> QueryLocalRequest {
        QueryLocalRequest {
            op: op.clone(),
            tags: self.tags.clone(),
            files: self.files.clone(),
        }
    }
}

type Arena = Vec<Option<TagFsResult<QueryLocalResponse>>>;

impl QueryRouter {
    /// Evaluates `expr` across the cluster.
    ///
    /// Holders that fail or miss the query deadline are listed in
    /// [`QueryOutcome::unreachable`]; whatever they may have returned late is
    /// discarded. If a tag every match must carry came back empty while some
    /// of its holders were unreachable, the answer would be silently wrong, so
    /// the query fails with `PartialUnavailable` instead.
    ///
    /// Holders only report files that match, so a replica that dropped a tag
    /// in a newer version says nothing in the first round. A second round asks
    /// the owners of every candidate file for its current version before the
    /// expression is evaluated.
    pub async fn query(&self, expr: &TagExpr, cancel: &CancellationToken) -> TagFsResult<QueryOutcome> {
        if cancel.is_cancelled() {
            return Err(TagFsError::Cancelled);
        }

        let deadline = Instant::now() + self.config.query_timeout();
        let op = self.next_query_op();
        let map = self.placement.current();
        let tags = expr.tags();

        // --- Plan: group tags by holder ---
        let mut slots: Vec<Slot> = Vec::new();
        let mut slot_of: HashMap<NodeId, usize> = HashMap::new();
        let mut missing_by_tag: HashMap<String, BTreeSet<NodeId>> = HashMap::new();

        for tag in &tags {
            let resolution = map.resolve_tag(tag);
            missing_by_tag
                .entry(tag.clone())
                .or_default()
                .extend(resolution.unavailable);

            for candidate in resolution.candidates {
                let idx = *slot_of.entry(candidate.id.clone()).or_insert_with(|| {
                    slots.push(Slot {
                        target: candidate.clone(),
                        tags: Vec::new(),
                        files: Vec::new(),
                    });
                    slots.len() - 1
                });
                slots[idx].tags.push(tag.clone());
            }
        }

        tracing::debug!(
            "Query {} '{}': {} tag(s) over {} node(s)",
            op,
            expr,
            tags.len(),
            slots.len()
        );

        // --- Fan out ---
        let arena = self.fan_out(&op, &slots, deadline, cancel).await?;

        // --- Merge ---
        let mut unreachable: BTreeSet<NodeId> = missing_by_tag.values().flatten().cloned().collect();
        let mut failed: BTreeSet<NodeId> = BTreeSet::new();
        let mut latest: HashMap<String, FileState> = HashMap::new();
        // file -> nodes that reported it, with the version they hold
        let mut seen: HashMap<String, HashMap<NodeId, u64>> = HashMap::new();

        for (slot, result) in slots.iter().zip(arena) {
            let failure = match result {
                Some(Ok(response)) => {
                    for summary in response.matches.into_values().flatten() {
                        seen.entry(summary.file_id.clone())
                            .or_default()
                            .insert(slot.target.id.clone(), summary.version);
                        keep_newest(&mut latest, summary.file_id.clone(), FileState::Live(summary));
                    }
                    continue;
                }
                Some(Err(e)) => e.to_string(),
                None => "no answer before the query deadline".to_string(),
            };

            tracing::warn!("Sub-query {} to {} failed: {}", op, slot.target.id, failure);
            unreachable.insert(slot.target.id.clone());
            failed.insert(slot.target.id.clone());
            for tag in &slot.tags {
                missing_by_tag
                    .entry(tag.clone())
                    .or_default()
                    .insert(slot.target.id.clone());
            }
        }

        // --- Confirm candidate versions ---
        let confirm = plan_confirmation(&map, &latest, &seen, &failed);
        if !confirm.is_empty() {
            tracing::debug!(
                "Query {}: checking {} candidate file(s) on {} node(s)",
                op,
                latest.len(),
                confirm.len()
            );
            let arena = self.fan_out(&op, &confirm, deadline, cancel).await?;
            for (slot, result) in confirm.iter().zip(arena) {
                match result {
                    Some(Ok(response)) => {
                        for (file_id, state) in response.files {
                            keep_newest(&mut latest, file_id, state);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Confirmation {} on {} failed: {}", op, slot.target.id, e);
                        unreachable.insert(slot.target.id.clone());
                    }
                    None => {
                        tracing::warn!("Confirmation {} on {} missed the deadline", op, slot.target.id);
                        unreachable.insert(slot.target.id.clone());
                    }
                }
            }
        }

        let mut per_tag: HashMap<String, BTreeSet<String>> = HashMap::new();
        for state in latest.values() {
            let FileState::Live(summary) = state else {
                continue;
            };
            for tag in summary.tags.iter().filter(|t| tags.contains(*t)) {
                per_tag
                    .entry(tag.clone())
                    .or_default()
                    .insert(summary.file_id.clone());
            }
        }

        let blocking: BTreeSet<NodeId> = expr
            .required_tags()
            .iter()
            .filter(|tag| per_tag.get(*tag).is_none_or(|ids| ids.is_empty()))
            .filter_map(|tag| missing_by_tag.get(tag))
            .flatten()
            .cloned()
            .collect();
        if !blocking.is_empty() {
            return Err(TagFsError::PartialUnavailable {
                unreachable: blocking.into_iter().collect(),
            });
        }

        let files: Vec<FileSummary> = expr
            .evaluate(&per_tag)
            .into_iter()
            .filter_map(|id| match latest.remove(&id) {
                Some(FileState::Live(summary)) => Some(summary),
                _ => None,
            })
            .collect();

        let partial = !unreachable.is_empty();
        Ok(QueryOutcome {
            files,
            unreachable: unreachable.into_iter().collect(),
            partial,
        })
    }

    /// Runs one sub-query per slot, at most `max_fanout` at a time, until all
    /// answer or `deadline` passes. `None` marks a slot that did not answer
    /// in time.
    async fn fan_out(
        &self,
        op: &OpId,
        slots: &[Slot],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> TagFsResult<Arena> {
        let mut arena: Arena = (0..slots.len()).map(|_| None).collect();
        let max_in_flight = self.config.max_fanout.max(1);
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        let mut in_flight = JoinSet::new();
        let mut next = 0;

        loop {
            while in_flight.len() < max_in_flight && next < slots.len() {
                let client = self.client.clone();
                let slot = &slots[next];
                let target = slot.target.clone();
                let req = slot.request(op);
                let idx = next;
                in_flight.spawn(async move { (idx, client.query(&target, req).await) });
                next += 1;
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    in_flight.abort_all();
                    return Err(TagFsError::Cancelled);
                }
                _ = &mut expired => {
                    tracing::warn!(
                        "Query {} deadline of {:?} passed with {} sub-queries outstanding",
                        op,
                        self.config.query_timeout(),
                        in_flight.len() + (slots.len() - next)
                    );
                    in_flight.abort_all();
                    break;
                }
                joined = in_flight.join_next() => match joined {
                    Some(Ok((idx, result))) => arena[idx] = Some(result),
                    Some(Err(e)) => tracing::error!("Sub-query task failed: {}", e),
                    None => break,
                },
            }
        }

        Ok(arena)
    }
}

/// Nodes to ask about candidate files: every live owner or holder of the
/// file's bucket that did not already report the winning version. Nodes that
/// failed the first round are already reported unreachable and are skipped.
fn plan_confirmation(
    map: &ShardMap,
    latest: &HashMap<String, FileState>,
    seen: &HashMap<String, HashMap<NodeId, u64>>,
    failed: &BTreeSet<NodeId>,
) -> Vec<Slot> {
    let mut by_node: BTreeMap<NodeId, Slot> = BTreeMap::new();

    for (file_id, state) in latest {
        let version = state.version();
        let bucket = map.bucket_for_file(file_id);
        let mut targets = map.owners(bucket);
        for holder in map.file_bucket_holders(bucket, None) {
            if !targets.contains(&holder) {
                targets.push(holder);
            }
        }

        for target in targets {
            let confirmed = seen
                .get(file_id)
                .and_then(|nodes| nodes.get(&target.id))
                .is_some_and(|v| *v == version);
            if confirmed || failed.contains(&target.id) {
                continue;
            }
            by_node
                .entry(target.id.clone())
                .or_insert_with(|| Slot {
                    target,
                    tags: Vec::new(),
                    files: Vec::new(),
                })
                .files
                .push(file_id.clone());
        }
    }

    by_node.into_values().collect()
}

/// Keeps the state with the highest version.
fn keep_newest(latest: &mut HashMap<String, FileState>, file_id: String, state: FileState) {
    match latest.get(&file_id) {
        Some(existing) if existing.version() >= state.version() => {}
        _ => {
            latest.insert(file_id, state);
        }
    }
}
