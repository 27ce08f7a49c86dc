//! In-memory aggregate store.
//!
//! Mirrors the Redis semantics the engine relies on: sorted sets, integer
//! hashes kept in field insertion order, TTLs evaluated against a [`Clock`],
//! and removal of keys that become empty. Commands run one by one like a
//! Redis `EXEC`: an injected command failure skips only that command, and
//! the rest of the pipeline, before and after it, is still applied.

use chrono::{DateTime, Utc};
use pulse_core::environment::Clock;
use pulse_core::store::{
    AggregateStore, Pipeline, ScoreBound, ScoreUpdate, StoreError, StoreFuture, StoreOp,
    StoreReply,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Fault {
    /// The whole round trip fails before any command runs
    Transport(String),
    /// The command at `index` fails; the others stay applied
    Command { index: usize, reason: String },
}

#[derive(Debug, Default)]
struct State {
    sorted_sets: HashMap<String, HashMap<String, f64>>,
    hashes: HashMap<String, Vec<(String, i64)>>,
    deadlines: HashMap<String, DateTime<Utc>>,
    faults: VecDeque<Fault>,
    pipelines_executed: usize,
}

impl State {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.delete(&key);
        }
    }

    fn delete(&mut self, key: &str) {
        self.sorted_sets.remove(key);
        self.hashes.remove(key);
        self.deadlines.remove(key);
    }

    fn exists(&self, key: &str) -> bool {
        self.sorted_sets.contains_key(key) || self.hashes.contains_key(key)
    }

    fn drop_if_empty(&mut self, set: &str) {
        if self.sorted_sets.get(set).is_some_and(HashMap::is_empty) {
            self.delete(set);
        }
    }

    fn in_range(&self, set: &str, min: ScoreBound, max: ScoreBound) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .sorted_sets
            .get(set)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, score)| {
                        min.admits_from_below(**score) && max.admits_from_above(**score)
                    })
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }

    fn apply(&mut self, op: &StoreOp, now: DateTime<Utc>) -> StoreReply {
        match op {
            StoreOp::Upsert {
                set,
                member,
                score,
                mode,
            } => {
                let members = self.sorted_sets.entry(set.clone()).or_default();
                match members.get_mut(member) {
                    Some(existing) => {
                        if *mode == ScoreUpdate::Overwrite || *score > *existing {
                            *existing = *score;
                        }
                        StoreReply::Integer(0)
                    }
                    None => {
                        members.insert(member.clone(), *score);
                        StoreReply::Integer(1)
                    }
                }
            }
            StoreOp::IncrementField { hash, field, delta } => {
                let fields = self.hashes.entry(hash.clone()).or_default();
                let value = match fields.iter_mut().find(|(name, _)| name == field) {
                    Some((_, value)) => {
                        *value += delta;
                        *value
                    }
                    None => {
                        fields.push((field.clone(), *delta));
                        *delta
                    }
                };
                StoreReply::Integer(value)
            }
            StoreOp::Expire { key, ttl } => {
                if !self.exists(key) {
                    return StoreReply::Integer(0);
                }
                let ttl = chrono::Duration::from_std(*ttl)
                    .unwrap_or_else(|_| chrono::Duration::days(36_500));
                self.deadlines.insert(key.clone(), now + ttl);
                StoreReply::Integer(1)
            }
            StoreOp::RemoveRangeByScore { set, min, max } => {
                let doomed = self.in_range(set, *min, *max);
                if let Some(members) = self.sorted_sets.get_mut(set) {
                    for (member, _) in &doomed {
                        members.remove(member);
                    }
                }
                self.drop_if_empty(set);
                StoreReply::Integer(i64::try_from(doomed.len()).unwrap_or(i64::MAX))
            }
            StoreOp::Cardinality { set } => {
                let count = self.sorted_sets.get(set).map_or(0, HashMap::len);
                StoreReply::Integer(i64::try_from(count).unwrap_or(i64::MAX))
            }
            StoreOp::RangeByScore { set, min, max } => StoreReply::Members(
                self.in_range(set, *min, *max)
                    .into_iter()
                    .map(|(member, _)| member)
                    .collect(),
            ),
            StoreOp::CountByScore { set, min, max } => {
                let count = self.in_range(set, *min, *max).len();
                StoreReply::Integer(i64::try_from(count).unwrap_or(i64::MAX))
            }
            StoreOp::GetHash { hash } => StoreReply::Fields(
                self.hashes
                    .get(hash)
                    .map(|fields| {
                        fields
                            .iter()
                            .map(|(name, value)| (name.clone(), value.to_string()))
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
        }
    }
}

/// In-memory [`AggregateStore`] for tests.
///
/// Cloning shares state, so a test can keep a handle for inspection and
/// fault injection while the engine owns another.
#[derive(Clone)]
pub struct InMemoryAggregateStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryAggregateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAggregateStore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl InMemoryAggregateStore {
    /// Create an empty store whose TTLs follow `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    /// Make the next pipeline fail as a whole before any command runs.
    pub fn fail_next_round_trip(&self, reason: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .faults
            .push_back(Fault::Transport(reason.into()));
    }

    /// Make command `index` of the next pipeline fail. Every other command
    /// of that pipeline is still applied.
    pub fn fail_next_at_command(&self, index: usize, reason: impl Into<String>) {
        self.state.lock().unwrap().faults.push_back(Fault::Command {
            index,
            reason: reason.into(),
        });
    }

    /// Score of `member` in sorted set `set`.
    #[must_use]
    pub fn score(&self, set: &str, member: &str) -> Option<f64> {
        self.live_state().sorted_sets.get(set)?.get(member).copied()
    }

    /// Members of `set`, ascending by score.
    #[must_use]
    pub fn members(&self, set: &str) -> Vec<String> {
        self.live_state()
            .in_range(set, ScoreBound::NegInf, ScoreBound::PosInf)
            .into_iter()
            .map(|(member, _)| member)
            .collect()
    }

    /// Value of `field` in hash `hash`.
    #[must_use]
    pub fn hash_field(&self, hash: &str, field: &str) -> Option<i64> {
        self.live_state()
            .hashes
            .get(hash)?
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| *value)
    }

    /// Remaining time to live of `key`, if it has one.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let deadline = *self.live_state().deadlines.get(key)?;
        (deadline - now).to_std().ok()
    }

    /// Whether `key` currently exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.live_state().exists(key)
    }

    /// Set `member`'s score directly, bypassing pipelines.
    pub fn seed_score(&self, set: &str, member: &str, score: f64) {
        self.state
            .lock()
            .unwrap()
            .sorted_sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    /// Set hash fields directly, in the given order, bypassing pipelines.
    pub fn seed_hash(&self, hash: &str, fields: &[(&str, i64)]) {
        let mut state = self.state.lock().unwrap();
        let entry = state.hashes.entry(hash.to_string()).or_default();
        for (field, value) in fields {
            match entry.iter_mut().find(|(name, _)| name == field) {
                Some((_, existing)) => *existing = *value,
                None => entry.push(((*field).to_string(), *value)),
            }
        }
    }

    /// Number of pipelines submitted so far (including failed ones).
    #[must_use]
    pub fn pipelines_executed(&self) -> usize {
        self.state.lock().unwrap().pipelines_executed
    }

    fn live_state(&self) -> std::sync::MutexGuard<'_, State> {
        let mut state = self.state.lock().unwrap();
        state.purge_expired(self.clock.now());
        state
    }

    fn run(&self, pipeline: &Pipeline) -> Result<Vec<StoreReply>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        state.pipelines_executed += 1;

        let fault = state.faults.pop_front();
        if let Some(Fault::Transport(reason)) = &fault {
            return Err(StoreError::Transport(reason.clone()));
        }

        state.purge_expired(now);
        let mut replies = Vec::with_capacity(pipeline.len());
        let mut failed = None;
        for (index, op) in pipeline.ops().iter().enumerate() {
            if let Some(Fault::Command {
                index: failing,
                reason,
            }) = &fault
            {
                if *failing == index {
                    failed = Some(StoreError::CommandFailed {
                        index,
                        reason: reason.clone(),
                    });
                    continue;
                }
            }
            replies.push(state.apply(op, now));
        }
        failed.map_or(Ok(replies), Err)
    }
}

impl AggregateStore for InMemoryAggregateStore {
    fn execute<'a>(&'a self, pipeline: &'a Pipeline) -> StoreFuture<'a, Vec<StoreReply>> {
        Box::pin(async move {
            if pipeline.is_empty() {
                return Ok(Vec::new());
            }
            self.run(pipeline)
        })
    }
}
