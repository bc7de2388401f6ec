//! In-process store backend
//!
//! Emulates the command surface of the shared store: TTL expiry, sorted sets
//! with stable insertion order among equal scores, atomic transactions,
//! per-key versions for `WATCH`, and glob-pattern pub/sub. Clones share the
//! same state, so several "replicas" in one process can coordinate through it.
//!
//! Expired keys are dropped when touched and, at most once per
//! [`ACTIVE_EXPIRY_INTERVAL`], by a full scan on the next command.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    CoordinationStore, Notification, Reply, StoreError, StoreOp, StoreResult, Subscription,
    Transaction, WatchSession,
};

/// Buffered messages per subscriber before new ones are dropped.
const SUBSCRIBER_BUFFER: usize = 1024;

/// Minimum spacing between full scans for expired keys.
pub const ACTIVE_EXPIRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
enum Slot {
    Bytes(Vec<u8>),
    Sorted(SortedSet),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
    /// Clock value of the last write.
    version: u64,
}

impl Entry {
    fn new(slot: Slot, expires_at: Option<Instant>) -> Self {
        Self {
            slot,
            expires_at,
            version: 0,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

// == Sorted Set ==
/// Members ordered by score, then by the order they were first added.
#[derive(Debug, Clone, Default)]
struct SortedSet {
    members: HashMap<String, (f64, u64)>,
    next_seq: u64,
}

impl SortedSet {
    /// Returns 1 when `member` is new. An existing member is rescored unless
    /// `only_new` is set.
    fn add(&mut self, member: &str, score: f64, only_new: bool) -> i64 {
        match self.members.get_mut(member) {
            Some(_) if only_new => 0,
            Some(existing) => {
                existing.0 = score;
                0
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.members.insert(member.to_string(), (score, seq));
                1
            }
        }
    }

    fn contains(&self, member: &str) -> bool {
        self.members.contains_key(member)
    }

    fn remove(&mut self, member: &str) -> i64 {
        i64::from(self.members.remove(member).is_some())
    }

    fn ordered(&self) -> Vec<String> {
        let mut ranked: Vec<(&String, &(f64, u64))> = self.members.iter().collect();
        ranked.sort_by(|a, b| {
            a.1 .0
                .total_cmp(&b.1 .0)
                .then_with(|| a.1 .1.cmp(&b.1 .1))
        });
        ranked.into_iter().map(|(member, _)| member.clone()).collect()
    }

    fn range(&self, start: isize, stop: isize) -> Vec<String> {
        let ordered = self.ordered();
        let len = ordered.len() as isize;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || start > stop || start >= len {
            return Vec::new();
        }
        ordered[start as usize..=stop as usize].to_vec()
    }
}

struct Subscriber {
    pattern: String,
    tx: mpsc::Sender<Notification>,
}

/// Prior state of one key, restored when a transaction fails part way.
struct Undo {
    key: String,
    entry: Option<Entry>,
    tombstone: Option<u64>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// Removal clock of keys deleted or expired while a watch was open.
    tombstones: HashMap<String, u64>,
    clock: u64,
    /// Open watches, keyed by the clock value they were taken at.
    open_watches: BTreeMap<u64, usize>,
    last_purge: Option<Instant>,
    subscribers: Vec<Subscriber>,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Records a write to `key`. A key that no longer exists leaves a
    /// tombstone only while some watch could still observe the removal.
    fn mark_written(&mut self, key: &str) {
        let version = self.tick();
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.version = version;
                self.tombstones.remove(key);
            }
            None if !self.open_watches.is_empty() => {
                self.tombstones.insert(key.to_string(), version);
            }
            None => {
                self.tombstones.remove(key);
            }
        }
    }

    fn last_write(&self, key: &str) -> u64 {
        self.entries
            .get(key)
            .map(|entry| entry.version)
            .or_else(|| self.tombstones.get(key).copied())
            .unwrap_or(0)
    }

    fn open_watch(&mut self) -> u64 {
        let since = self.clock;
        *self.open_watches.entry(since).or_default() += 1;
        since
    }

    fn close_watch(&mut self, since: u64) {
        if let Some(count) = self.open_watches.get_mut(&since) {
            *count -= 1;
            if *count == 0 {
                self.open_watches.remove(&since);
            }
        }
        self.prune_tombstones();
    }

    /// True when any of `keys` was written, deleted or expired after `since`.
    fn changed_since(&mut self, keys: &[String], since: u64, now: Instant) -> bool {
        keys.iter().any(|key| {
            self.purge_if_expired(key, now);
            self.last_write(key) > since
        })
    }

    /// Tombstones older than every open watch can no longer break one.
    fn prune_tombstones(&mut self) {
        match self.open_watches.keys().next().copied() {
            None => self.tombstones.clear(),
            Some(oldest) => self.tombstones.retain(|_, removed| *removed > oldest),
        }
    }

    /// Drops `key` if its TTL has passed. Expiry counts as a write for watchers.
    fn purge_if_expired(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
            self.mark_written(key);
        }
    }

    /// Removes every expired key. Returns how many were dropped.
    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
            self.mark_written(key);
        }
        self.prune_tombstones();
        self.subscribers.retain(|sub| !sub.tx.is_closed());
        self.last_purge = Some(now);
        expired.len()
    }

    fn purge_if_due(&mut self, now: Instant) {
        let due = self
            .last_purge
            .map_or(true, |at| now.duration_since(at) >= ACTIVE_EXPIRY_INTERVAL);
        if due {
            let purged = self.purge_expired(now);
            if purged > 0 {
                debug!(purged, "memory store dropped expired keys");
            }
        }
    }

    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        self.purge_if_expired(key, now);
        self.entries.get_mut(key)
    }

    fn sorted_mut(&mut self, key: &str, now: Instant) -> StoreResult<&mut SortedSet> {
        self.purge_if_expired(key, now);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Slot::Sorted(SortedSet::default()), None));
        match &mut entry.slot {
            Slot::Sorted(set) => Ok(set),
            Slot::Bytes(_) => Err(wrong_type(key)),
        }
    }

    fn sorted(&mut self, key: &str, now: Instant) -> StoreResult<Option<&SortedSet>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                slot: Slot::Sorted(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn apply(&mut self, op: &StoreOp, now: Instant) -> StoreResult<Reply> {
        match op {
            StoreOp::Get { key } => match self.live(key, now) {
                None => Ok(Reply::Nil),
                Some(Entry {
                    slot: Slot::Bytes(data),
                    ..
                }) => Ok(Reply::Bytes(data.clone())),
                Some(_) => Err(wrong_type(key)),
            },
            StoreOp::Set { key, value, ttl } => {
                let expires_at = (!ttl.is_zero()).then(|| now + *ttl);
                self.entries.insert(
                    key.clone(),
                    Entry::new(Slot::Bytes(value.clone()), expires_at),
                );
                self.mark_written(key);
                Ok(Reply::Ok)
            }
            StoreOp::Del { key } => {
                self.purge_if_expired(key, now);
                let removed = self.entries.remove(key).is_some();
                if removed {
                    self.mark_written(key);
                }
                Ok(Reply::Int(i64::from(removed)))
            }
            StoreOp::Exists { key } => Ok(Reply::Int(i64::from(self.live(key, now).is_some()))),
            StoreOp::ZAdd {
                key,
                member,
                score,
                only_new,
            } => {
                let set = self.sorted_mut(key, now)?;
                let unchanged = *only_new && set.contains(member);
                let added = set.add(member, *score, *only_new);
                if !unchanged {
                    self.mark_written(key);
                }
                Ok(Reply::Int(added))
            }
            StoreOp::ZRange { key, start, stop } => Ok(Reply::Members(
                self.sorted(key, now)?
                    .map(|set| set.range(*start, *stop))
                    .unwrap_or_default(),
            )),
            StoreOp::ZRem { key, member } => {
                let removed = match self.live(key, now) {
                    None => 0,
                    Some(Entry {
                        slot: Slot::Sorted(set),
                        ..
                    }) => set.remove(member),
                    Some(_) => return Err(wrong_type(key)),
                };
                if removed > 0 {
                    if self.sorted(key, now)?.is_some_and(|set| set.members.is_empty()) {
                        self.entries.remove(key);
                    }
                    self.mark_written(key);
                }
                Ok(Reply::Int(removed))
            }
            StoreOp::ZCard { key } => Ok(Reply::Int(
                self.sorted(key, now)?
                    .map(|set| set.members.len() as i64)
                    .unwrap_or(0),
            )),
        }
    }

    /// Applies every op or none of them. Only the keys the transaction
    /// touches are saved for rollback.
    fn apply_all(&mut self, tx: &Transaction, now: Instant) -> StoreResult<Vec<Reply>> {
        let mut saved: HashSet<&str> = HashSet::new();
        let mut undo = Vec::new();
        let mut replies = Vec::with_capacity(tx.len());
        for op in tx.ops() {
            let key = op.key();
            if saved.insert(key) {
                undo.push(Undo {
                    key: key.to_string(),
                    entry: self.entries.get(key).cloned(),
                    tombstone: self.tombstones.get(key).copied(),
                });
            }
            match self.apply(op, now) {
                Ok(reply) => replies.push(reply),
                Err(err) => {
                    self.restore(undo);
                    return Err(err);
                }
            }
        }
        Ok(replies)
    }

    fn restore(&mut self, undo: Vec<Undo>) {
        for Undo {
            key,
            entry,
            tombstone,
        } in undo
        {
            match entry {
                Some(entry) => self.entries.insert(key.clone(), entry),
                None => self.entries.remove(&key),
            };
            match tombstone {
                Some(removed) => self.tombstones.insert(key, removed),
                None => self.tombstones.remove(&key),
            };
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

struct Shared {
    state: Mutex<State>,
    online: Mutex<bool>,
    latency: Mutex<Duration>,
    watch_conflicts: Mutex<u32>,
}

// == Memory Store ==
/// In-process [`CoordinationStore`].
///
/// A single mutex guards the keyspace, the same way the real store executes
/// commands one at a time; it is never held across an `.await`.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("online", &*self.shared.online.lock())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                online: Mutex::new(true),
                latency: Mutex::new(Duration::ZERO),
                watch_conflicts: Mutex::new(0),
            }),
        }
    }

    /// Simulates losing (or regaining) the connection to the store.
    pub fn set_online(&self, online: bool) {
        *self.shared.online.lock() = online;
    }

    /// Delays every command by `latency`, as a slow or stalled server would.
    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock() = latency;
    }

    /// Makes the next `n` watched transactions fail as if the key had been
    /// modified by another client.
    pub fn inject_watch_conflicts(&self, n: u32) {
        *self.shared.watch_conflicts.lock() = n;
    }

    /// Drops every expired key now instead of waiting for the next scan.
    pub fn purge_expired(&self) -> usize {
        self.shared.state.lock().purge_expired(Instant::now())
    }

    /// Keys held in memory, counting expired keys not yet dropped and
    /// tombstones kept for open watches.
    pub fn keyspace_len(&self) -> usize {
        let state = self.shared.state.lock();
        state.entries.len() + state.tombstones.len()
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if *self.shared.online.lock() {
            Ok(())
        } else {
            Err(StoreError::Connection("store offline".to_string()))
        }
    }

    async fn round_trip(&self) -> StoreResult<()> {
        let latency = *self.shared.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.ensure_online()
    }

    fn take_injected_conflict(&self) -> bool {
        let mut remaining = self.shared.watch_conflicts.lock();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.round_trip().await
    }

    async fn exec(&self, tx: Transaction) -> StoreResult<Vec<Reply>> {
        self.round_trip().await?;
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.purge_if_due(now);
        state.apply_all(&tx, now)
    }

    async fn watch_all(&self, keys: &[String]) -> StoreResult<Box<dyn WatchSession>> {
        self.round_trip().await?;
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.purge_if_due(now);
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            // like MGET, a key of another type reads as nil
            let value = match state.live(key, now) {
                Some(Entry {
                    slot: Slot::Bytes(data),
                    ..
                }) => Some(data.clone()),
                _ => None,
            };
            values.push(value);
        }
        let since = state.open_watch();
        Ok(Box::new(MemoryWatch {
            store: self.clone(),
            keys: keys.to_vec(),
            since,
            values,
        }))
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64> {
        self.round_trip().await?;
        let targets: Vec<mpsc::Sender<Notification>> = {
            let mut state = self.shared.state.lock();
            state.subscribers.retain(|sub| !sub.tx.is_closed());
            state
                .subscribers
                .iter()
                .filter(|sub| pattern_matches(&sub.pattern, channel))
                .map(|sub| sub.tx.clone())
                .collect()
        };

        let mut delivered = 0;
        for tx in targets {
            let message = Notification {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            match tx.try_send(message) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel, "subscriber buffer full, dropping notification");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        Ok(delivered)
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<Subscription> {
        self.round_trip().await?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.shared.state.lock().subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        debug!(pattern, "memory store subscription opened");
        Ok(Subscription::new(rx, None))
    }
}

struct MemoryWatch {
    store: MemoryStore,
    keys: Vec<String>,
    since: u64,
    values: Vec<Option<Vec<u8>>>,
}

impl Drop for MemoryWatch {
    fn drop(&mut self) {
        self.store.shared.state.lock().close_watch(self.since);
    }
}

#[async_trait]
impl WatchSession for MemoryWatch {
    fn values(&self) -> &[Option<Vec<u8>>] {
        &self.values
    }

    async fn exec(self: Box<Self>, tx: Transaction) -> StoreResult<Option<Vec<Reply>>> {
        self.store.round_trip().await?;
        if self.store.take_injected_conflict() {
            return Ok(None);
        }
        let now = Instant::now();
        let outcome = {
            let mut state = self.store.shared.state.lock();
            if state.changed_since(&self.keys, self.since, now) {
                None
            } else {
                Some(state.apply_all(&tx, now))
            }
        };
        outcome.transpose()
    }

    async fn discard(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

// == Glob Matching ==
/// Channel pattern match with `*` (any run) and `?` (one char).
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let channel: Vec<char> = channel.chars().collect();
    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < channel.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == channel[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, c));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            c = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&ch| ch == '*')
}
