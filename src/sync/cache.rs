use super::Scope;
use crate::remote::DocumentRecord;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default staleness threshold (5 minutes).
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Default bound on the number of cached scopes.
const DEFAULT_MAX_SCOPES: usize = 64;

/// Per-scope staleness thresholds.
///
/// Overrides are keyed by [`Scope::kind`], so one `pet` entry covers every
/// per-pet scope.
#[derive(Debug, Clone)]
pub struct StalenessPolicy {
    pub default: Duration,
    pub overrides: HashMap<String, Duration>,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            default: DEFAULT_STALE_AFTER,
            overrides: HashMap::new(),
        }
    }
}

impl StalenessPolicy {
    pub fn threshold(&self, scope: &Scope) -> Duration {
        self.overrides
            .get(scope.kind())
            .copied()
            .unwrap_or(self.default)
    }
}

/// Snapshot of one scope's collection.
///
/// Entries are immutable once written: every write (refresh or optimistic
/// patch) produces a new entry with a new generation.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub scope: Scope,
    pub generation: u64,
    pub records: Arc<[DocumentRecord]>,
    pub updated_at: Instant,
    pub stale_after: Duration,
    /// Set by `invalidate` and by optimistic patches.
    pub invalidated: bool,
}

impl CacheEntry {
    /// Past the staleness threshold or explicitly invalidated.
    pub fn is_stale(&self, now: Instant) -> bool {
        self.invalidated || now.saturating_duration_since(self.updated_at) >= self.stale_after
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outcome of a generation-checked write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Written { generation: u64 },
    /// An entry from a newer generation is already in place; nothing written.
    Superseded { generation: u64, current: u64 },
}

#[derive(Debug, Default)]
struct Slot {
    entry: Option<CacheEntry>,
    /// Highest generation ever written for this scope.
    written: u64,
}

/// In-memory cache of document collections keyed by scope.
///
/// Generations come from one process-wide counter, so they are strictly
/// increasing per scope even if a scope is evicted and later re-created.
pub struct DocumentCache {
    slots: Mutex<LruCache<Scope, Slot>>,
    generations: AtomicU64,
    staleness: StalenessPolicy,
}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::new(StalenessPolicy::default(), DEFAULT_MAX_SCOPES)
    }
}

impl DocumentCache {
    pub fn new(staleness: StalenessPolicy, max_scopes: usize) -> Self {
        let capacity = NonZeroUsize::new(max_scopes.max(Scope::LISTS.len()))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
            generations: AtomicU64::new(0),
            staleness,
        }
    }

    pub fn staleness(&self) -> &StalenessPolicy {
        &self.staleness
    }

    /// Current entry for `scope`, stale or not. Never blocks on the network.
    pub fn get(&self, scope: &Scope) -> Option<CacheEntry> {
        self.slots
            .lock()
            .get(scope)
            .and_then(|slot| slot.entry.clone())
    }

    /// Generation of the entry currently stored for `scope`.
    pub fn current_generation(&self, scope: &Scope) -> Option<u64> {
        self.slots
            .lock()
            .peek(scope)
            .and_then(|slot| slot.entry.as_ref().map(|e| e.generation))
    }

    /// Reserve the next generation for a refresh that is about to start.
    pub fn begin_generation(&self, _scope: &Scope) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Replace the entry for `scope` unconditionally, bumping its generation.
    pub fn put(&self, scope: &Scope, records: Vec<DocumentRecord>) -> u64 {
        let generation = self.begin_generation(scope);
        self.write(scope, generation, records.into(), false);
        generation
    }

    /// Write back a refresh result captured at `generation`.
    ///
    /// A result for a generation older than what is already stored is
    /// discarded; a late response must never overwrite newer data.
    pub fn commit(&self, scope: &Scope, generation: u64, records: Vec<DocumentRecord>) -> CommitResult {
        let mut slots = self.slots.lock();
        let slot = slots.get_or_insert_mut(scope.clone(), Slot::default);
        if generation < slot.written {
            return CommitResult::Superseded {
                generation,
                current: slot.written,
            };
        }
        slot.written = generation;
        slot.entry = Some(self.entry(scope, generation, records.into(), false));
        CommitResult::Written { generation }
    }

    /// Mark `scope` stale without dropping its data.
    pub fn invalidate(&self, scope: &Scope) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(scope).and_then(|slot| slot.entry.as_mut()) {
            Some(entry) => {
                entry.invalidated = true;
                true
            }
            None => false,
        }
    }

    /// Optimistic local patch: build a replacement collection from the
    /// current one and store it under a fresh generation, marked invalidated
    /// so the next read revalidates against the backend.
    ///
    /// Returns the new generation, or `None` if the scope is not cached.
    pub fn apply_local<F>(&self, scope: &Scope, patch: F) -> Option<u64>
    where
        F: FnOnce(&[DocumentRecord]) -> Vec<DocumentRecord>,
    {
        let current = self.get(scope)?;
        let records = patch(&current.records);
        let generation = self.begin_generation(scope);
        self.write(scope, generation, records.into(), true);
        Some(generation)
    }

    /// Scopes that currently hold an entry, most recently used first.
    pub fn scopes(&self) -> Vec<Scope> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(scope, _)| scope.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.entry.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, scope: &Scope, generation: u64, records: Arc<[DocumentRecord]>, invalidated: bool) {
        let mut slots = self.slots.lock();
        let slot = slots.get_or_insert_mut(scope.clone(), Slot::default);
        slot.written = slot.written.max(generation);
        slot.entry = Some(self.entry(scope, generation, records, invalidated));
    }

    fn entry(
        &self,
        scope: &Scope,
        generation: u64,
        records: Arc<[DocumentRecord]>,
        invalidated: bool,
    ) -> CacheEntry {
        CacheEntry {
            scope: scope.clone(),
            generation,
            records,
            updated_at: Instant::now(),
            stale_after: self.staleness.threshold(scope),
            invalidated,
        }
    }
}
