//! Refresh engine: deduplicated, retried refetches of one scope at a time.
//!
//! Every write into the [`DocumentCache`] that comes from the backend goes
//! through [`RefreshEngine::refresh`]. Per scope there is at most one
//! request in flight; the in-flight marker is an explicit map owned by the
//! engine instance, so independent engines never interfere.

use super::cache::{CommitResult, DocumentCache};
use super::events::{EventSink, SyncEvent};
use super::timing::{cooldown_elapsed, RetryPolicy};
use super::Scope;
use crate::remote::{DocumentRecord, DocumentStore, StoreError};
use crate::util::catch_task_panic;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Default time the in-flight marker is held after a successful refresh.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(300);

/// Caller intent for one refresh request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Refetch even if the cached entry is still fresh.
    pub force_refetch: bool,
    /// Emit a `RefreshFailed` event if the refresh ultimately fails.
    pub show_feedback: bool,
}

impl RefreshOptions {
    pub fn forced() -> Self {
        Self {
            force_refetch: true,
            show_feedback: false,
        }
    }

    pub fn with_feedback(mut self) -> Self {
        self.show_feedback = true;
        self
    }
}

/// Typed result of a refresh request. Errors never escape as `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Fetched and written to the cache.
    Refreshed { generation: u64, count: usize },
    /// Not forced and the cached entry was still fresh; no network call.
    Fresh { generation: u64 },
    /// A refresh for this scope was already in flight; no network call.
    Skipped,
    /// Fetched, but a newer generation was already cached; result discarded.
    Superseded { generation: u64 },
    /// All attempts failed (or the fetch panicked).
    Failed { attempts: u32, error: String },
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RefreshOutcome::Refreshed { .. }
                | RefreshOutcome::Fresh { .. }
                | RefreshOutcome::Superseded { .. }
        )
    }
}

/// Per-scope in-flight marker.
struct InFlight {
    token: u64,
    /// Generation the refresh will commit under.
    generation: u64,
    done: watch::Receiver<Option<RefreshOutcome>>,
    /// Set when a successful refresh enters its cooldown.
    settled_at: Option<Instant>,
}

impl InFlight {
    fn holds(&self, cooldown: Duration, now: Instant) -> bool {
        self.settled_at.is_none() || !cooldown_elapsed(self.settled_at, cooldown, now)
    }
}

type MarkerMap = Arc<Mutex<HashMap<Scope, InFlight>>>;

enum Begin {
    Run(Ticket),
    Fresh(u64),
    Joined {
        token: u64,
        generation: u64,
        done: watch::Receiver<Option<RefreshOutcome>>,
    },
}

struct Ticket {
    scope: Scope,
    token: u64,
    generation: u64,
    done: watch::Sender<Option<RefreshOutcome>>,
    opts: RefreshOptions,
}

/// Issues refetches against the document store and writes them back to the
/// cache under a generation captured at request start.
#[derive(Clone)]
pub struct RefreshEngine {
    store: Arc<dyn DocumentStore>,
    cache: Arc<DocumentCache>,
    markers: MarkerMap,
    tokens: Arc<AtomicU64>,
    policy: RetryPolicy,
    cooldown: Duration,
    events: EventSink,
}

impl RefreshEngine {
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<DocumentCache>) -> Self {
        Self {
            store,
            cache,
            markers: Arc::new(Mutex::new(HashMap::new())),
            tokens: Arc::new(AtomicU64::new(0)),
            policy: RetryPolicy::default(),
            cooldown: DEFAULT_COOLDOWN,
            events: EventSink::disabled(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Whether a refresh (or its cooldown) currently holds `scope`.
    pub fn is_in_flight(&self, scope: &Scope) -> bool {
        let now = Instant::now();
        self.markers
            .lock()
            .get(scope)
            .is_some_and(|m| m.holds(self.cooldown, now))
    }

    /// Whether a fetch for `scope` is outstanding (cooldown excluded).
    pub fn is_refreshing(&self, scope: &Scope) -> bool {
        self.markers
            .lock()
            .get(scope)
            .is_some_and(|m| m.done.borrow().is_none())
    }

    /// Refresh `scope`, returning `Skipped` immediately if one is already in
    /// flight for it.
    pub async fn refresh(&self, scope: &Scope, opts: RefreshOptions) -> RefreshOutcome {
        match self.begin(scope, opts) {
            Begin::Run(ticket) => self.run(ticket).await,
            Begin::Fresh(generation) => RefreshOutcome::Fresh { generation },
            Begin::Joined { .. } => {
                tracing::debug!(scope = %scope, "Refresh already in flight, skipping");
                RefreshOutcome::Skipped
            }
        }
    }

    /// Like [`refresh`](Self::refresh), but a caller that collides with an
    /// in-flight refresh waits for that refresh's outcome instead of getting
    /// `Skipped`. Any number of concurrent callers share one network call.
    pub async fn refresh_and_wait(&self, scope: &Scope, opts: RefreshOptions) -> RefreshOutcome {
        match self.begin(scope, opts) {
            Begin::Run(ticket) => self.run(ticket).await,
            Begin::Fresh(generation) => RefreshOutcome::Fresh { generation },
            Begin::Joined { done, .. } => wait_done(done).await,
        }
    }

    /// Refresh `scope` with data fetched after this call was made.
    ///
    /// A colliding refresh that began after the call is joined. One that
    /// began earlier (or is holding its cooldown) may carry data from before
    /// a local change, so this waits for it to finish and for its cooldown
    /// to pass, then fetches again.
    pub async fn refresh_after_current(&self, scope: &Scope, opts: RefreshOptions) -> RefreshOutcome {
        let since = self.cache.current_generation(scope).unwrap_or(0);
        loop {
            match self.begin(scope, opts) {
                Begin::Run(ticket) => return self.run(ticket).await,
                Begin::Fresh(generation) => return RefreshOutcome::Fresh { generation },
                Begin::Joined {
                    token,
                    generation,
                    done,
                } => {
                    let outcome = wait_done(done).await;
                    if generation > since {
                        return outcome;
                    }
                    if let Some(deadline) = self.cooldown_deadline(scope, token) {
                        tracing::debug!(scope = %scope, "Waiting out refresh cooldown");
                        tokio::time::sleep_until(deadline).await;
                    }
                }
            }
        }
    }

    /// When the cooldown held by marker `token` ends, if it is still held.
    fn cooldown_deadline(&self, scope: &Scope, token: u64) -> Option<Instant> {
        self.markers
            .lock()
            .get(scope)
            .filter(|m| m.token == token)
            .and_then(|m| m.settled_at)
            .map(|at| at + self.cooldown)
    }

    fn begin(&self, scope: &Scope, opts: RefreshOptions) -> Begin {
        let mut markers = self.markers.lock();

        // In-flight short-circuit applies even to forced refreshes
        match markers.get(scope) {
            Some(marker) if marker.holds(self.cooldown, Instant::now()) => {
                return Begin::Joined {
                    token: marker.token,
                    generation: marker.generation,
                    done: marker.done.clone(),
                };
            }
            Some(_) => {
                markers.remove(scope);
            }
            None => {}
        }

        if !opts.force_refetch {
            if let Some(entry) = self.cache.get(scope) {
                if !entry.is_stale(Instant::now()) {
                    return Begin::Fresh(entry.generation);
                }
            }
        }

        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let generation = self.cache.begin_generation(scope);
        let (done_tx, done_rx) = watch::channel(None);
        markers.insert(
            scope.clone(),
            InFlight {
                token,
                generation,
                done: done_rx,
                settled_at: None,
            },
        );

        Begin::Run(Ticket {
            scope: scope.clone(),
            token,
            generation,
            done: done_tx,
            opts,
        })
    }

    async fn run(&self, ticket: Ticket) -> RefreshOutcome {
        let Ticket {
            scope,
            token,
            generation,
            done,
            opts,
        } = ticket;

        tracing::debug!(scope = %scope, generation, forced = opts.force_refetch, "Refresh started");
        let guard = MarkerGuard {
            markers: &self.markers,
            scope: &scope,
            token,
            armed: true,
        };

        let attempts = AtomicU32::new(0);
        let outcome = match catch_task_panic(self.fetch_with_retry(&scope, &attempts)).await {
            Ok(Ok(records)) => {
                let count = records.len();
                match self.cache.commit(&scope, generation, records) {
                    CommitResult::Written { generation } => {
                        tracing::debug!(scope = %scope, generation, count, "Refresh committed");
                        self.events.emit(SyncEvent::CacheUpdated {
                            scope: scope.clone(),
                            generation,
                            count,
                        });
                        RefreshOutcome::Refreshed { generation, count }
                    }
                    CommitResult::Superseded {
                        generation,
                        current,
                    } => {
                        tracing::debug!(
                            scope = %scope,
                            generation,
                            current,
                            "Discarding superseded refresh result"
                        );
                        RefreshOutcome::Superseded { generation }
                    }
                }
            }
            Ok(Err(e)) => RefreshOutcome::Failed {
                attempts: attempts.load(Ordering::Relaxed),
                error: e.to_string(),
            },
            Err(panic_msg) => {
                tracing::error!(task = "refresh", scope = %scope, error = %panic_msg, "Refresh panicked");
                self.events.emit(SyncEvent::TaskPanicked {
                    task: "refresh",
                    error: panic_msg.clone(),
                });
                RefreshOutcome::Failed {
                    attempts: attempts.load(Ordering::Relaxed).max(1),
                    error: format!("refresh panicked: {}", panic_msg),
                }
            }
        };

        if let RefreshOutcome::Failed { attempts, error } = &outcome {
            tracing::warn!(scope = %scope, attempts, error = %error, "Refresh failed");
            if opts.show_feedback {
                self.events.emit(SyncEvent::RefreshFailed {
                    scope: scope.clone(),
                    attempts: *attempts,
                    error: error.clone(),
                });
            }
        }

        done.send_replace(Some(outcome.clone()));
        guard.disarm();
        self.release(&scope, token, outcome.is_success());
        outcome
    }

    /// Clear the marker immediately on failure; on success keep it until
    /// the cooldown has passed. Expired markers are dropped lazily.
    fn release(&self, scope: &Scope, token: u64, success: bool) {
        if !success || self.cooldown.is_zero() {
            remove_marker(&self.markers, scope, token);
            return;
        }
        if let Some(marker) = self.markers.lock().get_mut(scope) {
            if marker.token == token {
                marker.settled_at = Some(Instant::now());
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        scope: &Scope,
        attempts: &AtomicU32,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        let mut retry_count = 0;

        loop {
            attempts.fetch_add(1, Ordering::Relaxed);
            match self.fetch_once(scope).await {
                Ok(records) => return Ok(records),
                Err(e) if e.is_retryable() && retry_count < self.policy.max_retries => {
                    let delay = self.policy.delay_for(retry_count);
                    tracing::debug!(
                        scope = %scope,
                        error = %e,
                        retry = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying refresh after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, scope: &Scope) -> Result<Vec<DocumentRecord>, StoreError> {
        match scope {
            Scope::Archived => self.store.list_archived_documents().await,
            other => self.store.list_documents(&other.filter()).await,
        }
    }
}

async fn wait_done(mut done: watch::Receiver<Option<RefreshOutcome>>) -> RefreshOutcome {
    match done.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(RefreshOutcome::Skipped),
        // Marker dropped without publishing: treat as a no-op
        Err(_) => RefreshOutcome::Skipped,
    }
}

/// Clears the marker if a refresh future is dropped before it completes.
struct MarkerGuard<'a> {
    markers: &'a Mutex<HashMap<Scope, InFlight>>,
    scope: &'a Scope,
    token: u64,
    armed: bool,
}

impl MarkerGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for MarkerGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            remove_marker(self.markers, self.scope, self.token);
        }
    }
}

fn remove_marker(markers: &Mutex<HashMap<Scope, InFlight>>, scope: &Scope, token: u64) {
    let mut markers = markers.lock();
    if markers.get(scope).is_some_and(|m| m.token == token) {
        markers.remove(scope);
    }
}
