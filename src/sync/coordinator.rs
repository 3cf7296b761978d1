//! The document sync coordinator: single entry point owning the cache, the
//! refresh engine, the readiness board, per-scope selections and the
//! cross-context signal.
//!
//! Reads are stale-while-revalidate. Mutations are two-phase: an optimistic
//! local patch is written to every cached scope, the backend call is made,
//! and an authoritative forced refresh follows (which also rolls back the
//! patch if the call failed).

use super::cache::{DocumentCache, StalenessPolicy};
use super::events::{EventSink, MutationKind, SyncEvent};
use super::readiness::{DisplayState, ReadinessBoard, SettleDelays};
use super::refresh::{RefreshEngine, RefreshOptions, RefreshOutcome, DEFAULT_COOLDOWN};
use super::selection::{BulkAction, BulkReport, SelectionSet};
use super::signal::{Broadcast, DispatchConfig, SyncDispatcher, Trigger, Visibility, VisibilityTracker};
use super::timing::RetryPolicy;
use super::Scope;
use crate::remote::{DocumentId, DocumentPatch, DocumentRecord, DocumentStore, ShareLink, StoreError};
use crate::util::catch_task_panic;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Pending triggers buffered before new ones are dropped.
const TRIGGER_CAPACITY: usize = 64;

/// Everything tunable about a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub staleness: StalenessPolicy,
    pub max_scopes: usize,
    pub retry: RetryPolicy,
    pub cooldown: Duration,
    pub dispatch: DispatchConfig,
    pub settle: SettleDelays,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            staleness: StalenessPolicy::default(),
            max_scopes: 64,
            retry: RetryPolicy::default(),
            cooldown: DEFAULT_COOLDOWN,
            dispatch: DispatchConfig::default(),
            settle: SettleDelays::default(),
        }
    }
}

/// Result of a stale-while-revalidate read.
#[derive(Debug, Clone)]
pub struct ScopeView {
    pub scope: Scope,
    /// Cached snapshot, if the scope has ever been loaded.
    pub records: Option<Arc<[DocumentRecord]>>,
    pub generation: Option<u64>,
    pub is_stale: bool,
    /// A fetch that will produce a newer generation is outstanding.
    pub refreshing: bool,
    pub display: DisplayState,
}

impl ScopeView {
    pub fn records(&self) -> &[DocumentRecord] {
        self.records.as_deref().unwrap_or(&[])
    }
}

/// Typed result of a mutation. Failures have already been reported through
/// a `MutationFailed` event and a rollback refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome<T = ()> {
    Applied(T),
    Failed { error: String },
}

impl<T> MutationOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, MutationOutcome::Applied(_))
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            MutationOutcome::Applied(value) => Ok(value),
            MutationOutcome::Failed { error } => Err(error),
        }
    }
}

type LocalPatch<'a> = &'a (dyn Fn(&mut DocumentRecord) + Send + Sync);

/// What a refresh does when the scope already has one in flight.
#[derive(Debug, Clone, Copy)]
enum Collision {
    /// Return `Skipped`.
    Skip,
    /// Share the in-flight refresh's outcome.
    Join,
    /// Wait it out and fetch again unless it began after the request.
    Queue,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    cache: Arc<DocumentCache>,
    engine: RefreshEngine,
    broadcast: Arc<dyn Broadcast>,
    readiness: ReadinessBoard,
    selections: Mutex<HashMap<Scope, SelectionSet>>,
    visibility: Mutex<VisibilityTracker>,
    dispatch: DispatchConfig,
    events: EventSink,
    triggers_tx: mpsc::Sender<Trigger>,
    triggers_rx: Mutex<Option<mpsc::Receiver<Trigger>>>,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct DocumentCoordinator {
    inner: Arc<Inner>,
}

impl DocumentCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        broadcast: Arc<dyn Broadcast>,
        config: CoordinatorConfig,
        events: EventSink,
    ) -> Self {
        let cache = Arc::new(DocumentCache::new(config.staleness, config.max_scopes));
        let engine = RefreshEngine::new(Arc::clone(&store), Arc::clone(&cache))
            .with_policy(config.retry)
            .with_cooldown(config.cooldown)
            .with_events(events.clone());
        let (triggers_tx, triggers_rx) = mpsc::channel(TRIGGER_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                engine,
                broadcast,
                readiness: ReadinessBoard::new(config.settle),
                selections: Mutex::new(HashMap::new()),
                visibility: Mutex::new(VisibilityTracker::default()),
                dispatch: config.dispatch,
                events,
                triggers_tx,
                triggers_rx: Mutex::new(Some(triggers_rx)),
            }),
        }
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.inner.cache
    }

    pub fn engine(&self) -> &RefreshEngine {
        &self.inner.engine
    }

    pub fn readiness(&self) -> &ReadinessBoard {
        &self.inner.readiness
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Return the cached snapshot immediately; start a background refresh if
    /// it is absent or stale. Never waits on the network.
    pub fn read(&self, scope: &Scope) -> ScopeView {
        let inner = &self.inner;
        let entry = inner.cache.get(scope);
        let is_stale = entry.as_ref().map_or(true, |e| e.is_stale(Instant::now()));
        let mut refreshing = inner.engine.is_refreshing(scope);

        if is_stale && !inner.engine.is_in_flight(scope) {
            if entry.is_none() {
                inner.readiness.begin_loading(scope);
            }
            let this = self.clone();
            let target = scope.clone();
            tokio::spawn(async move {
                this.refresh_scope(&target, RefreshOptions::default(), Collision::Skip)
                    .await;
            });
            refreshing = true;
        }

        ScopeView {
            scope: scope.clone(),
            generation: entry.as_ref().map(|e| e.generation),
            records: entry.map(|e| e.records),
            is_stale,
            refreshing,
            display: inner.readiness.display(scope),
        }
    }

    /// Refresh `scope` and wait for the result. Concurrent loads of one scope
    /// share a single fetch.
    pub async fn load(&self, scope: &Scope, opts: RefreshOptions) -> RefreshOutcome {
        let inner = &self.inner;
        if opts.force_refetch || inner.cache.get(scope).is_none() {
            inner.readiness.begin_loading(scope);
        }
        self.refresh_scope(scope, opts, Collision::Join).await
    }

    /// Refresh without waiting on a colliding refresh (`Skipped` instead).
    pub async fn refresh(&self, scope: &Scope, opts: RefreshOptions) -> RefreshOutcome {
        self.refresh_scope(scope, opts, Collision::Skip).await
    }

    /// Force-refresh every cached scope, as a sync trigger does.
    ///
    /// Each scope ends up holding data fetched after this call: a refresh
    /// that was already running (or cooling down) is waited out and then
    /// repeated.
    pub async fn sync_now(&self) -> Vec<(Scope, RefreshOutcome)> {
        let scopes = self.inner.cache.scopes();
        let outcomes = join_all(
            scopes
                .iter()
                .map(|scope| self.refresh_scope(scope, RefreshOptions::forced(), Collision::Queue)),
        )
        .await;
        scopes.into_iter().zip(outcomes).collect()
    }

    async fn refresh_scope(&self, scope: &Scope, opts: RefreshOptions, collision: Collision) -> RefreshOutcome {
        let engine = &self.inner.engine;
        let outcome = match collision {
            Collision::Skip => engine.refresh(scope, opts).await,
            Collision::Join => engine.refresh_and_wait(scope, opts).await,
            Collision::Queue => engine.refresh_after_current(scope, opts).await,
        };

        match &outcome {
            RefreshOutcome::Refreshed { .. } => self.collection_replaced(scope),
            // Keep showing what is cached rather than a spinner
            RefreshOutcome::Failed { .. } => {
                if self.inner.readiness.is_loading(scope) && self.inner.cache.get(scope).is_some() {
                    self.collection_replaced(scope);
                }
            }
            // Nothing new was written; only settle a cycle that is still waiting
            _ => {
                if self.inner.readiness.is_loading(scope) {
                    self.collection_replaced(scope);
                }
            }
        }
        outcome
    }

    /// Feed a newly written entry to the readiness gate and prune the
    /// scope's selection against it.
    fn collection_replaced(&self, scope: &Scope) {
        let inner = &self.inner;
        let Some(entry) = inner.cache.get(scope) else {
            return;
        };
        inner.readiness.finish_loading(scope, entry.len());

        if let Some(selection) = inner.selections.lock().get_mut(scope) {
            let dropped = selection.retain_present(&entry.records);
            if dropped > 0 {
                tracing::debug!(scope = %scope, dropped, "Pruned selection after collection change");
            }
        }
    }

    /// Find a record in whichever cached scope holds it.
    pub fn cached_record(&self, id: &DocumentId) -> Option<DocumentRecord> {
        let cache = &self.inner.cache;
        cache.scopes().iter().find_map(|scope| {
            cache
                .get(scope)
                .and_then(|entry| entry.records.iter().find(|r| &r.id == id).cloned())
        })
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub async fn set_bookmark(&self, id: &DocumentId, value: bool) -> MutationOutcome {
        let local = move |r: &mut DocumentRecord| r.is_favorite = value;
        let outcome = self
            .apply(id, MutationKind::Bookmark, Some(&local), {
                let id = id.clone();
                move |store| async move { store.update_bookmark(&id, value).await }
            })
            .await;
        self.after_mutation(outcome).await
    }

    /// Flip the bookmark flag based on the cached record.
    pub async fn toggle_bookmark(&self, id: &DocumentId) -> MutationOutcome<bool> {
        let Some(record) = self.cached_record(id) else {
            return MutationOutcome::Failed {
                error: StoreError::NotFound(id.clone()).to_string(),
            };
        };
        let value = !record.is_favorite;
        match self.set_bookmark(id, value).await {
            MutationOutcome::Applied(()) => MutationOutcome::Applied(value),
            MutationOutcome::Failed { error } => MutationOutcome::Failed { error },
        }
    }

    pub async fn update_fields(&self, id: &DocumentId, patch: DocumentPatch) -> MutationOutcome {
        let patch = Arc::new(patch);
        let local_patch = Arc::clone(&patch);
        let local = move |r: &mut DocumentRecord| local_patch.apply_to(r);
        let outcome = self
            .apply(id, MutationKind::EditFields, Some(&local), {
                let id = id.clone();
                move |store| async move { store.update_document_fields(&id, &patch).await }
            })
            .await;
        self.after_mutation(outcome).await
    }

    pub async fn archive(&self, id: &DocumentId) -> MutationOutcome {
        self.set_archived(id, true).await
    }

    pub async fn restore(&self, id: &DocumentId) -> MutationOutcome {
        self.set_archived(id, false).await
    }

    async fn set_archived(&self, id: &DocumentId, archived: bool) -> MutationOutcome {
        let outcome = self.apply_archived(id, archived).await;
        self.after_mutation(outcome).await
    }

    async fn apply_archived(&self, id: &DocumentId, archived: bool) -> Result<(), String> {
        let kind = if archived {
            MutationKind::Archive
        } else {
            MutationKind::Restore
        };
        let patch = DocumentPatch::archived(archived);
        let local = move |r: &mut DocumentRecord| r.is_archived = archived;
        self.apply(id, kind, Some(&local), {
            let id = id.clone();
            move |store| async move { store.update_document_fields(&id, &patch).await }
        })
        .await
    }

    /// Create a time-limited public link. The link is only known once the
    /// backend answers, so the local patch is written after the call.
    pub async fn generate_share_link(
        &self,
        id: &DocumentId,
        expiry_hours: u32,
    ) -> MutationOutcome<ShareLink> {
        let outcome = self
            .apply(id, MutationKind::ShareLink, None, {
                let id = id.clone();
                move |store| async move { store.generate_share_link(&id, expiry_hours).await }
            })
            .await;
        if let Ok(link) = &outcome {
            let local = |r: &mut DocumentRecord| r.share = Some(link.clone());
            self.patch_locally(id, &local);
        }
        self.after_mutation(outcome).await
    }

    pub async fn remove_share_link(&self, id: &DocumentId) -> MutationOutcome {
        let local = |r: &mut DocumentRecord| r.share = None;
        let outcome = self
            .apply(id, MutationKind::RemoveShareLink, Some(&local), {
                let id = id.clone();
                move |store| async move { store.remove_share_link(&id).await }
            })
            .await;
        self.after_mutation(outcome).await
    }

    /// Phases one and two of a mutation: optimistic local patch, then the
    /// backend call. A failure is reported immediately.
    async fn apply<T, F, Fut>(
        &self,
        id: &DocumentId,
        kind: MutationKind,
        local: Option<LocalPatch<'_>>,
        call: F,
    ) -> Result<T, String>
    where
        F: FnOnce(Arc<dyn DocumentStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if let Some(local) = local {
            self.patch_locally(id, local);
        }

        let result = match catch_task_panic(call(Arc::clone(&self.inner.store))).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic_msg) => {
                tracing::error!(task = "mutation", error = %panic_msg, "Mutation panicked");
                self.inner.events.emit(SyncEvent::TaskPanicked {
                    task: "mutation",
                    error: panic_msg.clone(),
                });
                Err(format!("mutation panicked: {}", panic_msg))
            }
        };

        match &result {
            Ok(_) => tracing::info!(document = %id, action = %kind, "Mutation applied"),
            Err(error) => {
                tracing::warn!(document = %id, action = %kind, error = %error, "Mutation failed");
                self.inner.events.emit(SyncEvent::MutationFailed {
                    document: id.clone(),
                    action: kind,
                    error: error.clone(),
                });
            }
        }
        result
    }

    /// Phase three: tell other contexts on success, then force-refresh every
    /// cached scope. On failure the same refresh rolls the patch back.
    async fn after_mutation<T>(&self, result: Result<T, String>) -> MutationOutcome<T> {
        if result.is_ok() {
            self.publish_change().await;
        }
        self.refresh_affected().await;

        match result {
            Ok(value) => MutationOutcome::Applied(value),
            Err(error) => MutationOutcome::Failed { error },
        }
    }

    /// Write the patched record into every cached scope it belongs to (or
    /// used to belong to). Each write is a new, invalidated entry.
    fn patch_locally(&self, id: &DocumentId, local: LocalPatch<'_>) {
        let Some(mut patched) = self.cached_record(id) else {
            tracing::debug!(document = %id, "Document not cached; skipping optimistic patch");
            return;
        };
        local(&mut patched);

        let cache = &self.inner.cache;
        for scope in cache.scopes() {
            let Some(entry) = cache.get(&scope) else {
                continue;
            };
            let present = entry.records.iter().any(|r| &r.id == id);
            let admits = scope.admits(&patched);
            if !present && !admits {
                continue;
            }

            cache.apply_local(&scope, |records| {
                let mut next: Vec<DocumentRecord> =
                    records.iter().filter(|r| &r.id != id).cloned().collect();
                if admits {
                    // Keep newest-first order
                    let at = next
                        .iter()
                        .position(|r| r.created_at < patched.created_at)
                        .unwrap_or(next.len());
                    next.insert(at, patched.clone());
                }
                next
            });
            self.collection_replaced(&scope);
        }
    }

    async fn publish_change(&self) {
        if let Err(e) = self.inner.broadcast.publish().await {
            tracing::warn!(error = %e, "Failed to publish document change signal");
        }
    }

    async fn refresh_affected(&self) {
        for (scope, outcome) in self.sync_now().await {
            if let RefreshOutcome::Failed { error, .. } = outcome {
                // Optimistic data stays until a later refresh reaches the backend
                self.inner.cache.invalidate(&scope);
                tracing::warn!(scope = %scope, error = %error, "Authoritative refresh failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Selection and bulk actions
    // ------------------------------------------------------------------

    /// Select a document displayed in `scope`. Ids that are not in the
    /// cached collection are refused.
    pub fn select(&self, scope: &Scope, id: &DocumentId) -> bool {
        if !self.is_displayed(scope, id) {
            return false;
        }
        self.inner
            .selections
            .lock()
            .entry(scope.clone())
            .or_default()
            .select(id.clone())
    }

    pub fn deselect(&self, scope: &Scope, id: &DocumentId) -> bool {
        self.inner
            .selections
            .lock()
            .get_mut(scope)
            .is_some_and(|s| s.deselect(id))
    }

    /// Returns whether `id` is selected afterwards.
    pub fn toggle_selection(&self, scope: &Scope, id: &DocumentId) -> bool {
        let mut selections = self.inner.selections.lock();
        let selection = selections.entry(scope.clone()).or_default();
        if selection.contains(id) {
            selection.deselect(id);
            false
        } else if self.is_displayed(scope, id) {
            selection.select(id.clone())
        } else {
            false
        }
    }

    pub fn clear_selection(&self, scope: &Scope) {
        if let Some(selection) = self.inner.selections.lock().get_mut(scope) {
            selection.clear();
        }
    }

    pub fn selected(&self, scope: &Scope) -> Vec<DocumentId> {
        self.inner
            .selections
            .lock()
            .get(scope)
            .map(SelectionSet::selected)
            .unwrap_or_default()
    }

    fn is_displayed(&self, scope: &Scope, id: &DocumentId) -> bool {
        self.inner
            .cache
            .get(scope)
            .is_some_and(|entry| entry.records.iter().any(|r| &r.id == id))
    }

    /// Run `action` over the selection of `scope`. The selection is always
    /// cleared afterwards, a change signal is published and every cached
    /// scope is force-refreshed, whether or not individual ids failed.
    pub async fn bulk(&self, scope: &Scope, action: BulkAction) -> BulkReport {
        let ids = self.selected(scope);
        let mut report = BulkReport::new(action);

        let results = join_all(ids.iter().map(|id| self.apply_bulk_one(id, action))).await;
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(()) => report.succeeded.push(id),
                Err(error) => report.failed.push((id, error)),
            }
        }

        self.clear_selection(scope);
        self.publish_change().await;
        self.refresh_affected().await;

        tracing::info!(
            scope = %scope,
            action = %action,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Bulk action finished"
        );
        self.inner.events.emit(SyncEvent::BulkCompleted {
            scope: scope.clone(),
            succeeded: report.succeeded.len(),
            failed: report.failed.len(),
        });
        report
    }

    async fn apply_bulk_one(&self, id: &DocumentId, action: BulkAction) -> Result<(), String> {
        match action {
            BulkAction::Archive => self.apply_archived(id, true).await,
            BulkAction::Restore => self.apply_archived(id, false).await,
            BulkAction::Bookmark(value) => {
                let local = move |r: &mut DocumentRecord| r.is_favorite = value;
                self.apply(id, action.kind(), Some(&local), {
                    let id = id.clone();
                    move |store| async move { store.update_bookmark(&id, value).await }
                })
                .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Report a visibility change from the host.
    pub fn set_visibility(&self, visibility: Visibility) {
        let trigger = self.inner.visibility.lock().set_visibility(visibility);
        if let Some(trigger) = trigger {
            self.push_trigger(trigger);
        }
    }

    /// Report a focus change from the host.
    pub fn set_focus(&self, focused: bool) {
        let trigger = self.inner.visibility.lock().set_focus(focused);
        if let Some(trigger) = trigger {
            self.push_trigger(trigger);
        }
    }

    /// Ask for a debounced sync of every cached scope.
    pub fn request_sync(&self) {
        self.push_trigger(Trigger::Manual);
    }

    fn push_trigger(&self, trigger: Trigger) {
        if let Err(e) = self.inner.triggers_tx.try_send(trigger) {
            tracing::debug!(error = %e, "Sync trigger dropped");
        }
    }

    /// Drive the debounced dispatcher from host triggers and cross-context
    /// signals until `shutdown` resolves.
    ///
    /// Only one `run` loop can be active per coordinator; a second call
    /// returns immediately.
    pub async fn run<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let Some(mut triggers) = self.inner.triggers_rx.lock().take() else {
            tracing::warn!("Coordinator run loop already started");
            return;
        };
        let mut signals = self.inner.broadcast.subscribe();
        let mut dispatcher = SyncDispatcher::new(&self.inner.dispatch);
        tokio::pin!(shutdown);

        tracing::debug!(
            origin = self.inner.broadcast.origin(),
            debounce_ms = dispatcher.interval().as_millis() as u64,
            enabled = dispatcher.is_enabled(),
            "Sync loop started"
        );

        loop {
            let deadline = dispatcher.deadline();

            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                Some(trigger) = triggers.recv() => {
                    dispatcher.trigger(&trigger, Instant::now());
                }

                Some(signal) = signals.recv() => {
                    dispatcher.trigger(&Trigger::Broadcast { origin: signal.origin }, Instant::now());
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(collapsed) = dispatcher.fire(Instant::now()) {
                        tracing::debug!(collapsed, "Debounce window closed; syncing");
                        if let Err(panic_msg) = catch_task_panic(self.sync_now()).await {
                            tracing::error!(task = "sync", error = %panic_msg, "Sync panicked");
                            self.inner.events.emit(SyncEvent::TaskPanicked {
                                task: "sync",
                                error: panic_msg,
                            });
                        }
                    }
                }

                else => break,
            }
        }

        // Allow a later run loop to pick the receiver back up
        *self.inner.triggers_rx.lock() = Some(triggers);
        tracing::debug!("Sync loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{DocumentCategory, InMemoryDocumentStore, InjectedFailure};
    use crate::sync::signal::LocalBroadcast;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn doc(id: &str, minutes_ago: i64) -> DocumentRecord {
        DocumentRecord {
            id: DocumentId::from(id),
            name: format!("{}.pdf", id),
            category: DocumentCategory::Vaccination,
            file_type: "application/pdf".to_string(),
            pet_id: Some("rex".to_string()),
            is_favorite: false,
            is_archived: false,
            share: None,
            created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
    }

    fn coordinator(store: &Arc<InMemoryDocumentStore>) -> DocumentCoordinator {
        let store: Arc<dyn DocumentStore> = store.clone();
        DocumentCoordinator::new(
            store,
            Arc::new(LocalBroadcast::new()),
            CoordinatorConfig {
                cooldown: Duration::ZERO,
                ..CoordinatorConfig::default()
            },
            EventSink::disabled(),
        )
    }

    fn ids(records: &[DocumentRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_is_stale_while_revalidate() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1)]));
        let c = coordinator(&store);

        let first = c.read(&Scope::Active);
        assert!(first.records.is_none());
        assert!(first.refreshing);
        assert_eq!(first.display, DisplayState::Loading);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = c.read(&Scope::Active);
        assert_eq!(ids(second.records()), vec!["a"]);
        assert!(!second.is_stale);
        assert!(!second.refreshing);
        assert_eq!(store.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_share_one_fetch() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1)]));
        store.delay_next_lists([Duration::from_millis(100)]);
        let c = coordinator(&store);

        let outcomes = join_all((0..5).map(|_| c.load(&Scope::Active, RefreshOptions::forced()))).await;
        assert_eq!(store.list_calls(), 1);
        assert!(outcomes.iter().all(RefreshOutcome::is_success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bookmark_moves_document_between_scopes() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1), doc("b", 2)]));
        let c = coordinator(&store);
        c.load(&Scope::Active, RefreshOptions::default()).await;
        c.load(&Scope::Bookmarked, RefreshOptions::default()).await;
        assert!(c.read(&Scope::Bookmarked).records().is_empty());

        let outcome = c.set_bookmark(&DocumentId::from("b"), true).await;
        assert_eq!(outcome, MutationOutcome::Applied(()));

        let bookmarked = c.read(&Scope::Bookmarked);
        assert_eq!(ids(bookmarked.records()), vec!["b"]);
        assert!(store.get(&DocumentId::from("b")).unwrap().is_favorite);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_patch_visible_before_backend_answers() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1)]));
        let c = coordinator(&store);
        c.load(&Scope::Active, RefreshOptions::default()).await;

        let id = DocumentId::from("a");
        c.patch_locally(&id, &|r: &mut DocumentRecord| r.name = "renamed.pdf".to_string());
        let view = c.read(&Scope::Active);
        assert_eq!(view.records()[0].name, "renamed.pdf");
        assert!(view.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mutation_rolls_back() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1)]));
        let id = DocumentId::from("a");
        store.fail_mutations_for(&id);
        let (tx, mut rx) = mpsc::channel(16);
        let dyn_store: Arc<dyn DocumentStore> = store.clone();
        let c = DocumentCoordinator::new(
            dyn_store,
            Arc::new(LocalBroadcast::new()),
            CoordinatorConfig {
                cooldown: Duration::ZERO,
                ..CoordinatorConfig::default()
            },
            EventSink::new(tx),
        );
        c.load(&Scope::Active, RefreshOptions::default()).await;

        let outcome = c.archive(&id).await;
        assert!(!outcome.is_applied());

        // The authoritative refresh restored the server's view
        assert_eq!(ids(c.read(&Scope::Active).records()), vec!["a"]);
        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::MutationFailed { action, .. } = event {
                assert_eq!(action, MutationKind::Archive);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    fn default_coordinator(store: &Arc<InMemoryDocumentStore>) -> DocumentCoordinator {
        let store: Arc<dyn DocumentStore> = store.clone();
        DocumentCoordinator::new(
            store,
            Arc::new(LocalBroadcast::new()),
            CoordinatorConfig::default(),
            EventSink::disabled(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mutation_rolls_back_during_cooldown() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1), doc("b", 2)]));
        let c = default_coordinator(&store);
        c.load(&Scope::Active, RefreshOptions::default()).await;
        assert!(c.engine().is_in_flight(&Scope::Active));

        let id = DocumentId::from("a");
        store.fail_mutations_for(&id);
        assert!(!c.archive(&id).await.is_applied());

        let view = c.read(&Scope::Active);
        assert_eq!(ids(view.records()), vec!["a", "b"]);
        assert!(!view.is_stale);
        assert_eq!(store.list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mutation_rolls_back_behind_older_fetch() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1)]));
        let c = default_coordinator(&store);
        c.load(&Scope::Active, RefreshOptions::default()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        store.delay_next_lists([Duration::from_millis(500)]);
        let older = {
            let c = c.clone();
            tokio::spawn(async move { c.refresh(&Scope::Active, RefreshOptions::forced()).await })
        };
        tokio::task::yield_now().await;

        let id = DocumentId::from("a");
        store.fail_mutations_for(&id);
        assert!(!c.archive(&id).await.is_applied());

        assert!(matches!(older.await.unwrap(), RefreshOutcome::Superseded { .. }));
        assert_eq!(ids(c.read(&Scope::Active).records()), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_forced_load_keeps_cached_data_visible() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1), doc("b", 2)]));
        let c = default_coordinator(&store);
        c.load(&Scope::Active, RefreshOptions::default()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(c.read(&Scope::Active).display, DisplayState::Populated(2));

        store.fail_next_lists([InjectedFailure::Status(401)]);
        let outcome = c.load(&Scope::Active, RefreshOptions::forced()).await;
        assert!(matches!(outcome, RefreshOutcome::Failed { attempts: 1, .. }));

        tokio::time::sleep(c.readiness().delays().max()).await;
        let view = c.read(&Scope::Active);
        assert_eq!(view.display, DisplayState::Populated(2));
        assert_eq!(view.records().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_bookmark_uses_cached_state() {
        let mut starred = doc("a", 1);
        starred.is_favorite = true;
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![starred]));
        let c = coordinator(&store);

        let missing = c.toggle_bookmark(&DocumentId::from("a")).await;
        assert!(!missing.is_applied());

        c.load(&Scope::Active, RefreshOptions::default()).await;
        let toggled = c.toggle_bookmark(&DocumentId::from("a")).await;
        assert_eq!(toggled, MutationOutcome::Applied(false));
        assert!(!store.get(&DocumentId::from("a")).unwrap().is_favorite);
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_link_lifecycle() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1)]));
        let c = coordinator(&store);
        c.load(&Scope::Active, RefreshOptions::default()).await;
        let id = DocumentId::from("a");

        let link = c.generate_share_link(&id, 48).await.into_result().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(c.read(&Scope::Active).records()[0].share, Some(link));

        assert!(c.remove_share_link(&id).await.is_applied());
        assert_eq!(c.read(&Scope::Active).records()[0].share, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_only_accepts_displayed_ids() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1)]));
        let c = coordinator(&store);
        assert!(!c.select(&Scope::Active, &DocumentId::from("a")));

        c.load(&Scope::Active, RefreshOptions::default()).await;
        assert!(c.select(&Scope::Active, &DocumentId::from("a")));
        assert!(!c.select(&Scope::Active, &DocumentId::from("zzz")));
        assert!(!c.toggle_selection(&Scope::Active, &DocumentId::from("a")));
        assert!(c.selected(&Scope::Active).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_pruned_when_collection_replaced() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1), doc("b", 2)]));
        let c = coordinator(&store);
        c.load(&Scope::Active, RefreshOptions::default()).await;
        c.select(&Scope::Active, &DocumentId::from("a"));
        c.select(&Scope::Active, &DocumentId::from("b"));

        // Another client deletes b
        store.remove(&DocumentId::from("b"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        c.load(&Scope::Active, RefreshOptions::forced()).await;

        assert_eq!(c.selected(&Scope::Active), vec![DocumentId::from("a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_archive_clears_selection_and_reports() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![
            doc("a", 1),
            doc("b", 2),
            doc("c", 3),
        ]));
        store.fail_mutations_for(&DocumentId::from("b"));
        let c = coordinator(&store);
        c.load(&Scope::Active, RefreshOptions::default()).await;
        c.load(&Scope::Archived, RefreshOptions::default()).await;
        c.select(&Scope::Active, &DocumentId::from("a"));
        c.select(&Scope::Active, &DocumentId::from("b"));

        let report = c.bulk(&Scope::Active, BulkAction::Archive).await;
        assert_eq!(report.succeeded, vec![DocumentId::from("a")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, DocumentId::from("b"));
        assert!(c.selected(&Scope::Active).is_empty());

        assert_eq!(ids(c.read(&Scope::Active).records()), vec!["b", "c"]);
        assert_eq!(ids(c.read(&Scope::Archived).records()), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_scope_confirmed_after_settle() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let c = coordinator(&store);
        c.load(&Scope::Bookmarked, RefreshOptions::default()).await;

        assert!(!c.readiness().should_show_empty(&Scope::Bookmarked));
        assert_eq!(c.read(&Scope::Bookmarked).display, DisplayState::Loading);

        tokio::time::sleep(c.readiness().delays().max()).await;
        assert!(c.readiness().should_show_empty(&Scope::Bookmarked));
        assert_eq!(c.read(&Scope::Bookmarked).display, DisplayState::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_debounces_focus_burst_into_one_sync() {
        let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("a", 1)]));
        let c = coordinator(&store);
        c.load(&Scope::Active, RefreshOptions::default()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.list_calls(), 1);

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let runner = {
            let c = c.clone();
            tokio::spawn(async move {
                c.run(async {
                    let _ = stop_rx.await;
                })
                .await
            })
        };

        for _ in 0..5 {
            c.set_focus(false);
            c.set_focus(true);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.list_calls(), 2);

        let _ = stop_tx.send(());
        runner.await.unwrap();
    }
}
