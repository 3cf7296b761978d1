//! End-to-end sync between independent coordinators.
//!
//! Two coordinators stand in for two open views of the same account: they
//! share a backend (an in-memory store) and a change broadcast, but nothing
//! else. A mutation in one must become visible in the other after the
//! debounce window, without either view touching the other's cache.

use petdocs::remote::{
    DocumentCategory, DocumentId, DocumentRecord, DocumentStore, InMemoryDocumentStore,
};
use petdocs::sync::{
    Broadcast, BulkAction, CoordinatorConfig, DispatchConfig, DisplayState, DocumentCoordinator,
    EventSink, LocalBroadcast, MutationKind, RefreshOptions, Scope, SharedKeyBroadcast, SyncEvent,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

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
        created_at: chrono::Utc::now() - chrono::Duration::minutes(minutes_ago),
    }
}

fn config(debounce: Duration) -> CoordinatorConfig {
    CoordinatorConfig {
        cooldown: Duration::ZERO,
        dispatch: DispatchConfig {
            desktop_debounce: debounce,
            ..DispatchConfig::default()
        },
        ..CoordinatorConfig::default()
    }
}

fn coordinator(
    store: &Arc<InMemoryDocumentStore>,
    broadcast: Arc<dyn Broadcast>,
    config: CoordinatorConfig,
) -> DocumentCoordinator {
    let store: Arc<dyn DocumentStore> = store.clone();
    DocumentCoordinator::new(store, broadcast, config, EventSink::disabled())
}

/// Background run loop that stops when the handle is dropped or stopped.
struct Running {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Running {
    fn start(coordinator: &DocumentCoordinator) -> Self {
        let (stop, stopped) = oneshot::channel::<()>();
        let coordinator = coordinator.clone();
        let task = tokio::spawn(async move {
            coordinator
                .run(async move {
                    let _ = stopped.await;
                })
                .await
        });
        Self {
            stop: Some(stop),
            task,
        }
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task).await.unwrap();
    }
}

fn ids(records: &[DocumentRecord]) -> Vec<&str> {
    records.iter().map(|r| r.id.as_str()).collect()
}

async fn load_lists(coordinator: &DocumentCoordinator) {
    for scope in Scope::LISTS {
        assert!(coordinator
            .load(&scope, RefreshOptions::default())
            .await
            .is_success());
    }
}

// ============================================================================
// Cross-context convergence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_bookmark_in_one_view_reaches_the_other() {
    let store = Arc::new(InMemoryDocumentStore::with_records(vec![
        doc("d1", 1),
        doc("d2", 2),
    ]));
    let bus_a = LocalBroadcast::new();
    let bus_b = bus_a.connect();
    let a = coordinator(&store, Arc::new(bus_a), config(Duration::from_millis(500)));
    let b = coordinator(&store, Arc::new(bus_b), config(Duration::from_millis(500)));

    load_lists(&a).await;
    load_lists(&b).await;
    let running_a = Running::start(&a);
    let running_b = Running::start(&b);
    tokio::task::yield_now().await;

    let d1 = DocumentId::from("d1");
    assert!(a.set_bookmark(&d1, true).await.is_applied());

    // a sees its own change immediately
    assert_eq!(ids(a.read(&Scope::Bookmarked).records()), vec!["d1"]);

    // b still shows the old snapshot until its debounce window closes
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.read(&Scope::Bookmarked).records().is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let bookmarked = b.read(&Scope::Bookmarked);
    assert_eq!(ids(bookmarked.records()), vec!["d1"]);
    assert!(bookmarked.records()[0].is_favorite);
    let active = b.read(&Scope::Active);
    assert!(active
        .records()
        .iter()
        .any(|r| r.id == d1 && r.is_favorite));

    running_a.stop().await;
    running_b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_changes_collapses_into_one_sync() {
    let store = Arc::new(InMemoryDocumentStore::with_records(vec![
        doc("d1", 1),
        doc("d2", 2),
        doc("d3", 3),
    ]));
    let bus_a = LocalBroadcast::new();
    let bus_b = bus_a.connect();
    let a = coordinator(&store, Arc::new(bus_a), config(Duration::from_millis(500)));
    let b = coordinator(&store, Arc::new(bus_b), config(Duration::from_millis(500)));

    // b only watches one scope
    assert!(b
        .load(&Scope::Active, RefreshOptions::default())
        .await
        .is_success());
    load_lists(&a).await;
    let running_b = Running::start(&b);
    tokio::task::yield_now().await;

    for id in ["d1", "d2", "d3"] {
        assert!(a.set_bookmark(&DocumentId::from(id), true).await.is_applied());
    }
    let calls_before = store.list_calls();

    tokio::time::sleep(Duration::from_secs(1)).await;
    // One forced refresh of b's single cached scope
    assert_eq!(store.list_calls(), calls_before + 1);
    assert!(b.read(&Scope::Active).records().iter().all(|r| r.is_favorite));

    running_b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_bulk_archive_propagates() {
    let store = Arc::new(InMemoryDocumentStore::with_records(vec![
        doc("d1", 1),
        doc("d2", 2),
        doc("d3", 3),
    ]));
    let bus_a = LocalBroadcast::new();
    let bus_b = bus_a.connect();
    let a = coordinator(&store, Arc::new(bus_a), config(Duration::from_millis(500)));
    let b = coordinator(&store, Arc::new(bus_b), config(Duration::from_millis(500)));
    load_lists(&a).await;
    load_lists(&b).await;
    let running_b = Running::start(&b);
    tokio::task::yield_now().await;

    assert!(a.select(&Scope::Active, &DocumentId::from("d1")));
    assert!(a.select(&Scope::Active, &DocumentId::from("d3")));
    let report = a.bulk(&Scope::Active, BulkAction::Archive).await;
    assert!(report.all_succeeded());
    assert_eq!(report.total(), 2);
    assert!(a.selected(&Scope::Active).is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ids(b.read(&Scope::Active).records()), vec!["d2"]);
    assert_eq!(ids(b.read(&Scope::Archived).records()), vec!["d1", "d3"]);

    running_b.stop().await;
}

#[tokio::test]
async fn test_shared_key_backing_converges() {
    let dir = tempfile::tempdir().unwrap();
    let poll = Duration::from_millis(20);
    let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("d1", 1)]));
    let a = coordinator(
        &store,
        Arc::new(SharedKeyBroadcast::open(dir.path(), poll).unwrap()),
        config(Duration::from_millis(50)),
    );
    let b = coordinator(
        &store,
        Arc::new(SharedKeyBroadcast::open(dir.path(), poll).unwrap()),
        config(Duration::from_millis(50)),
    );
    load_lists(&a).await;
    load_lists(&b).await;
    let running_b = Running::start(&b);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let d1 = DocumentId::from("d1");
    assert!(a.archive(&d1).await.is_applied());

    let converged = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if ids(b.read(&Scope::Archived).records()) == vec!["d1"] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "second view never saw the archive");
    assert!(b.read(&Scope::Active).records().is_empty());

    running_b.stop().await;
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rejected_mutation_rolls_back_and_reports() {
    let store = Arc::new(InMemoryDocumentStore::with_records(vec![doc("d1", 1)]));
    let (tx, mut events) = mpsc::channel(16);
    let dyn_store: Arc<dyn DocumentStore> = store.clone();
    let c = DocumentCoordinator::new(
        dyn_store,
        Arc::new(LocalBroadcast::new()),
        config(Duration::from_millis(500)),
        EventSink::new(tx),
    );
    load_lists(&c).await;

    let d1 = DocumentId::from("d1");
    store.fail_mutations_for(&d1);
    let outcome = c.set_bookmark(&d1, true).await;
    assert!(!outcome.is_applied());

    // The authoritative refresh put the record back
    assert!(c.read(&Scope::Bookmarked).records().is_empty());
    assert!(!c.read(&Scope::Active).records()[0].is_favorite);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::MutationFailed {
            document, action, ..
        } = event
        {
            assert_eq!(document, d1);
            assert_eq!(action, MutationKind::Bookmark);
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test(start_paused = true)]
async fn test_empty_scope_confirms_after_settle() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let c = coordinator(
        &store,
        Arc::new(LocalBroadcast::new()),
        config(Duration::from_millis(500)),
    );
    assert!(c
        .load(&Scope::Bookmarked, RefreshOptions::forced())
        .await
        .is_success());
    assert_eq!(c.read(&Scope::Bookmarked).display, DisplayState::Loading);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(c.read(&Scope::Bookmarked).display, DisplayState::Empty);
}
