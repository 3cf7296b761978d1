use super::{
    DocumentFilter, DocumentId, DocumentPatch, DocumentRecord, DocumentStore, ShareLink,
    StoreError,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// What an injected list failure does.
#[derive(Debug, Clone)]
pub enum InjectedFailure {
    /// Return a retryable `StoreError::Unavailable`.
    Transient,
    /// Return a non-retryable `StoreError::HttpStatus`.
    Status(u16),
    /// Panic inside the store call.
    Panic,
}

#[derive(Default)]
struct Inner {
    records: Vec<DocumentRecord>,
    list_failures: VecDeque<InjectedFailure>,
    list_delays: VecDeque<Duration>,
    failing_mutations: Vec<DocumentId>,
    list_call_times: Vec<Instant>,
}

/// In-memory [`DocumentStore`].
///
/// Plays the role of server truth for tests and offline runs: several
/// coordinators sharing one `Arc<InMemoryDocumentStore>` behave like several
/// tabs on the same account. List calls can be delayed or made to fail, and
/// every call is counted.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    inner: Mutex<Inner>,
    list_calls: AtomicUsize,
    mutation_calls: AtomicUsize,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<DocumentRecord>) -> Self {
        let store = Self::new();
        store.inner.lock().records = records;
        store
    }

    /// Insert or replace a record, as another client would.
    pub fn upsert(&self, record: DocumentRecord) {
        let mut inner = self.inner.lock();
        match inner.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => inner.records.push(record),
        }
    }

    pub fn remove(&self, id: &DocumentId) {
        self.inner.lock().records.retain(|r| &r.id != id);
    }

    pub fn get(&self, id: &DocumentId) -> Option<DocumentRecord> {
        self.inner.lock().records.iter().find(|r| &r.id == id).cloned()
    }

    /// Make the next list call(s) fail, in order.
    pub fn fail_next_lists(&self, failures: impl IntoIterator<Item = InjectedFailure>) {
        self.inner.lock().list_failures.extend(failures);
    }

    /// Delay the next list call(s) by the given durations, in order.
    pub fn delay_next_lists(&self, delays: impl IntoIterator<Item = Duration>) {
        self.inner.lock().list_delays.extend(delays);
    }

    /// Make every mutation on `id` fail with a non-retryable error.
    pub fn fail_mutations_for(&self, id: &DocumentId) {
        self.inner.lock().failing_mutations.push(id.clone());
    }

    /// Number of list calls (active or archived) received so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// When each list call arrived, in order.
    pub fn list_call_times(&self) -> Vec<Instant> {
        self.inner.lock().list_call_times.clone()
    }

    /// Number of mutation calls received so far.
    pub fn mutation_calls(&self) -> usize {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    async fn list_where(
        &self,
        keep: impl Fn(&DocumentRecord) -> bool,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let (delay, failure) = {
            let mut inner = self.inner.lock();
            inner.list_call_times.push(Instant::now());
            (inner.list_delays.pop_front(), inner.list_failures.pop_front())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(InjectedFailure::Transient) => {
                return Err(StoreError::Unavailable("injected transient failure".into()))
            }
            Some(InjectedFailure::Status(status)) => return Err(StoreError::HttpStatus(status)),
            Some(InjectedFailure::Panic) => panic!("injected store panic"),
            None => {}
        }

        // Snapshot taken after the delay, like a response assembled server-side
        let mut records: Vec<DocumentRecord> = self
            .inner
            .lock()
            .records
            .iter()
            .filter(|r| keep(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    fn mutate(
        &self,
        id: &DocumentId,
        f: impl FnOnce(&mut DocumentRecord),
    ) -> Result<(), StoreError> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if inner.failing_mutations.contains(id) {
            return Err(StoreError::HttpStatus(403));
        }
        let record = inner
            .records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        f(record);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<DocumentRecord>, StoreError> {
        let filter = DocumentFilter {
            archived: false,
            ..filter.clone()
        };
        self.list_where(|r| filter.matches(r)).await
    }

    async fn list_archived_documents(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        self.list_where(|r| r.is_archived).await
    }

    async fn update_bookmark(&self, id: &DocumentId, value: bool) -> Result<(), StoreError> {
        self.mutate(id, |r| r.is_favorite = value)
    }

    async fn generate_share_link(
        &self,
        id: &DocumentId,
        expiry_hours: u32,
    ) -> Result<ShareLink, StoreError> {
        let link = ShareLink {
            url: format!("https://share.invalid/{}", id),
            expires_at: Utc::now() + chrono::Duration::hours(i64::from(expiry_hours)),
        };
        let stored = link.clone();
        self.mutate(id, move |r| r.share = Some(stored))?;
        Ok(link)
    }

    async fn remove_share_link(&self, id: &DocumentId) -> Result<(), StoreError> {
        self.mutate(id, |r| r.share = None)
    }

    async fn update_document_fields(
        &self,
        id: &DocumentId,
        patch: &DocumentPatch,
    ) -> Result<(), StoreError> {
        self.mutate(id, |r| patch.apply_to(r))
    }
}
