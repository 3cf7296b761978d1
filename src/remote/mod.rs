//! Remote document store: the hosted backend the coordinator reads from and
//! writes to.
//!
//! The coordinator only ever talks to the backend through the
//! [`DocumentStore`] trait:
//!
//! - [`RestDocumentStore`] - HTTPS against the hosted REST gateway and the
//!   share-link function endpoint
//! - [`InMemoryDocumentStore`] - deterministic backing for tests and offline
//!   runs, with call counting and failure injection

mod memory;
mod rest;
mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{InMemoryDocumentStore, InjectedFailure};
pub use rest::{build_client, RestDocumentStore};
pub(crate) use types::DocumentRow;
pub use types::{
    DocumentCategory, DocumentFilter, DocumentId, DocumentPatch, DocumentRecord, ShareLink,
    UnknownCategory,
};

/// Errors returned by a [`DocumentStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Request timed out after {0}s")]
    Timeout(u64),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Rate limited by backend")]
    RateLimited,
    #[error("Invalid response body: {0}")]
    Decode(String),
    #[error("Document not found: {0}")]
    NotFound(DocumentId),
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
    #[error("Insecure backend URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
    /// Transient failure from a non-HTTP backing (used by the in-memory store).
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true if this error is transient and the request should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Timeout(_)
            | StoreError::Network(_)
            | StoreError::RateLimited
            | StoreError::Unavailable(_) => true,
            StoreError::HttpStatus(status) => *status >= 500,
            StoreError::Decode(_)
            | StoreError::NotFound(_)
            | StoreError::InvalidUrl(_)
            | StoreError::InsecureBaseUrl => false,
        }
    }
}

/// Request/response interface to the hosted document backend.
///
/// Implementations must be cheap to share (`Arc<dyn DocumentStore>`); every
/// call is an independent request with no client-side transaction.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// List non-archived documents matching `filter`, newest first.
    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<DocumentRecord>, StoreError>;

    /// List archived documents, newest first.
    async fn list_archived_documents(&self) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Set or clear the bookmark (favorite) flag.
    async fn update_bookmark(&self, id: &DocumentId, value: bool) -> Result<(), StoreError>;

    /// Create a public link valid for `expiry_hours`.
    async fn generate_share_link(
        &self,
        id: &DocumentId,
        expiry_hours: u32,
    ) -> Result<ShareLink, StoreError>;

    /// Revoke a previously generated public link.
    async fn remove_share_link(&self, id: &DocumentId) -> Result<(), StoreError>;

    /// Apply a partial update to a document.
    async fn update_document_fields(
        &self,
        id: &DocumentId,
        patch: &DocumentPatch,
    ) -> Result<(), StoreError>;
}
