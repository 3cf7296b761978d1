use super::Scope;
use crate::remote::DocumentId;
use std::fmt;
use tokio::sync::mpsc;

/// Which user-visible mutation an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Bookmark,
    ShareLink,
    RemoveShareLink,
    EditFields,
    Archive,
    Restore,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bookmark => "bookmark",
            Self::ShareLink => "share link",
            Self::RemoveShareLink => "remove share link",
            Self::EditFields => "edit",
            Self::Archive => "archive",
            Self::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// Notifications produced by the coordinator for the feedback layer.
///
/// Errors never propagate out of the sync layers as `Err`; consumers learn
/// about failures from these events and from typed outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A refresh wrote a new snapshot for `scope`.
    CacheUpdated {
        scope: Scope,
        generation: u64,
        count: usize,
    },
    /// A refresh with `show_feedback` failed after exhausting retries.
    RefreshFailed {
        scope: Scope,
        attempts: u32,
        error: String,
    },
    /// A mutation was rejected by the backend; the optimistic patch is being
    /// rolled back by a forced refresh.
    MutationFailed {
        document: DocumentId,
        action: MutationKind,
        error: String,
    },
    /// A bulk action finished (successfully or not) and the selection was cleared.
    BulkCompleted {
        scope: Scope,
        succeeded: usize,
        failed: usize,
    },
    /// A sync handler panicked; the panic was contained.
    TaskPanicked { task: &'static str, error: String },
}

/// Optional event channel; sending never blocks the sync layers.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SyncEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<SyncEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SyncEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            tracing::warn!(error = %e, "Sync event dropped (channel full or receiver dropped)");
        }
    }
}
