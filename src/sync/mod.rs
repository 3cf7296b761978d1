//! Client-side document synchronisation.
//!
//! Leaf-first:
//!
//! - [`timing`] - backoff, debounce and cooldown arithmetic
//! - [`cache`] - per-scope snapshots with staleness and generations
//! - [`refresh`] - deduplicated, retried refetches
//! - [`signal`] - cross-context broadcast, visibility tracking, dispatcher
//! - [`readiness`] - deferred empty-state decisions
//! - [`selection`] - multi-select and bulk actions
//! - [`coordinator`] - the entry point tying them together

pub mod cache;
pub mod coordinator;
pub mod events;
pub mod readiness;
pub mod refresh;
mod scope;
pub mod selection;
pub mod signal;
pub mod timing;

pub use cache::{CacheEntry, CommitResult, DocumentCache, StalenessPolicy};
pub use coordinator::{CoordinatorConfig, DocumentCoordinator, MutationOutcome, ScopeView};
pub use events::{EventSink, MutationKind, SyncEvent};
pub use readiness::{DisplayState, ReadinessBoard, ReadinessGate, ReadinessState, SettleDelays};
pub use refresh::{RefreshEngine, RefreshOptions, RefreshOutcome};
pub use scope::{Scope, ScopeParseError};
pub use selection::{BulkAction, BulkReport, SelectionSet};
pub use signal::{
    Broadcast, DeviceClass, DispatchConfig, DocumentsChanged, LocalBroadcast, SharedKeyBroadcast,
    SignalError, Subscription, SyncDispatcher, Trigger, Visibility, VisibilityTracker,
};
pub use timing::{Debouncer, RetryPolicy};
