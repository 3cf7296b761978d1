//! petdocs: client-side sync coordinator for pet-record documents.
//!
//! The library keeps a local view of a user's documents consistent across
//! several views, several contexts and an eventually-consistent hosted
//! backend. The `petdocs` binary drives it from the command line.

pub mod config;
pub mod remote;
pub mod sync;
pub mod util;

pub use remote::{DocumentId, DocumentRecord, DocumentStore, StoreError};
pub use sync::{DocumentCoordinator, RefreshOptions, RefreshOutcome, Scope};
