//! Utility functions shared by the store, engine and CLI.
//!
//! - **URL validation**: HTTPS enforcement for the backend base URL
//! - **Panic containment**: converting panics in background work into errors

mod url_validator;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;

pub use url_validator::{validate_base_url, UrlValidationError};

/// Wraps a future to catch panics and convert them to errors.
///
/// Sync handlers run on background tasks; a panic inside one must resolve to
/// a failed outcome instead of silently killing the task and leaving an
/// in-flight marker set forever.
///
/// # Returns
///
/// - `Ok(result)` if the future completes normally
/// - `Err(panic_message)` if the future panics
pub async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| {
            if let Some(s) = panic.downcast_ref::<&'static str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic payload".to_string()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catch_task_panic_ok() {
        assert_eq!(catch_task_panic(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_catch_task_panic_message() {
        let result: Result<(), String> = catch_task_panic(async { panic!("boom") }).await;
        assert_eq!(result, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_catch_task_panic_formatted_message() {
        let id = 3;
        let result: Result<(), String> =
            catch_task_panic(async move { panic!("bad record {}", id) }).await;
        assert_eq!(result, Err("bad record 3".to_string()));
    }
}
