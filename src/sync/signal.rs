//! Sync triggers: cross-context broadcast, visibility/focus tracking and the
//! debounced dispatcher that turns triggers into refreshes.
//!
//! Several contexts (processes, or several coordinators in one process)
//! observe the same backend. After a successful mutation a context publishes
//! a [`DocumentsChanged`] signal; every other context receives it and
//! schedules a forced refresh. Two backings implement [`Broadcast`]:
//!
//! - [`LocalBroadcast`] - in-process `tokio::sync::broadcast` channel
//! - [`SharedKeyBroadcast`] - a shared persistent key (`document_updated`)
//!   stored as a file and watched with the platform's file notifications

use super::timing::Debouncer;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use notify::{Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Name of the shared persistent key.
pub const SHARED_KEY: &str = "document_updated";

/// Buffered signals per subscriber before the oldest are dropped.
const CHANNEL_CAPACITY: usize = 64;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(0);

/// Unique id for one publishing context.
fn new_origin() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed)
    )
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Failed to access shared key '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to watch '{path}': {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// "The documents changed somewhere; refetch."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentsChanged {
    pub timestamp: DateTime<Utc>,
    pub origin: String,
}

impl DocumentsChanged {
    fn now(origin: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            origin: origin.to_string(),
        }
    }

    /// Value stored under the shared key: `<rfc3339 timestamp> <origin>`.
    fn encode(&self) -> String {
        format!(
            "{} {}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.origin
        )
    }

    fn decode(raw: &str) -> Option<Self> {
        let (timestamp, origin) = raw.trim().split_once(' ')?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp).ok()?.with_timezone(&Utc);
        Some(Self {
            timestamp,
            origin: origin.to_string(),
        })
    }
}

/// Receiving end of a [`Broadcast`]; never yields the context's own signals.
pub struct Subscription {
    rx: broadcast::Receiver<DocumentsChanged>,
    origin: String,
}

impl Subscription {
    /// Next signal from another context, or `None` once the channel closes.
    pub async fn recv(&mut self) -> Option<DocumentsChanged> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.origin => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Any later signal triggers the same refresh
                    tracing::debug!(skipped, "Sync subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Backing-agnostic cross-context change signal.
#[async_trait]
pub trait Broadcast: Send + Sync {
    /// Identity of this context; own signals are filtered from subscriptions.
    fn origin(&self) -> &str;

    /// Tell every other context that documents changed.
    async fn publish(&self) -> Result<DocumentsChanged, SignalError>;

    /// Must be called from within a Tokio runtime.
    fn subscribe(&self) -> Subscription;
}

// ============================================================================
// In-process backing
// ============================================================================

/// In-process broadcast. Use [`connect`](Self::connect) to create one endpoint
/// per context on the same channel.
pub struct LocalBroadcast {
    tx: broadcast::Sender<DocumentsChanged>,
    origin: String,
}

impl Default for LocalBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroadcast {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            origin: new_origin(),
        }
    }

    /// Another endpoint (new origin) on the same channel.
    pub fn connect(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            origin: new_origin(),
        }
    }
}

#[async_trait]
impl Broadcast for LocalBroadcast {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn publish(&self) -> Result<DocumentsChanged, SignalError> {
        let event = DocumentsChanged::now(&self.origin);
        // No subscribers is fine: nobody else is listening
        let _ = self.tx.send(event.clone());
        Ok(event)
    }

    fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            origin: self.origin.clone(),
        }
    }
}

// ============================================================================
// Shared persistent key backing
// ============================================================================

/// Cross-process broadcast through a shared key file.
///
/// Publishing writes `<timestamp> <origin>` to `<dir>/document_updated`
/// (temp file + rename, so readers never see a partial value). A `notify`
/// watcher on `<dir>` reports changes to the key; on platforms without native
/// notifications it falls back to polling every `poll_interval`. Changes are
/// forwarded to subscribers by a task started on the first `subscribe`,
/// which stops on drop.
pub struct SharedKeyBroadcast {
    path: PathBuf,
    origin: String,
    tx: broadcast::Sender<DocumentsChanged>,
    /// Value present when this endpoint was opened; not reported as a change.
    initial: Option<String>,
    _watcher: Mutex<Box<dyn Watcher + Send>>,
    changes: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl SharedKeyBroadcast {
    pub fn open(dir: &Path, poll_interval: Duration) -> Result<Self, SignalError> {
        std::fs::create_dir_all(dir).map_err(|source| SignalError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(SHARED_KEY);

        // Watch before reading so no change can fall between the two
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let watcher = watch_key_dir(dir, poll_interval.max(Duration::from_millis(10)), changes_tx)
            .map_err(|source| SignalError::Watch {
                path: dir.to_path_buf(),
                source,
            })?;

        let initial = read_key(&path).map_err(|source| SignalError::Io {
            path: path.clone(),
            source,
        })?;
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Ok(Self {
            path,
            origin: new_origin(),
            tx,
            initial,
            _watcher: Mutex::new(watcher),
            changes: Mutex::new(Some(changes_rx)),
            forwarder: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_forwarder(&self) {
        let Some(mut changes) = self.changes.lock().take() else {
            return;
        };

        let path = self.path.clone();
        let origin = self.origin.clone();
        let tx = self.tx.clone();
        let mut last_seen = self.initial.clone();

        *self.forwarder.lock() = Some(tokio::spawn(async move {
            while changes.recv().await.is_some() {
                // Coalesce a burst of notifications into one read
                while changes.try_recv().is_ok() {}

                let current = match tokio::fs::read_to_string(&path).await {
                    Ok(raw) => Some(raw),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to read shared sync key");
                        continue;
                    }
                };
                if current == last_seen {
                    continue;
                }
                last_seen = current;

                let Some(event) = last_seen.as_deref().and_then(DocumentsChanged::decode) else {
                    continue;
                };
                if event.origin != origin {
                    tracing::debug!(from = %event.origin, "Shared sync key changed");
                    let _ = tx.send(event);
                }
            }
        }));
    }
}

/// Watch `dir` for writes to the shared key, signalling `changes` on each.
fn watch_key_dir(
    dir: &Path,
    poll_interval: Duration,
    changes: mpsc::UnboundedSender<()>,
) -> notify::Result<Box<dyn Watcher + Send>> {
    let handler = move |result: notify::Result<Event>| match result {
        Ok(event) => {
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) && event
                .paths
                .iter()
                .any(|p| p.file_name().is_some_and(|name| name == SHARED_KEY));
            if relevant {
                let _ = changes.send(());
            }
        }
        Err(e) => tracing::warn!(error = %e, "Shared sync key watcher error"),
    };
    let config = || notify::Config::default().with_poll_interval(poll_interval);

    match RecommendedWatcher::new(handler.clone(), config()) {
        Ok(mut watcher) => match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => return Ok(Box::new(watcher)),
            Err(e) => tracing::warn!(error = %e, "Native file watching failed; polling instead"),
        },
        Err(e) => tracing::warn!(error = %e, "Native file watcher unavailable; polling instead"),
    }

    let mut watcher = PollWatcher::new(handler, config().with_compare_contents(true))?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(Box::new(watcher))
}

#[async_trait]
impl Broadcast for SharedKeyBroadcast {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn publish(&self) -> Result<DocumentsChanged, SignalError> {
        let event = DocumentsChanged::now(&self.origin);
        let temp_path = self
            .path
            .with_extension(format!("tmp.{}", self.origin));
        let io_err = |source| SignalError::Io {
            path: self.path.clone(),
            source,
        };

        tokio::fs::write(&temp_path, event.encode())
            .await
            .map_err(io_err)?;
        if let Err(source) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }
        Ok(event)
    }

    fn subscribe(&self) -> Subscription {
        self.ensure_forwarder();
        Subscription {
            rx: self.tx.subscribe(),
            origin: self.origin.clone(),
        }
    }
}

impl Drop for SharedKeyBroadcast {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
    }
}

fn read_key(path: &Path) -> std::io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Visibility and focus
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Why a sync was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    BecameVisible,
    FocusGained,
    Broadcast { origin: String },
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::BecameVisible => f.write_str("visible"),
            Trigger::FocusGained => f.write_str("focus"),
            Trigger::Broadcast { origin } => write!(f, "broadcast from {}", origin),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

/// Turns raw visibility/focus reports into sync triggers.
///
/// Only a `Hidden -> Visible` transition and a focus gain request a sync;
/// repeated reports of the same state are ignored.
#[derive(Debug, Clone)]
pub struct VisibilityTracker {
    visibility: Visibility,
    focused: bool,
}

impl Default for VisibilityTracker {
    fn default() -> Self {
        Self {
            visibility: Visibility::Visible,
            focused: true,
        }
    }
}

impl VisibilityTracker {
    pub fn set_visibility(&mut self, visibility: Visibility) -> Option<Trigger> {
        let previous = std::mem::replace(&mut self.visibility, visibility);
        (previous == Visibility::Hidden && visibility == Visibility::Visible)
            .then_some(Trigger::BecameVisible)
    }

    pub fn set_focus(&mut self, focused: bool) -> Option<Trigger> {
        let previous = std::mem::replace(&mut self.focused, focused);
        (!previous && focused).then_some(Trigger::FocusGained)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Device class; selects the debounce interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown device class '{0}' (expected desktop or mobile)")]
pub struct UnknownDeviceClass(pub String);

impl FromStr for DeviceClass {
    type Err = UnknownDeviceClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(Self::Desktop),
            "mobile" => Ok(Self::Mobile),
            other => Err(UnknownDeviceClass(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub device: DeviceClass,
    pub desktop_debounce: Duration,
    pub mobile_debounce: Duration,
    /// Platform class this context runs as (free-form, e.g. `ios`).
    pub platform: Option<String>,
    /// Platform classes on which sync triggers are ignored.
    pub disabled_platforms: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            device: DeviceClass::Desktop,
            desktop_debounce: Duration::from_millis(500),
            mobile_debounce: Duration::from_millis(2000),
            platform: None,
            disabled_platforms: Vec::new(),
        }
    }
}

impl DispatchConfig {
    pub fn debounce(&self) -> Duration {
        match self.device {
            DeviceClass::Desktop => self.desktop_debounce,
            DeviceClass::Mobile => self.mobile_debounce,
        }
    }

    pub fn sync_enabled(&self) -> bool {
        match &self.platform {
            Some(platform) => !self
                .disabled_platforms
                .iter()
                .any(|p| p.eq_ignore_ascii_case(platform)),
            None => true,
        }
    }
}

/// Funnels every trigger through one trailing-edge debounce window.
#[derive(Debug)]
pub struct SyncDispatcher {
    debouncer: Debouncer,
    enabled: bool,
    platform: Option<String>,
    logged_disabled: bool,
}

impl SyncDispatcher {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            debouncer: Debouncer::new(config.debounce()),
            enabled: config.sync_enabled(),
            platform: config.platform.clone(),
            logged_disabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn interval(&self) -> Duration {
        self.debouncer.interval()
    }

    /// Record a trigger. Returns false if sync is disabled for this platform.
    pub fn trigger(&mut self, trigger: &Trigger, now: Instant) -> bool {
        if !self.enabled {
            if !self.logged_disabled {
                self.logged_disabled = true;
                tracing::info!(
                    platform = self.platform.as_deref().unwrap_or("unknown"),
                    "Automatic sync disabled on this platform; ignoring triggers"
                );
            }
            return false;
        }
        tracing::trace!(trigger = %trigger, "Sync trigger");
        self.debouncer.trigger(now);
        true
    }

    /// When the pending window closes, if a trigger is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    /// Consume the window if it has closed; returns the collapsed trigger count.
    pub fn fire(&mut self, now: Instant) -> Option<u32> {
        self.debouncer.fire(now)
    }
}
