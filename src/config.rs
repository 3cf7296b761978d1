//! Configuration file parser for ~/.config/petdocs/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Keys the parser does not recognise, at the top level or inside a section,
//! are skipped with a warning naming their dotted path.
use crate::sync::{
    CoordinatorConfig, DeviceClass, DispatchConfig, RetryPolicy, SettleDelays, StalenessPolicy,
};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding `api_key`.
pub const API_KEY_ENV: &str = "PETDOCS_API_KEY";
/// Environment variable overriding `access_token`.
pub const ACCESS_TOKEN_ENV: &str = "PETDOCS_ACCESS_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
///
/// Custom Debug impl masks `api_key` and `access_token` to prevent secret
/// leakage in logs, error messages, and debug output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the hosted backend (REST gateway and functions).
    pub backend_url: String,

    /// Public API key sent as `apikey` (alternative to PETDOCS_API_KEY).
    /// Env var takes precedence over config file.
    pub api_key: Option<String>,

    /// User access token sent as bearer token (alternative to PETDOCS_ACCESS_TOKEN).
    pub access_token: Option<String>,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    pub cache: CacheSettings,
    pub refresh: RefreshSettings,
    pub sync: SyncSettings,
    pub readiness: ReadinessSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: String::new(),
            api_key: None,
            access_token: None,
            request_timeout_secs: 20,
            cache: CacheSettings::default(),
            refresh: RefreshSettings::default(),
            sync: SyncSettings::default(),
            readiness: ReadinessSettings::default(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("backend_url", &self.backend_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("cache", &self.cache)
            .field("refresh", &self.refresh)
            .field("sync", &self.sync)
            .field("readiness", &self.readiness)
            .finish()
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Staleness threshold for scopes without an override.
    pub default_stale_minutes: u64,
    /// Upper bound on cached scopes (least recently used evicted first).
    pub max_scopes: usize,
    /// Per-scope-kind overrides: `active`, `bookmarked`, `archived`, `pet`.
    pub stale_minutes: HashMap<String, u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_stale_minutes: 5,
            max_scopes: 64,
            stale_minutes: HashMap::new(),
        }
    }
}

/// `[refresh]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First retry delay; doubles for each further retry.
    pub base_delay_ms: u64,
    /// How long a scope stays marked in flight after a successful refresh.
    pub cooldown_ms: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            cooldown_ms: 300,
        }
    }
}

/// Which cross-context backing to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastBacking {
    /// Shared key file in the data directory (works across processes).
    #[default]
    SharedKey,
    /// In-process channel only.
    Local,
}

/// `[sync]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub device: DeviceClass,
    pub desktop_debounce_ms: u64,
    pub mobile_debounce_ms: u64,
    /// Platform class of this client (e.g. "linux", "ios").
    pub platform: Option<String>,
    /// Platform classes on which automatic sync is turned off.
    pub disabled_platforms: Vec<String>,
    pub broadcast: BroadcastBacking,
    /// Polling interval for the shared key where the platform has no native
    /// file notifications.
    pub shared_key_poll_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            device: DeviceClass::Desktop,
            desktop_debounce_ms: 500,
            mobile_debounce_ms: 2000,
            platform: None,
            disabled_platforms: Vec::new(),
            broadcast: BroadcastBacking::SharedKey,
            shared_key_poll_ms: 1000,
        }
    }
}

/// `[readiness]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    pub populated_settle_ms: u64,
    pub empty_settle_ms: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            populated_settle_ms: 150,
            empty_settle_ms: 800,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 8] = [
        "backend_url",
        "api_key",
        "access_token",
        "request_timeout_secs",
        "cache",
        "refresh",
        "sync",
        "readiness",
    ];

    const SECTION_KEYS: [(&'static str, &'static [&'static str]); 4] = [
        ("cache", &["default_stale_minutes", "max_scopes", "stale_minutes"]),
        ("refresh", &["max_retries", "base_delay_ms", "cooldown_ms"]),
        (
            "sync",
            &[
                "device",
                "desktop_debounce_ms",
                "mobile_debounce_ms",
                "platform",
                "disabled_platforms",
                "broadcast",
                "shared_key_poll_ms",
            ],
        ),
        ("readiness", &["populated_settle_ms", "empty_settle_ms"]),
    ];

    /// Scope kinds accepted under `[cache.stale_minutes]`.
    const SCOPE_KINDS: [&'static str; 4] = ["active", "bookmarked", "archived", "pet"];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted and skipped, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to avoid loading a huge or corrupted file.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse the TOML content first as a raw table to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in Self::unknown_keys(&raw) {
                tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            backend = %config.backend_url,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Dotted paths of keys in `raw` that no setting reads.
    fn unknown_keys(raw: &toml::Table) -> Vec<String> {
        let mut unknown: Vec<String> = raw
            .keys()
            .filter(|key| !Self::KNOWN_KEYS.contains(&key.as_str()))
            .cloned()
            .collect();

        for (section, known) in Self::SECTION_KEYS {
            let Some(table) = raw.get(section).and_then(toml::Value::as_table) else {
                continue;
            };
            unknown.extend(
                table
                    .keys()
                    .filter(|key| !known.contains(&key.as_str()))
                    .map(|key| format!("{}.{}", section, key)),
            );
        }

        if let Some(overrides) = raw
            .get("cache")
            .and_then(|cache| cache.get("stale_minutes"))
            .and_then(toml::Value::as_table)
        {
            unknown.extend(
                overrides
                    .keys()
                    .filter(|kind| !Self::SCOPE_KINDS.contains(&kind.as_str()))
                    .map(|kind| format!("cache.stale_minutes.{}", kind)),
            );
        }
        unknown
    }

    /// Apply `PETDOCS_API_KEY` / `PETDOCS_ACCESS_TOKEN` over the file values.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var(API_KEY_ENV).ok(),
            std::env::var(ACCESS_TOKEN_ENV).ok(),
        )
    }

    fn with_overrides(mut self, api_key: Option<String>, access_token: Option<String>) -> Self {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(token) = access_token.filter(|t| !t.trim().is_empty()) {
            self.access_token = Some(token);
        }
        self
    }

    pub fn api_key(&self) -> Option<SecretString> {
        self.api_key.clone().map(SecretString::from)
    }

    pub fn access_token(&self) -> Option<SecretString> {
        self.access_token.clone().map(SecretString::from)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn shared_key_poll(&self) -> Duration {
        Duration::from_millis(self.sync.shared_key_poll_ms)
    }

    /// Sync-layer settings derived from this file.
    pub fn coordinator(&self) -> CoordinatorConfig {
        let minutes = |m: u64| Duration::from_secs(m.saturating_mul(60));
        CoordinatorConfig {
            staleness: StalenessPolicy {
                default: minutes(self.cache.default_stale_minutes),
                overrides: self
                    .cache
                    .stale_minutes
                    .iter()
                    .map(|(kind, m)| (kind.clone(), minutes(*m)))
                    .collect(),
            },
            max_scopes: self.cache.max_scopes,
            retry: RetryPolicy {
                max_retries: self.refresh.max_retries,
                // Retries always back off, even when configured as 0
                base_delay: Duration::from_millis(self.refresh.base_delay_ms.max(1)),
            },
            cooldown: Duration::from_millis(self.refresh.cooldown_ms),
            dispatch: DispatchConfig {
                device: self.sync.device,
                desktop_debounce: Duration::from_millis(self.sync.desktop_debounce_ms),
                mobile_debounce: Duration::from_millis(self.sync.mobile_debounce_ms),
                platform: self.sync.platform.clone(),
                disabled_platforms: self.sync.disabled_platforms.clone(),
            },
            settle: SettleDelays {
                populated: Duration::from_millis(self.readiness.populated_settle_ms),
                empty: Duration::from_millis(self.readiness.empty_settle_ms),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.backend_url.is_empty());
        assert_eq!(config.request_timeout_secs, 20);
        assert_eq!(config.cache.default_stale_minutes, 5);
        assert_eq!(config.refresh.max_retries, 3);
        assert_eq!(config.sync.broadcast, BroadcastBacking::SharedKey);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.request_timeout_secs, 20);
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (_dir, path) = write_config("   \n  \n  ");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.refresh.base_delay_ms, 500);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (_dir, path) = write_config("[refresh]\nmax_retries = 5\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.refresh.max_retries, 5);
        assert_eq!(config.refresh.base_delay_ms, 500); // default
        assert_eq!(config.readiness.empty_settle_ms, 800); // default
    }

    #[test]
    fn test_full_config() {
        let content = r#"
backend_url = "https://example.supabase.co"
api_key = "anon-key"
request_timeout_secs = 10

[cache]
default_stale_minutes = 2
max_scopes = 16

[cache.stale_minutes]
archived = 30

[refresh]
max_retries = 2
base_delay_ms = 250
cooldown_ms = 100

[sync]
device = "mobile"
mobile_debounce_ms = 3000
platform = "ios"
disabled_platforms = ["ios"]
broadcast = "local"

[readiness]
populated_settle_ms = 50
empty_settle_ms = 400
"#;
        let (_dir, path) = write_config(content);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.backend_url, "https://example.supabase.co");
        assert_eq!(config.api_key.as_deref(), Some("anon-key"));
        assert_eq!(config.sync.broadcast, BroadcastBacking::Local);

        let c = config.coordinator();
        assert_eq!(c.staleness.default, Duration::from_secs(120));
        assert_eq!(
            c.staleness.threshold(&crate::sync::Scope::Archived),
            Duration::from_secs(1800)
        );
        assert_eq!(c.max_scopes, 16);
        assert_eq!(c.retry.max_attempts(), 3);
        assert_eq!(c.retry.base_delay, Duration::from_millis(250));
        assert_eq!(c.cooldown, Duration::from_millis(100));
        assert_eq!(c.dispatch.debounce(), Duration::from_millis(3000));
        assert!(!c.dispatch.sync_enabled());
        assert_eq!(c.settle.empty, Duration::from_millis(400));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (_dir, path) = write_config("this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (_dir, path) = write_config("backend_url = \"https://x.test\"\ntotally_fake_key = 1\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.backend_url, "https://x.test");
    }

    #[test]
    fn test_unknown_keys_reported_inside_sections() {
        let raw: toml::Table = r#"
backend_url = "https://x.test"
colour = "blue"

[cache]
max_scopes = 8
max_scope = 9

[cache.stale_minutes]
archived = 30
archive = 10

[refresh]
cooldown = 100

[sync]
device = "desktop"

[readiness]
empty_settle_ms = 400
"#
        .parse()
        .unwrap();

        let mut unknown = Config::unknown_keys(&raw);
        unknown.sort();
        assert_eq!(
            unknown,
            vec![
                "cache.max_scope",
                "cache.stale_minutes.archive",
                "colour",
                "refresh.cooldown",
            ]
        );
    }

    #[test]
    fn test_zero_base_delay_still_backs_off() {
        let (_dir, path) = write_config("[refresh]\nbase_delay_ms = 0\n");
        let config = Config::load(&path).unwrap();
        let retry = config.coordinator().retry;
        assert_eq!(retry.base_delay, Duration::from_millis(1));
        assert!(retry.delay_for(0) > Duration::ZERO);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (_dir, path) = write_config("request_timeout_secs = \"soon\"\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_unknown_device_class_is_an_error() {
        let (_dir, path) = write_config("[sync]\ndevice = \"toaster\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (_dir, path) = write_config(&"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_env_overrides_take_precedence() {
        let config = Config {
            api_key: Some("from-file".to_string()),
            ..Config::default()
        }
        .with_overrides(Some("from-env".to_string()), Some("  ".to_string()));

        assert_eq!(config.api_key().unwrap().expose_secret(), "from-env");
        // Blank values are ignored
        assert!(config.access_token().is_none());
    }

    #[test]
    fn test_debug_masks_secrets() {
        let config = Config {
            api_key: Some("super-secret-key-12345".to_string()),
            access_token: Some("token-67890".to_string()),
            ..Config::default()
        };
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super-secret-key-12345"));
        assert!(!debug_output.contains("token-67890"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_debug_shows_none_when_no_secrets() {
        let debug_output = format!("{:?}", Config::default());
        assert!(!debug_output.contains("[REDACTED]"));
    }
}
