//! Configuration for the sync coordinator.
//!
//! Configuration is passed to [`SyncCoordinator::new()`](crate::SyncCoordinator::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use table_sync::config::SyncConfig;
//!
//! let config = SyncConfig {
//!     set_name: "orders".into(),
//!     ..SyncConfig::for_testing("orders")
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── set_name: String              # Identity of the synchronized table set
//! ├── source: SourceConfig          # Replication slot and publication
//! ├── target: TargetConfig          # Target pool, renames, key overrides
//! ├── checkpoint: CheckpointConfig  # SQLite checkpoint store and lease
//! └── settings: SyncSettings
//!     ├── reader: ReaderConfig      # Event queue, keepalive interval
//!     ├── buffer: BufferSettings    # Ordering buffer capacity
//!     ├── apply: ApplySettings      # Retry ceiling and backoff
//!     └── shutdown: ShutdownConfig  # Drain timeout
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "set_name": "orders",
//!   "source": {
//!     "connection_string": "postgres://repl@primary/shop",
//!     "slot_name": "orders_slot",
//!     "publication": "orders_pub"
//!   },
//!   "target": {
//!     "database_url": "postgres://sync@replica/shop",
//!     "table_mappings": { "public.orders": "archive.orders" }
//!   },
//!   "checkpoint": { "sqlite_path": "/var/lib/table-sync/checkpoints.db" },
//!   "settings": {
//!     "apply": { "max_attempts": 5, "initial_backoff": "100ms", "max_backoff": "30s" }
//!   }
//! }
//! ```

use crate::batch::BufferConfig;
use crate::checkpoint::IN_MEMORY_PATH;
use crate::error::{Result, SyncError};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `SyncCoordinator::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Name of the synchronized table set. Checkpoints and the lease are
    /// keyed by it.
    pub set_name: String,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub settings: SyncSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            set_name: "default".to_string(),
            source: SourceConfig::default(),
            target: TargetConfig::default(),
            checkpoint: CheckpointConfig::default(),
            settings: SyncSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Parse from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SyncError::Config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Reject configurations the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.set_name.trim().is_empty() {
            return Err(SyncError::Config("set_name must not be empty".into()));
        }
        if self.checkpoint.sqlite_path.is_empty() {
            return Err(SyncError::Config("checkpoint.sqlite_path must not be empty".into()));
        }
        if self.checkpoint.holder_id.is_empty() {
            return Err(SyncError::Config("checkpoint.holder_id must not be empty".into()));
        }

        parse_duration("checkpoint.lease_ttl", &self.checkpoint.lease_ttl)?;
        parse_duration("settings.reader.keepalive_interval", &self.settings.reader.keepalive_interval)?;
        parse_duration("settings.apply.initial_backoff", &self.settings.apply.initial_backoff)?;
        parse_duration("settings.apply.max_backoff", &self.settings.apply.max_backoff)?;
        parse_duration("settings.shutdown.drain_timeout", &self.settings.shutdown.drain_timeout)?;
        parse_duration("target.acquire_timeout", &self.target.acquire_timeout)?;

        if self.settings.reader.event_queue_capacity == 0
            || self.settings.buffer.batch_queue_capacity == 0
        {
            return Err(SyncError::Config("queue capacities must be at least 1".into()));
        }
        if self.settings.buffer.max_buffered_events == 0 {
            return Err(SyncError::Config(
                "settings.buffer.max_buffered_events must be at least 1".into(),
            ));
        }
        if self.settings.apply.max_attempts == 0 {
            return Err(SyncError::Config(
                "settings.apply.max_attempts must be at least 1".into(),
            ));
        }
        if !(self.settings.apply.backoff_factor >= 1.0) {
            return Err(SyncError::Config(
                "settings.apply.backoff_factor must be >= 1.0".into(),
            ));
        }
        for (source, keys) in &self.target.key_columns {
            if keys.is_empty() {
                return Err(SyncError::Config(format!(
                    "target.key_columns[{}] must name at least one column",
                    source
                )));
            }
        }
        Ok(())
    }

    /// Create a minimal config for testing: in-memory checkpoint store,
    /// small buffers, millisecond backoff.
    pub fn for_testing(set_name: &str) -> Self {
        Self {
            set_name: set_name.to_string(),
            source: SourceConfig::default(),
            target: TargetConfig::default(),
            checkpoint: CheckpointConfig::in_memory(),
            settings: SyncSettings::for_testing(),
        }
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| SyncError::Config(format!("{}: invalid duration {:?}: {}", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Replication source identity.
///
/// The coordinator receives an already-built
/// [`SourceConnector`](crate::stream::SourceConnector); these values tell the
/// connector which slot and publication to stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Replication connection string (`replication=database`).
    #[serde(default)]
    pub connection_string: String,

    #[serde(default = "default_slot_name")]
    pub slot_name: String,

    #[serde(default = "default_publication")]
    pub publication: String,

    /// pgoutput protocol version. 2 enables streamed in-progress transactions.
    #[serde(default = "default_proto_version")]
    pub proto_version: u32,
}

fn default_slot_name() -> String {
    "table_sync".to_string()
}

fn default_publication() -> String {
    "table_sync_pub".to_string()
}

fn default_proto_version() -> u32 {
    1
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            slot_name: default_slot_name(),
            publication: default_publication(),
            proto_version: default_proto_version(),
        }
    }
}

impl SourceConfig {
    /// The `START_REPLICATION` command a connector sends for `start`.
    pub fn start_replication_command(&self, start: crate::event::Lsn) -> String {
        let mut options = format!(
            "proto_version '{}', publication_names '{}'",
            self.proto_version,
            self.publication.replace('\'', "''")
        );
        if self.proto_version >= 2 {
            options.push_str(", streaming 'on'");
        }
        format!(
            "START_REPLICATION SLOT \"{}\" LOGICAL {} ({})",
            self.slot_name.replace('"', "\"\""),
            start,
            options
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TargetConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Target database and table routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub database_url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Pool acquire timeout (humantime string, e.g. "5s").
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: String,

    /// Source table → target table, both `schema.name` (bare names mean
    /// `public`). Unmapped tables keep their source name.
    #[serde(default)]
    pub table_mappings: HashMap<String, String>,

    /// Source table → key columns, overriding the replica identity.
    #[serde(default)]
    pub key_columns: HashMap<String, Vec<String>>,
}

fn default_max_connections() -> u32 {
    4
}

fn default_acquire_timeout() -> String {
    "5s".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
            table_mappings: HashMap::new(),
            key_columns: HashMap::new(),
        }
    }
}

impl TargetConfig {
    pub fn acquire_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.acquire_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence and lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to SQLite database for checkpoint storage. `":memory:"` keeps
    /// everything in process (tests only; nothing survives a restart).
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Lease lifetime; renewed every third of it.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: String,

    /// This instance's lease holder id.
    #[serde(default = "default_holder_id")]
    pub holder_id: String,
}

fn default_sqlite_path() -> String {
    "table_sync_checkpoints.db".to_string()
}

fn default_lease_ttl() -> String {
    "30s".to_string()
}

fn default_holder_id() -> String {
    format!("table-sync-{}", std::process::id())
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            lease_ttl: default_lease_ttl(),
            holder_id: default_holder_id(),
        }
    }
}

impl CheckpointConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: IN_MEMORY_PATH.to_string(),
            ..Self::default()
        }
    }

    pub fn lease_ttl_duration(&self) -> Duration {
        humantime::parse_duration(&self.lease_ttl).unwrap_or(Duration::from_secs(30))
    }

    /// How often the holder renews its lease.
    pub fn lease_renew_interval(&self) -> Duration {
        (self.lease_ttl_duration() / 3).max(Duration::from_millis(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables for the three pipeline stages and shutdown.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncSettings {
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub buffer: BufferSettings,
    #[serde(default)]
    pub apply: ApplySettings,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl SyncSettings {
    pub fn for_testing() -> Self {
        Self {
            reader: ReaderConfig {
                event_queue_capacity: 16,
                keepalive_interval: "50ms".to_string(),
            },
            buffer: BufferSettings {
                max_buffered_events: BufferConfig::testing().max_buffered_events,
                batch_queue_capacity: 2,
            },
            apply: ApplySettings {
                max_attempts: 5,
                initial_backoff: "1ms".to_string(),
                max_backoff: "10ms".to_string(),
                backoff_factor: 2.0,
            },
            shutdown: ShutdownConfig {
                drain_timeout: "2s".to_string(),
            },
        }
    }
}

/// Change stream reader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Capacity of the reader → buffer queue, in stream items.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Status update interval while paused or idle (humantime string).
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: String,
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_keepalive_interval() -> String {
    "10s".to_string()
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: default_event_queue_capacity(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

impl ReaderConfig {
    pub fn keepalive_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.keepalive_interval).unwrap_or(Duration::from_secs(10))
    }
}

/// Ordering buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSettings {
    /// Pause the reader once more events than this are held.
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,

    /// Capacity of the buffer → applier queue, in batches.
    #[serde(default = "default_batch_queue_capacity")]
    pub batch_queue_capacity: usize,
}

fn default_max_buffered_events() -> usize {
    BufferConfig::default().max_buffered_events
}

fn default_batch_queue_capacity() -> usize {
    16
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_buffered_events: default_max_buffered_events(),
            batch_queue_capacity: default_batch_queue_capacity(),
        }
    }
}

impl BufferSettings {
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            max_buffered_events: self.max_buffered_events,
        }
    }
}

/// Apply retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySettings {
    /// Attempts per batch before it is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,

    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_backoff() -> String {
    "100ms".to_string()
}

fn default_max_backoff() -> String {
    "30s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl ApplySettings {
    /// Backoff policy for the retry controller.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: humantime::parse_duration(&self.initial_backoff)
                .unwrap_or(Duration::from_millis(100)),
            max_delay: humantime::parse_duration(&self.max_backoff)
                .unwrap_or(Duration::from_secs(30)),
            backoff_factor: self.backoff_factor,
            ..RetryConfig::default()
        }
    }
}

/// Shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long `stop()` waits for tasks before abandoning them.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
