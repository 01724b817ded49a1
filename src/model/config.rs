use serde::{Deserialize, Serialize};

/// Configuration from taskpixel.toml in the data directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Key the document is persisted under
    #[serde(default = "default_key")]
    pub key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig { key: default_key() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Run the periodic integrity sweep
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// React to storage-changed notifications
    #[serde(default = "default_true")]
    pub storage_event_sync: bool,
    /// Reload when another process rewrites the document
    #[serde(default = "default_true")]
    pub cross_tab_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            auto_sync: true,
            interval_ms: default_interval_ms(),
            storage_event_sync: true,
            cross_tab_sync: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
    #[serde(default = "default_true")]
    pub allow_create: bool,
    #[serde(default = "default_true")]
    pub show_usage_count: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            debounce_ms: default_debounce_ms(),
            max_suggestions: default_max_suggestions(),
            allow_create: true,
            show_usage_count: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// tracing-subscriber filter directive, e.g. "info" or "taskpixel=debug"
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_key() -> String {
    "taskpixel_data".to_string()
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_max_suggestions() -> usize {
    8
}

fn default_level() -> String {
    "warn".to_string()
}
