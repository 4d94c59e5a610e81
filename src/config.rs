use brainsync_core::{
    ConflictPolicy, DeletionPolicy, EntityKind, RetryPolicy, SyncSettings, WatchConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// `sync:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub deletion_policy: DeletionPolicy,
    pub max_workers: usize,
    pub queue_capacity: usize,
    /// Seconds between periodic full scans while watching; unset disables them.
    pub full_scan_interval_secs: Option<u64>,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            deletion_policy: DeletionPolicy::default(),
            max_workers: 4,
            queue_capacity: 1024,
            full_scan_interval_secs: None,
            retry_attempts: retry.max_attempts,
            retry_base_delay_ms: retry.base_delay.as_millis() as u64,
            retry_max_delay_ms: retry.max_delay.as_millis() as u64,
        }
    }
}

/// `watch:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    pub debounce_ms: u64,
    pub rename_window_ms: u64,
    /// Glob patterns relative to the vault root.
    pub ignore: Vec<String>,
    pub extensions: Vec<String>,
}

impl Default for WatchSection {
    fn default() -> Self {
        let watch = WatchConfig::default();
        Self {
            debounce_ms: watch.debounce.as_millis() as u64,
            rename_window_ms: watch.rename_window.as_millis() as u64,
            ignore: watch.ignore,
            extensions: watch.extensions,
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite database
    pub database_path: ConfigValue<PathBuf>,
    /// Root directory of the markdown vault
    pub vault_root: ConfigValue<PathBuf>,
    pub conflict_policy: ConfigValue<ConflictPolicy>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Entity kinds that take part in sync
    pub kinds: ConfigValue<Vec<EntityKind>>,
    pub sync: SyncConfig,
    pub watch: WatchSection,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    vault_root: Option<PathBuf>,
    conflict_policy: Option<ConflictPolicy>,
    kinds: Option<Vec<EntityKind>>,
    sync: Option<SyncConfig>,
    watch: Option<WatchSection>,
}

/// Resolve relative paths against the config file's directory
fn resolve_relative(config_path: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() {
        config_path
            .parent()
            .map(|p| p.join(&path))
            .unwrap_or(path)
    } else {
        path
    }
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut database_path = ConfigValue::new(
            Self::default_data_dir().join("brainsync.db"),
            ConfigSource::Default,
        );
        let mut vault_root = ConfigValue::new(Self::default_vault_root(), ConfigSource::Default);
        let mut conflict_policy = ConfigValue::new(ConflictPolicy::default(), ConfigSource::Default);
        let mut kinds = ConfigValue::new(EntityKind::ALL.to_vec(), ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncConfig::default();
        let mut watch = WatchSection::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                database_path =
                    ConfigValue::new(resolve_relative(&path, db_path), ConfigSource::File);
            }
            if let Some(root) = file_config.vault_root {
                vault_root = ConfigValue::new(resolve_relative(&path, root), ConfigSource::File);
            }
            if let Some(policy) = file_config.conflict_policy {
                conflict_policy = ConfigValue::new(policy, ConfigSource::File);
            }
            if let Some(file_kinds) = file_config.kinds {
                kinds = ConfigValue::new(file_kinds, ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
            if let Some(watch_config) = file_config.watch {
                watch = watch_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("BRAINSYNC_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(root) = std::env::var("BRAINSYNC_VAULT_ROOT") {
            vault_root = ConfigValue::new(PathBuf::from(root), ConfigSource::Environment);
        }
        if let Ok(policy) = std::env::var("BRAINSYNC_CONFLICT_POLICY") {
            let policy = policy
                .parse::<ConflictPolicy>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "BRAINSYNC_CONFLICT_POLICY",
                    message,
                })?;
            conflict_policy = ConfigValue::new(policy, ConfigSource::Environment);
        }

        if kinds.value.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "kinds",
                message: "at least one entity kind must be enabled".to_string(),
            });
        }

        Ok(Self {
            database_path,
            vault_root,
            conflict_policy,
            config_file,
            kinds,
            sync,
            watch,
        })
    }

    /// Builds the engine's settings, resolved once at startup.
    pub fn sync_settings(&self) -> SyncSettings {
        let mut settings = SyncSettings::new(&self.vault_root.value);
        settings.kinds = self.kinds.value.iter().copied().collect();
        settings.conflict_policy = self.conflict_policy.value;
        settings.deletion_policy = self.sync.deletion_policy;
        settings.max_workers = self.sync.max_workers.max(1);
        settings.queue_capacity = self.sync.queue_capacity.max(1);
        settings.full_scan_interval = self
            .sync
            .full_scan_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        settings.retry = RetryPolicy {
            max_attempts: self.sync.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.sync.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.sync.retry_max_delay_ms),
        };
        settings.watch = WatchConfig {
            debounce: Duration::from_millis(self.watch.debounce_ms),
            rename_window: Duration::from_millis(self.watch.rename_window_ms),
            ignore: self.watch.ignore.clone(),
            extensions: self.watch.extensions.clone(),
            ..WatchConfig::default()
        };
        settings
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/brainsync/
    /// - macOS: ~/Library/Application Support/brainsync/
    /// - Windows: %APPDATA%/brainsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("brainsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/brainsync/
    /// - macOS: ~/Library/Application Support/brainsync/
    /// - Windows: %APPDATA%/brainsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("brainsync")
    }

    /// Default vault location: ~/SecondBrain
    pub fn default_vault_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("SecondBrain")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue { key: &'static str, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue { key, message } => {
                write!(f, "Invalid value for {}: {}", key, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
