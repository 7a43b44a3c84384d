// Configuration Management for FX Sniper
// JSON file sections + FX_SNIPER_* environment overrides, hot-reloadable

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Configuration Structures
// ============================================================================

fn default_symbols() -> Vec<String> {
    ["EURUSD", "GBPUSD", "USDJPY", "AUDUSD", "USDCAD", "XAUUSD"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub url: String,
    pub symbols: Vec<String>,

    // Connection settings
    pub max_reconnect_attempts: u32,
    pub ping_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub stale_timeout_secs: u64,

    /// Bounded queue between feed and aggregator; oldest ticks drop on overflow
    pub tick_queue_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/ticks".to_string(),
            symbols: default_symbols(),
            max_reconnect_attempts: 10,
            ping_interval_secs: 20,
            health_check_interval_secs: 30,
            stale_timeout_secs: 60,
            tick_queue_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub symbols: Vec<String>,
    pub min_confidence: f64,
    pub cooldown_minutes: i64,
    pub max_signals_per_hour: u32,
    pub scan_interval_secs: u64,
    pub threshold_adjust_interval_secs: u64,
    pub base_lot_size: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            min_confidence: 60.0,
            cooldown_minutes: 10,
            max_signals_per_hour: 3,
            scan_interval_secs: 20,
            threshold_adjust_interval_secs: 900,
            base_lot_size: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_ticks: usize,
    pub max_m1: usize,
    pub max_m5: usize,
    pub max_m15: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_ticks: 1000,
            max_m1: 500,
            max_m5: 300,
            max_m15: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub zone_lookback: usize,          // M5 candles scanned for swing points
    pub zone_merge_pips: f64,          // swing points closer than this share a zone
    pub zone_buffer_pips: f64,         // excursion beyond a zone needed to count as a sweep
    pub zones_per_side: usize,
    pub delay_distance_pips: f64,
    pub min_reversal_pips: f64,
    pub completed_window_secs: i64,
    pub delay_expiry_secs: i64,
    pub sweep_boost: f64,
    pub active_sweep_timeout_secs: i64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            zone_lookback: 20,
            zone_merge_pips: 2.0,
            zone_buffer_pips: 1.5,
            zones_per_side: 3,
            delay_distance_pips: 5.0,
            min_reversal_pips: 3.0,
            completed_window_secs: 300,
            delay_expiry_secs: 1800,
            sweep_boost: 10.0,
            active_sweep_timeout_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub path: String,
    pub interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: "data/candle_snapshot.json".to_string(),
            interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub stable_after_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            base_backoff_secs: 2,
            max_backoff_secs: 240,
            stable_after_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub metrics_interval_secs: u64,
    pub config_reload_secs: u64,
    pub signal_log_path: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_logs: false,
            metrics_interval_secs: 60,
            config_reload_secs: 120,
            signal_log_path: Some("data/signals.jsonl".to_string()),
        }
    }
}

// ============================================================================
// Configuration Summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub symbols: Vec<String>,
    pub feed_url: String,
    pub min_confidence: f64,
    pub cooldown_minutes: i64,
    pub max_signals_per_hour: u32,
    pub scan_interval_secs: u64,
    pub log_level: String,
}

// ============================================================================
// Configuration Manager
// ============================================================================

pub struct ConfigManager {
    source: RwLock<Option<PathBuf>>,
    feed: Arc<RwLock<FeedConfig>>,
    pipeline: Arc<RwLock<PipelineConfig>>,
    buffers: Arc<RwLock<BufferConfig>>,
    guard: Arc<RwLock<GuardConfig>>,
    snapshot: Arc<RwLock<SnapshotConfig>>,
    supervisor: Arc<RwLock<SupervisorConfig>>,
    monitoring: Arc<RwLock<MonitoringConfig>>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self {
            source: RwLock::new(None),
            feed: Arc::new(RwLock::new(FeedConfig::default())),
            pipeline: Arc::new(RwLock::new(PipelineConfig::default())),
            buffers: Arc::new(RwLock::new(BufferConfig::default())),
            guard: Arc::new(RwLock::new(GuardConfig::default())),
            snapshot: Arc::new(RwLock::new(SnapshotConfig::default())),
            supervisor: Arc::new(RwLock::new(SupervisorConfig::default())),
            monitoring: Arc::new(RwLock::new(MonitoringConfig::default())),
        }
    }
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let manager = Self::default();

        // Load from file if provided
        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        // Environment wins over the file
        manager.load_from_env();
        manager.validate()?;

        info!("Configuration initialized");
        Ok(manager)
    }

    /// Load configuration from JSON file. A missing file keeps defaults.
    pub fn load_from_file(&self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        *self.source.write() = Some(path.to_path_buf());

        if !path.exists() {
            warn!(path = config_path, "Config file not found, using defaults");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        self.load_from_str(&content)?;

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Apply a JSON document of named sections. Unknown sections are ignored.
    pub fn load_from_str(&self, content: &str) -> Result<(), ConfigError> {
        let config_data: HashMap<String, serde_json::Value> = serde_json::from_str(content)?;

        if let Some(data) = config_data.get("feed") {
            *self.feed.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("pipeline") {
            *self.pipeline.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("buffers") {
            *self.buffers.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("guard") {
            *self.guard.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("snapshot") {
            *self.snapshot.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("supervisor") {
            *self.supervisor.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("monitoring") {
            *self.monitoring.write() = serde_json::from_value(data.clone())?;
        }

        Ok(())
    }

    /// Load overrides from FX_SNIPER_* environment variables
    pub fn load_from_env(&self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are logged and skipped.
    pub fn apply_overrides<F>(&self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key = key, value = %raw, "Ignoring unparseable environment override");
                    None
                }
            }
        }

        if let Some(symbols) = lookup("FX_SNIPER_SYMBOLS") {
            let list: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !list.is_empty() {
                self.pipeline.write().symbols = list.clone();
                self.feed.write().symbols = list;
            }
        }
        if let Some(v) = parsed::<f64>("FX_SNIPER_MIN_CONFIDENCE", lookup("FX_SNIPER_MIN_CONFIDENCE")) {
            self.pipeline.write().min_confidence = v;
        }
        if let Some(v) = parsed::<i64>("FX_SNIPER_COOLDOWN_MINUTES", lookup("FX_SNIPER_COOLDOWN_MINUTES")) {
            self.pipeline.write().cooldown_minutes = v;
        }
        if let Some(v) = parsed::<u32>("FX_SNIPER_MAX_SIGNALS_PER_HOUR", lookup("FX_SNIPER_MAX_SIGNALS_PER_HOUR")) {
            self.pipeline.write().max_signals_per_hour = v;
        }
        if let Some(v) = parsed::<u64>("FX_SNIPER_SCAN_INTERVAL_SECS", lookup("FX_SNIPER_SCAN_INTERVAL_SECS")) {
            self.pipeline.write().scan_interval_secs = v;
        }
        if let Some(v) = parsed::<u64>("FX_SNIPER_ADJUST_INTERVAL_SECS", lookup("FX_SNIPER_ADJUST_INTERVAL_SECS")) {
            self.pipeline.write().threshold_adjust_interval_secs = v;
        }
        if let Some(url) = lookup("FX_SNIPER_FEED_URL") {
            self.feed.write().url = url;
        }
        if let Some(level) = lookup("FX_SNIPER_LOG_LEVEL") {
            self.monitoring.write().log_level = level;
        }
    }

    /// Re-read the source file and environment. Candle state lives elsewhere
    /// and is untouched; a failed reload keeps the previous values.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = self.source.read().clone() else {
            self.load_from_env();
            return Ok(());
        };

        if !path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(&path)?;

        let staged = ConfigManager::default();
        staged.load_from_str(&content)?;
        staged.load_from_env();
        staged.validate()?;

        *self.feed.write() = staged.feed();
        *self.pipeline.write() = staged.pipeline();
        *self.buffers.write() = staged.buffers();
        *self.guard.write() = staged.guard();
        *self.snapshot.write() = staged.snapshot();
        *self.supervisor.write() = staged.supervisor();
        *self.monitoring.write() = staged.monitoring();

        info!(path = %path.display(), "Configuration reloaded");
        Ok(())
    }

    /// Save configuration to JSON file
    pub fn save_to_file(&self, config_path: &str) -> Result<(), ConfigError> {
        let mut config_map = HashMap::new();
        config_map.insert("feed", serde_json::to_value(&*self.feed.read())?);
        config_map.insert("pipeline", serde_json::to_value(&*self.pipeline.read())?);
        config_map.insert("buffers", serde_json::to_value(&*self.buffers.read())?);
        config_map.insert("guard", serde_json::to_value(&*self.guard.read())?);
        config_map.insert("snapshot", serde_json::to_value(&*self.snapshot.read())?);
        config_map.insert("supervisor", serde_json::to_value(&*self.supervisor.read())?);
        config_map.insert("monitoring", serde_json::to_value(&*self.monitoring.read())?);

        // Ensure parent directory exists
        if let Some(parent) = Path::new(config_path).parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&config_map)?;
        fs::write(config_path, json)?;

        info!(path = config_path, "Configuration saved");
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let pipeline = self.pipeline.read();
        let buffers = self.buffers.read();
        let guard = self.guard.read();
        let supervisor = self.supervisor.read();

        if pipeline.symbols.is_empty() {
            errors.push("at least one symbol is required".to_string());
        }
        if !(0.0..=100.0).contains(&pipeline.min_confidence) {
            errors.push("min_confidence must be between 0 and 100".to_string());
        }
        if pipeline.cooldown_minutes < 0 {
            errors.push("cooldown_minutes must not be negative".to_string());
        }
        if pipeline.scan_interval_secs == 0 {
            errors.push("scan_interval_secs must be positive".to_string());
        }
        if pipeline.threshold_adjust_interval_secs == 0 {
            errors.push("threshold_adjust_interval_secs must be positive".to_string());
        }
        if !(pipeline.base_lot_size > 0.0) {
            errors.push("base_lot_size must be positive".to_string());
        }
        if buffers.max_ticks == 0 || buffers.max_m1 == 0 || buffers.max_m5 == 0 || buffers.max_m15 == 0 {
            errors.push("buffer capacities must be positive".to_string());
        }
        if guard.delay_expiry_secs <= 0 || guard.completed_window_secs <= 0 {
            errors.push("guard windows must be positive".to_string());
        }
        if supervisor.base_backoff_secs == 0 || supervisor.max_backoff_secs < supervisor.base_backoff_secs {
            errors.push("supervisor backoff must satisfy 0 < base <= max".to_string());
        }

        if !errors.is_empty() {
            for error in &errors {
                warn!(error = %error, "Config validation error");
            }
            return Err(ConfigError::Validation(errors.join("; ")));
        }

        Ok(())
    }

    /// Get configuration summary
    pub fn get_summary(&self) -> ConfigSummary {
        let feed = self.feed.read();
        let pipeline = self.pipeline.read();
        let monitoring = self.monitoring.read();

        ConfigSummary {
            symbols: pipeline.symbols.clone(),
            feed_url: feed.url.clone(),
            min_confidence: pipeline.min_confidence,
            cooldown_minutes: pipeline.cooldown_minutes,
            max_signals_per_hour: pipeline.max_signals_per_hour,
            scan_interval_secs: pipeline.scan_interval_secs,
            log_level: monitoring.log_level.clone(),
        }
    }

    // Getters for each config section
    pub fn feed(&self) -> FeedConfig {
        self.feed.read().clone()
    }

    pub fn pipeline(&self) -> PipelineConfig {
        self.pipeline.read().clone()
    }

    pub fn buffers(&self) -> BufferConfig {
        self.buffers.read().clone()
    }

    pub fn guard(&self) -> GuardConfig {
        self.guard.read().clone()
    }

    pub fn snapshot(&self) -> SnapshotConfig {
        self.snapshot.read().clone()
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        self.supervisor.read().clone()
    }

    pub fn monitoring(&self) -> MonitoringConfig {
        self.monitoring.read().clone()
    }

    pub fn set_pipeline(&self, pipeline: PipelineConfig) {
        *self.pipeline.write() = pipeline;
    }

    pub fn set_guard(&self, guard: GuardConfig) {
        *self.guard.write() = guard;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_configs() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.cooldown_minutes, 10);
        assert_eq!(pipeline.max_signals_per_hour, 3);
        assert_eq!(pipeline.symbols.len(), 6);

        let buffers = BufferConfig::default();
        assert_eq!(buffers.max_m1, 500);
        assert_eq!(buffers.max_m15, 200);
    }

    #[test]
    fn test_config_manager_validates_defaults() {
        let manager = ConfigManager::default();
        assert!(manager.validate().is_ok());
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let manager = ConfigManager::default();
        manager
            .load_from_str(r#"{"pipeline": {"cooldown_minutes": 15}}"#)
            .unwrap();
        let pipeline = manager.pipeline();
        assert_eq!(pipeline.cooldown_minutes, 15);
        assert_eq!(pipeline.max_signals_per_hour, 3);
    }

    #[test]
    fn test_env_overrides() {
        let manager = ConfigManager::default();
        let env: HashMap<&str, &str> = [
            ("FX_SNIPER_SYMBOLS", "eurusd, gbpusd"),
            ("FX_SNIPER_MIN_CONFIDENCE", "72.5"),
            ("FX_SNIPER_COOLDOWN_MINUTES", "not-a-number"),
        ]
        .into_iter()
        .collect();
        manager.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        let pipeline = manager.pipeline();
        assert_eq!(pipeline.symbols, vec!["EURUSD", "GBPUSD"]);
        assert_eq!(pipeline.min_confidence, 72.5);
        assert_eq!(pipeline.cooldown_minutes, 10);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let manager = ConfigManager::default();
        manager
            .load_from_str(r#"{"pipeline": {"min_confidence": 140.0}}"#)
            .unwrap();
        assert!(matches!(manager.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_reload_picks_up_file_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"pipeline": {{"max_signals_per_hour": 5}}}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let manager = ConfigManager::new(Some(&path)).unwrap();
        assert_eq!(manager.pipeline().max_signals_per_hour, 5);

        std::fs::write(&path, r#"{"pipeline": {"max_signals_per_hour": 2}}"#).unwrap();
        manager.reload().unwrap();
        assert_eq!(manager.pipeline().max_signals_per_hour, 2);

        // Invalid content leaves the previous values in place
        std::fs::write(&path, r#"{"pipeline": {"scan_interval_secs": 0}}"#).unwrap();
        assert!(manager.reload().is_err());
        assert_eq!(manager.pipeline().max_signals_per_hour, 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let path = path.to_str().unwrap();

        let manager = ConfigManager::default();
        manager.set_pipeline(PipelineConfig { cooldown_minutes: 7, ..PipelineConfig::default() });
        manager.save_to_file(path).unwrap();

        let loaded = ConfigManager::default();
        loaded.load_from_file(path).unwrap();
        assert_eq!(loaded.pipeline().cooldown_minutes, 7);
    }
}
