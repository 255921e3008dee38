use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Application configuration.
///
/// Defaults cover every field; the environment variables documented on
/// each struct override them, read once at startup. An optional YAML
/// file named by `CINESYNC_CONFIG` seeds the defaults before the
/// environment is applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sync: SyncConfig,
    pub upload: UploadConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Listener configuration. `SYNC_HTTP_PORT` / `SYNC_WS_PORT` override
/// the primary ports; the fallback lists are tried in order when a
/// bind fails with address-in-use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub http_fallback_ports: Vec<u16>,
    pub ws_port: u16,
    pub ws_fallback_ports: Vec<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            http_fallback_ports: vec![8081, 8082, 8083, 8084, 8085],
            ws_port: 8081,
            ws_fallback_ports: vec![8082, 8083, 8084, 8085, 8086],
        }
    }
}

/// Sync-channel tuning. Millisecond knobs map to `SYNC_LEAD_MS`,
/// `SYNC_DRIFT_INTERVAL_MS`, `SYNC_SPEED_COOLDOWN_MS`,
/// `SYNC_SEEK_COOLDOWN_MS` and `SYNC_INITIAL_PLAYBACK_COOLDOWN_MS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Predictive-start lead added to "now" for targetStartTime.
    pub lead_ms: u64,
    /// Master timeline sampling cadence.
    pub sample_interval_ms: u64,
    /// sync_check cadence while playing.
    pub sync_check_interval_ms: u64,
    /// Follower drift-monitor cadence.
    pub drift_interval_ms: u64,
    pub speed_cooldown_ms: u64,
    pub seek_cooldown_ms: u64,
    /// Window after first playback during which seeks are suppressed.
    pub initial_playback_cooldown_ms: u64,
    /// A device not ready this long after load is surfaced as degraded.
    pub ready_timeout_ms: u64,
    /// A device silent this long is dropped on the next broadcast.
    pub silence_timeout_ms: u64,
    pub join_timeout_ms: u64,
    /// Unsolicited status-report cadence while playing.
    pub report_interval_ms: u64,
    pub pin_digits: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lead_ms: 500,
            sample_interval_ms: 250,
            sync_check_interval_ms: 5_000,
            drift_interval_ms: 5_000,
            speed_cooldown_ms: 2_000,
            seek_cooldown_ms: 10_000,
            initial_playback_cooldown_ms: 15_000,
            ready_timeout_ms: 15_000,
            silence_timeout_ms: 30_000,
            join_timeout_ms: 10_000,
            report_interval_ms: 1_000,
            pin_digits: 6,
        }
    }
}

/// Upload-endpoint tuning (`TUS_MAX_UPLOAD_BYTES`,
/// `TUS_SESSION_EXPIRY_HOURS`, `TUS_CLEANUP_INTERVAL_HOURS`,
/// `UPLOAD_PIN_DIGITS`, `UPLOAD_SCRATCH_DIR`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Advertised Tus-Max-Size. When unset, the media store's free
    /// bytes minus the reserve are advertised instead.
    pub max_upload_bytes: Option<u64>,
    /// Free space that must remain after an upload is admitted.
    pub reserve_bytes: u64,
    pub session_expiry_hours: u64,
    pub cleanup_interval_hours: u64,
    pub pin_digits: u32,
    /// Directory swept for temp files embedding an expired upload-id.
    pub scratch_dir: Option<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: None,
            reserve_bytes: 500 * 1024 * 1024,
            session_expiry_hours: 24,
            cleanup_interval_hours: 6,
            pin_digits: 4,
            scratch_dir: None,
        }
    }
}

/// SQLite location for the upload-session table (`SYNC_DB_PATH`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "cinesync.db".to_string(),
        }
    }
}

/// Logging knobs (`SYNC_LOG_LEVEL`, `SYNC_LOG_FORMAT`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json".
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Flat view of the environment variables this process honors.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvOverrides {
    sync_http_port: Option<u16>,
    sync_ws_port: Option<u16>,
    sync_lead_ms: Option<u64>,
    sync_drift_interval_ms: Option<u64>,
    sync_speed_cooldown_ms: Option<u64>,
    sync_seek_cooldown_ms: Option<u64>,
    sync_initial_playback_cooldown_ms: Option<u64>,
    tus_max_upload_bytes: Option<u64>,
    tus_session_expiry_hours: Option<u64>,
    tus_cleanup_interval_hours: Option<u64>,
    upload_pin_digits: Option<u32>,
    upload_scratch_dir: Option<String>,
    sync_db_path: Option<String>,
    sync_log_level: Option<String>,
    sync_log_format: Option<String>,
}

impl Config {
    /// Load configuration: file (optional) then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut base = match std::env::var("CINESYNC_CONFIG") {
            Ok(path) => ConfigBuilder::builder()
                .add_source(File::new(&path, config::FileFormat::Yaml))
                .build()?
                .try_deserialize::<Self>()?,
            Err(_) => Self::default(),
        };

        let env = ConfigBuilder::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?;
        let overrides: EnvOverrides = env.try_deserialize()?;
        base.apply_env(overrides);
        Ok(base)
    }

    fn apply_env(&mut self, env: EnvOverrides) {
        if let Some(port) = env.sync_http_port {
            self.server.http_port = port;
        }
        if let Some(port) = env.sync_ws_port {
            self.server.ws_port = port;
        }
        if let Some(ms) = env.sync_lead_ms {
            self.sync.lead_ms = ms;
        }
        if let Some(ms) = env.sync_drift_interval_ms {
            self.sync.drift_interval_ms = ms;
        }
        if let Some(ms) = env.sync_speed_cooldown_ms {
            self.sync.speed_cooldown_ms = ms;
        }
        if let Some(ms) = env.sync_seek_cooldown_ms {
            self.sync.seek_cooldown_ms = ms;
        }
        if let Some(ms) = env.sync_initial_playback_cooldown_ms {
            self.sync.initial_playback_cooldown_ms = ms;
        }
        if let Some(bytes) = env.tus_max_upload_bytes {
            self.upload.max_upload_bytes = Some(bytes);
        }
        if let Some(hours) = env.tus_session_expiry_hours {
            self.upload.session_expiry_hours = hours;
        }
        if let Some(hours) = env.tus_cleanup_interval_hours {
            self.upload.cleanup_interval_hours = hours;
        }
        if let Some(digits) = env.upload_pin_digits {
            self.upload.pin_digits = digits;
        }
        if let Some(dir) = env.upload_scratch_dir {
            self.upload.scratch_dir = Some(dir);
        }
        if let Some(path) = env.sync_db_path {
            self.database.path = path;
        }
        if let Some(level) = env.sync_log_level {
            self.logging.level = level;
        }
        if let Some(format) = env.sync_log_format {
            self.logging.format = format;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.http_fallback_ports, vec![8081, 8082, 8083, 8084, 8085]);
        assert_eq!(config.server.ws_port, 8081);
        assert_eq!(config.sync.lead_ms, 500);
        assert_eq!(config.sync.drift_interval_ms, 5_000);
        assert_eq!(config.sync.speed_cooldown_ms, 2_000);
        assert_eq!(config.sync.seek_cooldown_ms, 10_000);
        assert_eq!(config.sync.initial_playback_cooldown_ms, 15_000);
        assert_eq!(config.sync.pin_digits, 6);
        assert_eq!(config.upload.pin_digits, 4);
        assert_eq!(config.upload.session_expiry_hours, 24);
        assert_eq!(config.upload.cleanup_interval_hours, 6);
        assert_eq!(config.upload.reserve_bytes, 500 * 1024 * 1024);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config.apply_env(EnvOverrides {
            sync_http_port: Some(9090),
            sync_lead_ms: Some(750),
            tus_session_expiry_hours: Some(48),
            upload_pin_digits: Some(6),
            sync_db_path: Some("/data/uploads.db".to_string()),
            ..EnvOverrides::default()
        });

        assert_eq!(config.server.http_port, 9090);
        assert_eq!(config.sync.lead_ms, 750);
        assert_eq!(config.upload.session_expiry_hours, 48);
        assert_eq!(config.upload.pin_digits, 6);
        assert_eq!(config.database.path, "/data/uploads.db");
        // Untouched fields keep their defaults.
        assert_eq!(config.server.ws_port, 8081);
    }
}
