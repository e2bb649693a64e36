use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::ConfigError;

const APP_DIR: &str = "snowwatch";

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a one-line message summarizing all errors
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub api: ApiConfig,

    /// Change-detection thresholds
    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("weather_tracker.db");
        Self { path }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the NWS API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Base URL of the zip code geocoder
    #[serde(default = "default_geocode_url")]
    pub geocode_url: String,

    /// api.weather.gov rejects requests without a descriptive User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries for transient HTTP failures within one request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    "https://api.weather.gov".to_string()
}

fn default_geocode_url() -> String {
    "https://api.zippopotam.us".to_string()
}

fn default_user_agent() -> String {
    format!("Snowwatch/{} (winter forecast tracker)", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    2
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            geocode_url: default_geocode_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// Thresholds are inclusive: a change exactly at the threshold fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_snow_threshold")]
    pub snow_threshold_inches: f64,

    #[serde(default = "default_temperature_threshold")]
    pub temperature_threshold_f: f64,

    #[serde(default = "default_timing_threshold")]
    pub timing_threshold_hours: i64,

    /// Percentage points
    #[serde(default = "default_precip_probability_threshold")]
    pub precip_probability_threshold: f64,

    #[serde(default = "default_hazard_keywords")]
    pub hazard_keywords: Vec<String>,
}

fn default_snow_threshold() -> f64 {
    2.0
}

fn default_temperature_threshold() -> f64 {
    5.0
}

fn default_timing_threshold() -> i64 {
    6
}

fn default_precip_probability_threshold() -> f64 {
    30.0
}

pub fn default_hazard_keywords() -> Vec<String> {
    [
        "blizzard",
        "ice storm warning",
        "winter storm warning",
        "winter storm watch",
        "significant",
        "heavy snow",
        "whiteout",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            snow_threshold_inches: default_snow_threshold(),
            temperature_threshold_f: default_temperature_threshold(),
            timing_threshold_hours: default_timing_threshold(),
            precip_probability_threshold: default_precip_probability_threshold(),
            hazard_keywords: default_hazard_keywords(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Snapshots and discussions older than this are purged
    #[serde(default = "default_retention_days")]
    pub days: i64,
}

fn default_retention_days() -> i64 {
    30
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// External program invoked as `<command> <title> <message>` (e.g. notify-send).
    /// Falls back to console output when unset.
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    /// Toast-style notifiers truncate long bodies
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_lines() -> usize {
    5
}

fn default_max_length() -> usize {
    250
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
            max_lines: default_max_lines(),
            max_length: default_max_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            api: ApiConfig::default(),
            alerts: AlertsConfig::default(),
            retention: RetentionConfig::default(),
            notify: NotifyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from `path`, writing defaults there if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Errors fail the load. Warnings are returned for the caller to log once
    /// logging is up.
    pub fn load_validated(path: Option<&Path>) -> Result<(Self, ValidationResult)> {
        let config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        let validation = config.validate();

        if !validation.is_valid() {
            return Err(ConfigError::Invalid(validation.error_summary()).into());
        }

        Ok((config, validation))
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        validate_url(&self.api.base_url, "api.base_url", &mut result);
        validate_url(&self.api.geocode_url, "api.geocode_url", &mut result);

        if self.api.user_agent.trim().is_empty() {
            result.add_error("api.user_agent", "User-Agent must not be empty");
        }
        if self.api.timeout_secs == 0 {
            result.add_error("api.timeout_secs", "Timeout must be greater than 0");
        }

        if self.alerts.snow_threshold_inches <= 0.0 {
            result.add_error("alerts.snow_threshold_inches", "Threshold must be positive");
        }
        if self.alerts.temperature_threshold_f <= 0.0 {
            result.add_error("alerts.temperature_threshold_f", "Threshold must be positive");
        }
        if self.alerts.timing_threshold_hours <= 0 {
            result.add_error("alerts.timing_threshold_hours", "Threshold must be positive");
        }
        if self.alerts.precip_probability_threshold <= 0.0
            || self.alerts.precip_probability_threshold > 100.0
        {
            result.add_error(
                "alerts.precip_probability_threshold",
                "Threshold must be between 0 and 100",
            );
        }
        if self.alerts.hazard_keywords.is_empty() {
            result.add_warning(
                "alerts.hazard_keywords",
                "No hazard keywords configured - hazard alerts disabled",
            );
        }

        if self.retention.days < 1 {
            result.add_error("retention.days", "Retention must be at least 1 day");
        } else if self.retention.days > 365 {
            result.add_warning("retention.days", "Retention is more than a year");
        }

        if self.notify.max_lines == 0 {
            result.add_error("notify.max_lines", "Must show at least one line");
        }
        if self.notify.max_length < 10 {
            result.add_error("notify.max_length", "Message length is too small (<10)");
        }

        result
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join(APP_DIR);

        Ok(config_dir.join("config.toml"))
    }
}

fn validate_url(url_str: &str, field_name: &str, result: &mut ValidationResult) {
    match Url::parse(url_str) {
        Ok(url) => {
            if url.scheme() != "http" && url.scheme() != "https" {
                result.add_error(
                    field_name,
                    format!("URL must use http or https scheme, got: {}", url.scheme()),
                );
            }

            if url.host().is_none() {
                result.add_error(field_name, "URL must have a host");
            }
        }
        Err(e) => {
            result.add_error(field_name, format!("Invalid URL: {}", e));
        }
    }
}
