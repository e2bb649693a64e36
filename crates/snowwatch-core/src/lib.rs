pub mod config;
pub mod error;

pub use config::{
    AlertsConfig, ApiConfig, Config, DatabaseConfig, LoggingConfig, NotifyConfig,
    RetentionConfig, ValidationResult,
};
pub use error::{
    AppError, ConfigError, DegenerateComparisonWarning, DuplicateAlertError, FetchError,
    LedgerError, NotifyError, ReqwestErrorExt, RusqliteErrorExt, StorageError,
};

use anyhow::Result;

/// Initialize tracing. `RUST_LOG` wins over `default_level`.
pub fn init_logging(default_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::debug!("Snowwatch logging initialized");
    Ok(())
}
