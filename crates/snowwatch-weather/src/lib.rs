//! Forecast data for snowwatch
//!
//! Fetches point forecasts from api.weather.gov, resolves ZIP codes to
//! forecast grids, and normalizes everything into comparable snapshots.

pub mod types;
pub mod geocode;
pub mod normalize;
pub mod nws;
pub mod provider;
pub mod retry;

pub use types::*;
pub use geocode::{normalize_zip, resolve_location, ZipGeocoder, ZipPlace};
pub use normalize::build_snapshot;
pub use nws::NwsClient;
pub use provider::ForecastFetcher;
pub use retry::{with_retry, RetryConfig};
