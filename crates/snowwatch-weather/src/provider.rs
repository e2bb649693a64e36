use snowwatch_core::FetchError;

use crate::types::{Discussion, ForecastSnapshot, Location};

/// Source of forecast snapshots for a location.
///
/// Implementations own their own timeouts; callers only see `FetchError`.
#[allow(async_fn_in_trait)]
pub trait ForecastFetcher {
    /// Fetch and normalize the forecast for `location` as of now.
    async fn fetch_snapshot(&self, location: &Location) -> Result<ForecastSnapshot, FetchError>;

    /// Latest forecast discussion for the location's office, if one is published.
    async fn fetch_discussion(&self, location: &Location) -> Result<Option<Discussion>, FetchError>;
}
