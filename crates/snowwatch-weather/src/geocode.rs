//! ZIP code geocoding via Zippopotam.us (free, no API key required).

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;

use snowwatch_core::{ApiConfig, FetchError};

use crate::nws::NwsClient;
use crate::types::NewLocation;

const ZIPPOPOTAM_URL: &str = "https://api.zippopotam.us";

#[derive(Debug, Deserialize)]
struct ZipResponse {
    #[serde(default)]
    places: Vec<ZipPlaceRaw>,
}

#[derive(Debug, Deserialize)]
struct ZipPlaceRaw {
    #[serde(rename = "place name")]
    place_name: Option<String>,
    #[serde(rename = "state abbreviation")]
    state_abbreviation: Option<String>,
    latitude: String,
    longitude: String,
}

/// A ZIP code resolved to a point.
#[derive(Debug, Clone, PartialEq)]
pub struct ZipPlace {
    pub latitude: f64,
    pub longitude: f64,
    pub city: Option<String>,
    pub state: Option<String>,
}

/// US ZIP codes are five digits; ZIP+4 is accepted and truncated.
pub fn normalize_zip(zip: &str) -> Option<String> {
    let zip = zip.trim();
    let base = zip.split('-').next()?;
    if base.len() == 5 && base.chars().all(|c| c.is_ascii_digit()) {
        Some(base.to_string())
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ZipGeocoder {
    client: Client,
    base_url: String,
}

impl ZipGeocoder {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            client,
            base_url: ZIPPOPOTAM_URL.to_string(),
        })
    }

    pub fn from_config(api: &ApiConfig) -> Result<Self, FetchError> {
        Ok(Self::new(&api.user_agent, Duration::from_secs(api.timeout_secs))?
            .with_base_url(&api.geocode_url))
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    #[instrument(skip(self), level = "info")]
    pub async fn lookup(&self, zip: &str) -> Result<ZipPlace, FetchError> {
        let zip = normalize_zip(zip)
            .ok_or_else(|| FetchError::NotFound(format!("invalid ZIP code '{}'", zip)))?;

        let url = format!("{}/us/{}", self.base_url, zip);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(format!("ZIP code {}", zip)));
        }
        if !status.is_success() {
            return Err(FetchError::Upstream {
                status: status.as_u16(),
                message: format!("geocoding {}", zip),
            });
        }

        let body: ZipResponse = response
            .json()
            .await
            .map_err(|e| FetchError::invalid_payload(format!("geocode: {}", e)))?;

        let place = body
            .places
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::NotFound(format!("ZIP code {}", zip)))?;

        let latitude: f64 = place
            .latitude
            .trim()
            .parse()
            .map_err(|_| FetchError::invalid_payload(format!("bad latitude '{}'", place.latitude)))?;
        let longitude: f64 = place
            .longitude
            .trim()
            .parse()
            .map_err(|_| FetchError::invalid_payload(format!("bad longitude '{}'", place.longitude)))?;

        tracing::info!(
            "Geocoded {} to {:.4},{:.4} ({})",
            zip,
            latitude,
            longitude,
            place.place_name.as_deref().unwrap_or("unknown")
        );

        Ok(ZipPlace {
            latitude,
            longitude,
            city: place.place_name.filter(|s| !s.is_empty()),
            state: place.state_abbreviation.filter(|s| !s.is_empty()),
        })
    }
}

/// Geocode a ZIP and map it onto the NWS grid, ready for storage.
pub async fn resolve_location(
    geocoder: &ZipGeocoder,
    nws: &NwsClient,
    zip: &str,
) -> Result<NewLocation, FetchError> {
    let zip_code = normalize_zip(zip)
        .ok_or_else(|| FetchError::NotFound(format!("invalid ZIP code '{}'", zip)))?;
    let place = geocoder.lookup(&zip_code).await?;
    let grid = nws.grid_point(place.latitude, place.longitude).await?;

    Ok(NewLocation {
        zip_code,
        latitude: place.latitude,
        longitude: place.longitude,
        grid,
        city: place.city,
        state: place.state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_zip() {
        assert_eq!(normalize_zip("80424").as_deref(), Some("80424"));
        assert_eq!(normalize_zip(" 80424 ").as_deref(), Some("80424"));
        assert_eq!(normalize_zip("80424-1234").as_deref(), Some("80424"));
        assert_eq!(normalize_zip("8042"), None);
        assert_eq!(normalize_zip("abcde"), None);
        assert_eq!(normalize_zip(""), None);
    }
}
