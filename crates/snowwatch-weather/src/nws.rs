//! api.weather.gov client.

use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;

use snowwatch_core::{ApiConfig, FetchError};

use crate::normalize::build_snapshot;
use crate::provider::ForecastFetcher;
use crate::retry::{with_retry, RetryConfig};
use crate::types::{Discussion, ForecastSnapshot, GridRef, Location};

const NWS_API_BASE: &str = "https://api.weather.gov";
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Deserialize)]
struct PointsResponse {
    properties: PointsProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointsProperties {
    grid_id: Option<String>,
    grid_x: Option<i32>,
    grid_y: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ProductListResponse {
    #[serde(rename = "@graph", default)]
    graph: Vec<ProductSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductSummary {
    id: String,
    issuance_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductResponse {
    #[serde(default)]
    product_text: String,
    issuance_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NwsClient {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl NwsClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            client,
            base_url: NWS_API_BASE.to_string(),
            retry: RetryConfig::default(),
        })
    }

    pub fn from_config(api: &ApiConfig) -> Result<Self, FetchError> {
        let retry = RetryConfig {
            max_retries: api.max_retries,
            ..RetryConfig::default()
        };
        Ok(Self::new(&api.user_agent, Duration::from_secs(api.timeout_secs))?
            .with_base_url(&api.base_url)
            .with_retry(retry))
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let client = &self.client;
        let url_ref = &url;

        with_retry(&self.retry, move || async move {
            let response = client
                .get(url_ref)
                .header(header::ACCEPT, "application/geo+json")
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound(url_ref.clone()));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::Upstream {
                    status: status.as_u16(),
                    message: body.chars().take(MAX_ERROR_BODY).collect(),
                });
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| FetchError::invalid_payload(format!("{}: {}", url_ref, e)))
        })
        .await
    }

    /// Resolve coordinates to the NWS forecast grid.
    #[instrument(skip(self), level = "info")]
    pub async fn grid_point(&self, latitude: f64, longitude: f64) -> Result<GridRef, FetchError> {
        let value = self
            .get_json(&format!("/points/{:.4},{:.4}", latitude, longitude))
            .await?;
        let points: PointsResponse = serde_json::from_value(value)
            .map_err(|e| FetchError::invalid_payload(format!("points: {}", e)))?;

        match (points.properties.grid_id, points.properties.grid_x, points.properties.grid_y) {
            (Some(office), Some(x), Some(y)) if !office.is_empty() => Ok(GridRef { office, x, y }),
            _ => Err(FetchError::invalid_payload("incomplete grid point data")),
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn forecast(&self, grid: &GridRef) -> Result<serde_json::Value, FetchError> {
        self.get_json(&format!("/gridpoints/{}/{},{}/forecast", grid.office, grid.x, grid.y))
            .await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn hourly_forecast(&self, grid: &GridRef) -> Result<serde_json::Value, FetchError> {
        self.get_json(&format!(
            "/gridpoints/{}/{},{}/forecast/hourly",
            grid.office, grid.x, grid.y
        ))
        .await
    }

    /// Raw gridpoint quantities (snowfall, ice, wind chill, ...)
    #[instrument(skip(self), level = "debug")]
    pub async fn gridpoint_data(&self, grid: &GridRef) -> Result<serde_json::Value, FetchError> {
        self.get_json(&format!("/gridpoints/{}/{},{}", grid.office, grid.x, grid.y))
            .await
    }

    /// Most recent Area Forecast Discussion for an office.
    #[instrument(skip(self), level = "info")]
    pub async fn latest_discussion(&self, office: &str) -> Result<Option<Discussion>, FetchError> {
        let value = self
            .get_json(&format!("/products/types/AFD/locations/{}", office))
            .await?;
        let list: ProductListResponse = serde_json::from_value(value)
            .map_err(|e| FetchError::invalid_payload(format!("product list: {}", e)))?;

        let Some(latest) = list.graph.into_iter().next() else {
            tracing::debug!("No discussion published for {}", office);
            return Ok(None);
        };

        let value = self.get_json(&format!("/products/{}", latest.id)).await?;
        let product: ProductResponse = serde_json::from_value(value)
            .map_err(|e| FetchError::invalid_payload(format!("product: {}", e)))?;

        let Some(issued_at) = product.issuance_time.or(latest.issuance_time) else {
            tracing::warn!("Discussion {} has no issuance time, skipping", latest.id);
            return Ok(None);
        };
        if product.product_text.trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(Discussion {
            issued_at,
            fetched_at: Utc::now(),
            office: office.to_string(),
            text: product.product_text,
        }))
    }
}

impl ForecastFetcher for NwsClient {
    async fn fetch_snapshot(&self, location: &Location) -> Result<ForecastSnapshot, FetchError> {
        tracing::info!(
            "Fetching forecast for {} ({}) from grid {}",
            location.display_name(),
            location.zip_code,
            location.grid
        );

        let (forecast, hourly, gridpoint) = tokio::try_join!(
            self.forecast(&location.grid),
            self.hourly_forecast(&location.grid),
            self.gridpoint_data(&location.grid),
        )?;

        let mut snapshot = build_snapshot(&forecast, &hourly, &gridpoint, Utc::now())?;
        let raw = serde_json::json!({
            "forecast": forecast,
            "hourly": hourly,
            "gridpoint": gridpoint,
        });
        snapshot.raw_payload = Some(raw.to_string());

        tracing::debug!("Normalized {} forecast periods", snapshot.periods.len());
        Ok(snapshot)
    }

    async fn fetch_discussion(&self, location: &Location) -> Result<Option<Discussion>, FetchError> {
        self.latest_discussion(&location.grid.office).await
    }
}
