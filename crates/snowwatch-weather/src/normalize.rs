//! Normalization of raw api.weather.gov payloads into `ForecastSnapshot`.
//!
//! The upstream JSON is loosely shaped; everything is validated here so the
//! change detector only ever sees explicit per-period structures.

use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use snowwatch_core::FetchError;

use crate::types::{
    ForecastPeriod, ForecastSnapshot, GridValue, GridpointSeries, HourlyPoint, PrecipType,
};

const MM_PER_INCH: f64 = 25.4;

#[derive(Debug, Deserialize)]
pub(crate) struct ForecastResponse {
    pub properties: ForecastProperties,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ForecastProperties {
    #[serde(default)]
    pub periods: Vec<NwsPeriod>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NwsPeriod {
    #[serde(default)]
    pub name: String,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: DateTime<FixedOffset>,
    #[serde(default = "default_daytime")]
    pub is_daytime: bool,
    pub temperature: Option<f64>,
    pub temperature_unit: Option<String>,
    pub probability_of_precipitation: Option<QuantitativeValue>,
    #[serde(default)]
    pub short_forecast: String,
    #[serde(default)]
    pub detailed_forecast: String,
}

fn default_daytime() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub(crate) struct QuantitativeValue {
    pub value: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GridpointResponse {
    pub properties: GridpointProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GridpointProperties {
    pub snowfall_amount: Option<GridLayer>,
    pub ice_accumulation: Option<GridLayer>,
    pub wind_chill: Option<GridLayer>,
    pub probability_of_precipitation: Option<GridLayer>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GridLayer {
    pub uom: Option<String>,
    #[serde(default)]
    pub values: Vec<GridLayerValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GridLayerValue {
    pub valid_time: String,
    pub value: Option<f64>,
}

/// Build a snapshot from the three forecast documents.
pub fn build_snapshot(
    forecast: &serde_json::Value,
    hourly: &serde_json::Value,
    gridpoint: &serde_json::Value,
    captured_at: DateTime<Utc>,
) -> Result<ForecastSnapshot, FetchError> {
    let forecast: ForecastResponse = serde_json::from_value(forecast.clone())
        .map_err(|e| FetchError::invalid_payload(format!("forecast: {}", e)))?;
    let hourly: ForecastResponse = serde_json::from_value(hourly.clone())
        .map_err(|e| FetchError::invalid_payload(format!("hourly forecast: {}", e)))?;
    let gridpoint: GridpointResponse = serde_json::from_value(gridpoint.clone())
        .map_err(|e| FetchError::invalid_payload(format!("gridpoint: {}", e)))?;

    if forecast.properties.periods.is_empty() {
        return Err(FetchError::invalid_payload("forecast has no periods"));
    }

    let series = normalize_gridpoint(&gridpoint.properties)?;
    let periods = forecast
        .properties
        .periods
        .iter()
        .map(|p| normalize_period(p, &series))
        .collect::<Vec<_>>();
    let hourly = hourly.properties.periods.iter().map(normalize_hourly).collect();

    Ok(ForecastSnapshot {
        captured_at,
        periods,
        hourly,
        gridpoint: series,
        raw_payload: None,
    })
}

fn normalize_period(period: &NwsPeriod, series: &GridpointSeries) -> ForecastPeriod {
    let start_time = period.start_time.with_timezone(&Utc);
    let end_time = period.end_time.with_timezone(&Utc);

    let snow_amount_in = sum_overlapping(&series.snowfall_in, start_time, end_time)
        .or_else(|| snow_from_text(&period.detailed_forecast));

    ForecastPeriod {
        period_id: period_id(period.start_time, period.is_daytime),
        name: period.name.clone(),
        start_time,
        end_time,
        temperature_f: period
            .temperature
            .map(|t| to_fahrenheit(t, period.temperature_unit.as_deref())),
        snow_amount_in,
        precip_probability: period.probability_of_precipitation.as_ref().and_then(|q| q.value),
        precip_type: PrecipType::classify(&period.short_forecast),
        hazard_text: Some(period.detailed_forecast.clone()).filter(|t| !t.trim().is_empty()),
    }
}

fn normalize_hourly(period: &NwsPeriod) -> HourlyPoint {
    HourlyPoint {
        start_time: period.start_time.with_timezone(&Utc),
        end_time: period.end_time.with_timezone(&Utc),
        temperature_f: period
            .temperature
            .map(|t| to_fahrenheit(t, period.temperature_unit.as_deref())),
        precip_probability: period.probability_of_precipitation.as_ref().and_then(|q| q.value),
        precip_type: PrecipType::classify(&period.short_forecast),
    }
}

/// Period key from the local calendar date of its start.
///
/// Night periods are keyed to the evening they belong to: a post-midnight
/// "Overnight" period starting at 01:00 on the 13th is the night of the 12th,
/// not the same key as "Tuesday Night" later on the 13th.
pub fn period_id(start: DateTime<FixedOffset>, is_daytime: bool) -> String {
    let mut date = start.date_naive();
    if !is_daytime && start.hour() < 12 {
        date = date.pred_opt().unwrap_or(date);
    }
    format!(
        "{}-{}",
        date.format("%Y-%m-%d"),
        if is_daytime { "day" } else { "night" }
    )
}

fn to_fahrenheit(value: f64, unit: Option<&str>) -> f64 {
    match unit {
        Some(u) if u.eq_ignore_ascii_case("C") || u.ends_with("degC") => value * 9.0 / 5.0 + 32.0,
        _ => value,
    }
}

fn normalize_gridpoint(props: &GridpointProperties) -> Result<GridpointSeries, FetchError> {
    Ok(GridpointSeries {
        snowfall_in: convert_layer(props.snowfall_amount.as_ref(), Unit::Length)?,
        ice_accumulation_in: convert_layer(props.ice_accumulation.as_ref(), Unit::Length)?,
        wind_chill_f: convert_layer(props.wind_chill.as_ref(), Unit::Temperature)?,
        precip_probability: convert_layer(props.probability_of_precipitation.as_ref(), Unit::Percent)?,
    })
}

#[derive(Clone, Copy)]
enum Unit {
    Length,
    Temperature,
    Percent,
}

fn convert_layer(layer: Option<&GridLayer>, unit: Unit) -> Result<Vec<GridValue>, FetchError> {
    let Some(layer) = layer else {
        return Ok(Vec::new());
    };
    let uom = layer.uom.as_deref().unwrap_or_default();

    let mut out = Vec::with_capacity(layer.values.len());
    for entry in &layer.values {
        let Some(raw) = entry.value else {
            continue;
        };
        let (valid_from, valid_until) = parse_valid_time(&entry.valid_time)?;
        let value = match unit {
            Unit::Length if uom.ends_with(":mm") => raw / MM_PER_INCH,
            Unit::Length if uom.ends_with(":m") => raw * 1000.0 / MM_PER_INCH,
            Unit::Temperature if uom.ends_with("degC") => raw * 9.0 / 5.0 + 32.0,
            _ => raw,
        };
        out.push(GridValue {
            valid_from,
            valid_until,
            value,
        });
    }
    Ok(out)
}

/// Parse an NWS `validTime` interval such as `2026-01-12T06:00:00+00:00/PT6H`.
pub fn parse_valid_time(valid_time: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), FetchError> {
    let (start, duration) = valid_time
        .split_once('/')
        .ok_or_else(|| FetchError::invalid_payload(format!("validTime without interval: {}", valid_time)))?;

    let start = DateTime::parse_from_rfc3339(start)
        .map_err(|e| FetchError::invalid_payload(format!("validTime start {}: {}", start, e)))?
        .with_timezone(&Utc);
    let duration = parse_iso_duration(duration)
        .ok_or_else(|| FetchError::invalid_payload(format!("validTime duration: {}", duration)))?;

    Ok((start, start + duration))
}

/// ISO-8601 durations as used by the NWS gridpoint API: `P1DT6H`, `PT1H`, `P2D`.
pub fn parse_iso_duration(text: &str) -> Option<Duration> {
    let rest = text.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    let mut total = Duration::zero();
    let mut number = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let n: i64 = number.parse().ok()?;
        number.clear();
        total += match c {
            'W' => Duration::weeks(n),
            'D' => Duration::days(n),
            _ => return None,
        };
    }
    if !number.is_empty() {
        return None;
    }

    if let Some(time_part) = time_part {
        for c in time_part.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }
            let n: i64 = number.parse().ok()?;
            number.clear();
            total += match c {
                'H' => Duration::hours(n),
                'M' => Duration::minutes(n),
                'S' => Duration::seconds(n),
                _ => return None,
            };
        }
        if !number.is_empty() {
            return None;
        }
    }

    Some(total)
}

/// Sum of values whose interval overlaps `[start, end)`, weighted by overlap.
///
/// `None` when no value covers any part of the window.
fn sum_overlapping(values: &[GridValue], start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
    let mut covered = false;
    let mut total = 0.0;

    for v in values {
        let overlap_start = v.valid_from.max(start);
        let overlap_end = v.valid_until.min(end);
        if overlap_end <= overlap_start {
            continue;
        }
        covered = true;
        let span = (v.valid_until - v.valid_from).num_seconds();
        if span <= 0 {
            continue;
        }
        let fraction = (overlap_end - overlap_start).num_seconds() as f64 / span as f64;
        total += v.value * fraction;
    }

    covered.then_some(total)
}

fn snow_range_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)(\d+(?:\.\d+)?)\s*(?:to|-)\s*(\d+(?:\.\d+)?)\s*(?:inch|")"#).ok())
        .as_ref()
}

fn snow_single_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)(\d+(?:\.\d+)?)\s*(?:inch|")"#).ok())
        .as_ref()
}

/// Snow amount mentioned in forecast text; midpoint for ranges ("2 to 4 inches" → 3.0).
///
/// Only considered when the text talks about snow, so rainfall totals are ignored.
pub fn snow_from_text(text: &str) -> Option<f64> {
    if !text.to_lowercase().contains("snow") {
        return None;
    }

    if let Some(caps) = snow_range_regex()?.captures(text) {
        let low: f64 = caps.get(1)?.as_str().parse().ok()?;
        let high: f64 = caps.get(2)?.as_str().parse().ok()?;
        return Some((low + high) / 2.0);
    }

    snow_single_regex()?
        .captures(text)
        .and_then(|caps| caps.get(1)?.as_str().parse().ok())
}
