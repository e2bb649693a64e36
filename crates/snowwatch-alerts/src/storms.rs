//! Storm identification within a single snapshot.
//!
//! A storm is a run of snowy periods with no dry gap of 12 hours or more.
//! Storms under half an inch in total are dropped.

use chrono::Duration;

use snowwatch_weather::{Confidence, ForecastPeriod, ForecastSnapshot, PrecipType, SnowEvent};

/// Smallest per-period amount that counts as snowy (inches).
const SNOWY_PERIOD_INCHES: f64 = 0.1;
/// Storms with less than this in total are ignored (inches).
const MIN_STORM_INCHES: f64 = 0.5;
const MIN_GAP_HOURS: i64 = 12;

const ICE_WORDS: &[&str] = &["freezing rain", "freezing drizzle", "sleet", "ice accumulation"];
const WIND_WORDS: &[&str] = &["gust", "blowing", "windy", "winds"];

fn is_snowy(period: &ForecastPeriod) -> bool {
    period.snow_amount_in.is_some_and(|s| s >= SNOWY_PERIOD_INCHES)
        || period.precip_type == Some(PrecipType::Snow)
}

fn mentions(period: &ForecastPeriod, words: &[&str]) -> bool {
    period
        .hazard_text
        .as_deref()
        .map(str::to_lowercase)
        .is_some_and(|text| words.iter().any(|w| text.contains(w)))
}

/// Storms in `snapshot`, earliest first.
pub fn identify_storms(snapshot: &ForecastSnapshot) -> Vec<SnowEvent> {
    let mut periods: Vec<&ForecastPeriod> = snapshot.periods.iter().filter(|p| is_snowy(p)).collect();
    periods.sort_by_key(|p| p.start_time);

    let mut runs: Vec<Vec<&ForecastPeriod>> = Vec::new();
    for period in periods {
        let joins = runs
            .last()
            .and_then(|run| run.last())
            .is_some_and(|prev| period.start_time - prev.end_time < Duration::hours(MIN_GAP_HOURS));
        match runs.last_mut() {
            Some(run) if joins => run.push(period),
            _ => runs.push(vec![period]),
        }
    }

    runs.into_iter()
        .filter_map(|run| storm_from_run(&run, snapshot))
        .collect()
}

fn storm_from_run(run: &[&ForecastPeriod], snapshot: &ForecastSnapshot) -> Option<SnowEvent> {
    let first = run.first()?;
    let last = run.last()?;

    let snow_total_in: f64 = run.iter().filter_map(|p| p.snow_amount_in).sum();
    if snow_total_in < MIN_STORM_INCHES {
        return None;
    }

    let peak = run
        .iter()
        .max_by(|a, b| {
            a.snow_amount_in
                .unwrap_or_default()
                .total_cmp(&b.snow_amount_in.unwrap_or_default())
        })
        .copied()
        .unwrap_or(*first);

    let lead_time_hours = (first.start_time - snapshot.captured_at).num_hours().max(0);

    Some(SnowEvent {
        start_time: first.start_time,
        end_time: last.end_time,
        periods: run.iter().map(|p| p.period_id.clone()).collect(),
        snow_total_in: (snow_total_in * 10.0).round() / 10.0,
        peak_period: peak.period_id.clone(),
        peak_snow_in: peak.snow_amount_in.unwrap_or_default(),
        lead_time_hours,
        confidence: Confidence::from_lead_hours(lead_time_hours),
        has_ice: run.iter().any(|p| {
            matches!(p.precip_type, Some(PrecipType::Sleet | PrecipType::FreezingRain))
                || mentions(p, ICE_WORDS)
        }),
        has_wind: run.iter().any(|p| mentions(p, WIND_WORDS)),
    })
}
