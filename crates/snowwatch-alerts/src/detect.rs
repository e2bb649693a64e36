//! Change detection between two consecutive forecast snapshots.
//!
//! Every rule is evaluated independently, so one pair of snapshots can yield
//! any number of events. Thresholds are inclusive. Periods are matched by
//! their stable period id; a period missing from either snapshot is skipped.

use chrono::{DateTime, Utc};

use snowwatch_core::config::default_hazard_keywords;
use snowwatch_core::{AlertsConfig, DegenerateComparisonWarning};
use snowwatch_weather::{
    ChangeEvent, ChangeKind, ChangeValue, ForecastPeriod, ForecastSnapshot, Severity,
};

/// Snow changes at or above this are High severity (inches).
const HIGH_SNOW_DELTA: f64 = 4.0;
/// Temperature changes at or above this are High severity (°F).
const HIGH_TEMPERATURE_DELTA: f64 = 10.0;
/// Probability at which an interval counts as wet for timing purposes.
const WET_PROBABILITY: f64 = 50.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub snow_inches: f64,
    pub temperature_f: f64,
    pub timing_hours: f64,
    pub precip_probability: f64,
    /// Matched case-insensitively
    pub hazard_keywords: Vec<String>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            snow_inches: 2.0,
            temperature_f: 5.0,
            timing_hours: 6.0,
            precip_probability: 30.0,
            hazard_keywords: default_hazard_keywords(),
        }
    }
}

impl From<&AlertsConfig> for Thresholds {
    fn from(config: &AlertsConfig) -> Self {
        Self {
            snow_inches: config.snow_threshold_inches,
            temperature_f: config.temperature_threshold_f,
            timing_hours: config.timing_threshold_hours as f64,
            precip_probability: config.precip_probability_threshold,
            hazard_keywords: config
                .hazard_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }
}

/// Result of comparing two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub events: Vec<ChangeEvent>,
    pub warning: Option<DegenerateComparisonWarning>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    thresholds: Thresholds,
}

impl ChangeDetector {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    /// Compare `previous` against the newer `current` snapshot.
    ///
    /// Snapshots with the same capture time yield no events and a
    /// `DegenerateComparisonWarning`.
    pub fn detect(&self, previous: &ForecastSnapshot, current: &ForecastSnapshot) -> Detection {
        if previous.captured_at == current.captured_at {
            let warning = DegenerateComparisonWarning {
                captured_at: current.captured_at,
            };
            tracing::warn!("{}", warning);
            return Detection {
                events: Vec::new(),
                warning: Some(warning),
            };
        }

        let detected_at = current.captured_at;
        let mut events = Vec::new();
        events.extend(self.snow_changes(previous, current, detected_at));
        events.extend(self.temperature_changes(previous, current, detected_at));
        events.extend(self.timing_changes(previous, current, detected_at));
        events.extend(precip_type_changes(previous, current, detected_at));
        events.extend(self.probability_changes(previous, current, detected_at));
        events.extend(self.new_hazard_keywords(previous, current, detected_at));

        if !events.is_empty() {
            tracing::debug!("Detected {} forecast changes", events.len());
        }

        Detection {
            events,
            warning: None,
        }
    }

    fn snow_changes(
        &self,
        previous: &ForecastSnapshot,
        current: &ForecastSnapshot,
        detected_at: DateTime<Utc>,
    ) -> Vec<ChangeEvent> {
        numeric_changes(
            previous,
            current,
            |p| p.snow_amount_in,
            self.thresholds.snow_inches,
            ChangeKind::SnowTotal,
            HIGH_SNOW_DELTA,
            detected_at,
        )
    }

    fn temperature_changes(
        &self,
        previous: &ForecastSnapshot,
        current: &ForecastSnapshot,
        detected_at: DateTime<Utc>,
    ) -> Vec<ChangeEvent> {
        numeric_changes(
            previous,
            current,
            |p| p.temperature_f,
            self.thresholds.temperature_f,
            ChangeKind::Temperature,
            HIGH_TEMPERATURE_DELTA,
            detected_at,
        )
    }

    fn probability_changes(
        &self,
        previous: &ForecastSnapshot,
        current: &ForecastSnapshot,
        detected_at: DateTime<Utc>,
    ) -> Vec<ChangeEvent> {
        numeric_changes(
            previous,
            current,
            |p| p.precip_probability,
            self.thresholds.precip_probability,
            ChangeKind::PrecipProbability,
            f64::INFINITY,
            detected_at,
        )
    }

    fn timing_changes(
        &self,
        previous: &ForecastSnapshot,
        current: &ForecastSnapshot,
        detected_at: DateTime<Utc>,
    ) -> Vec<ChangeEvent> {
        let use_hourly = !previous.hourly.is_empty() && !current.hourly.is_empty();
        let before = precip_window(&wet_intervals(previous, use_hourly));
        let after = precip_window(&wet_intervals(current, use_hourly));

        let (Some(before), Some(after)) = (before, after) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for (label, prev_time, cur_time) in [
            ("onset", before.onset, after.onset),
            ("end", before.end, after.end),
        ] {
            let shift = (cur_time - prev_time).num_minutes() as f64 / 60.0;
            if shift.abs() >= self.thresholds.timing_hours {
                events.push(ChangeEvent {
                    kind: ChangeKind::TimingShift,
                    period: format!("{}@{}", label, prev_time.format("%Y-%m-%dT%H:%MZ")),
                    magnitude: shift.abs(),
                    previous: ChangeValue::Time(prev_time),
                    current: ChangeValue::Time(cur_time),
                    severity: Severity::Medium,
                    detected_at,
                });
            }
        }
        events
    }

    fn new_hazard_keywords(
        &self,
        previous: &ForecastSnapshot,
        current: &ForecastSnapshot,
        detected_at: DateTime<Utc>,
    ) -> Vec<ChangeEvent> {
        let previous_text = previous
            .periods
            .iter()
            .filter_map(|p| p.hazard_text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
            .to_lowercase();

        let current_texts: Vec<(&ForecastPeriod, String)> = current
            .periods
            .iter()
            .filter_map(|p| p.hazard_text.as_ref().map(|t| (p, t.to_lowercase())))
            .collect();

        let mut events = Vec::new();
        for keyword in &self.thresholds.hazard_keywords {
            let keyword = keyword.to_lowercase();
            if keyword.is_empty() || previous_text.contains(&keyword) {
                continue;
            }
            let Some((period, _)) = current_texts.iter().find(|(_, text)| text.contains(&keyword))
            else {
                continue;
            };
            events.push(ChangeEvent {
                kind: ChangeKind::NewHazardKeyword,
                period: period.period_id.clone(),
                magnitude: 1.0,
                previous: ChangeValue::Absent,
                current: ChangeValue::Text(keyword),
                severity: Severity::High,
                detected_at,
            });
        }
        events
    }
}

/// Periods of `current` paired with the same period in `previous`, in current order.
fn shared_periods<'a>(
    previous: &'a ForecastSnapshot,
    current: &'a ForecastSnapshot,
) -> impl Iterator<Item = (&'a ForecastPeriod, &'a ForecastPeriod)> {
    current
        .periods
        .iter()
        .filter_map(move |cur| previous.period(&cur.period_id).map(|prev| (prev, cur)))
}

fn numeric_changes(
    previous: &ForecastSnapshot,
    current: &ForecastSnapshot,
    field: impl Fn(&ForecastPeriod) -> Option<f64>,
    threshold: f64,
    kind: ChangeKind,
    high_at: f64,
    detected_at: DateTime<Utc>,
) -> Vec<ChangeEvent> {
    shared_periods(previous, current)
        .filter_map(|(prev, cur)| {
            let (p, c) = (field(prev)?, field(cur)?);
            let delta = (c - p).abs();
            (delta >= threshold).then(|| ChangeEvent {
                kind,
                period: cur.period_id.clone(),
                magnitude: delta,
                previous: ChangeValue::Number(p),
                current: ChangeValue::Number(c),
                severity: if delta >= high_at {
                    Severity::High
                } else {
                    Severity::Medium
                },
                detected_at,
            })
        })
        .collect()
}

fn precip_type_changes(
    previous: &ForecastSnapshot,
    current: &ForecastSnapshot,
    detected_at: DateTime<Utc>,
) -> Vec<ChangeEvent> {
    shared_periods(previous, current)
        .filter_map(|(prev, cur)| {
            let (p, c) = (prev.precip_type?, cur.precip_type?);
            (p != c).then(|| ChangeEvent {
                kind: ChangeKind::PrecipType,
                period: cur.period_id.clone(),
                magnitude: 1.0,
                previous: ChangeValue::Text(p.label().to_string()),
                current: ChangeValue::Text(c.label().to_string()),
                severity: Severity::Medium,
                detected_at,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Interval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    wet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PrecipWindow {
    onset: DateTime<Utc>,
    end: DateTime<Utc>,
}

fn wet_intervals(snapshot: &ForecastSnapshot, use_hourly: bool) -> Vec<Interval> {
    let mut intervals: Vec<Interval> = if use_hourly {
        snapshot
            .hourly
            .iter()
            .map(|h| Interval {
                start: h.start_time,
                end: h.end_time,
                wet: h.precip_type.is_some()
                    || h.precip_probability.is_some_and(|p| p >= WET_PROBABILITY),
            })
            .collect()
    } else {
        snapshot
            .periods
            .iter()
            .map(|p| Interval {
                start: p.start_time,
                end: p.end_time,
                wet: p.precip_type.is_some()
                    || p.snow_amount_in.is_some_and(|s| s > 0.0)
                    || p.precip_probability.is_some_and(|pr| pr >= WET_PROBABILITY),
            })
            .collect()
    };
    intervals.sort_by_key(|i| i.start);
    intervals
}

/// Onset of the first wet interval and end of the run it starts.
fn precip_window(intervals: &[Interval]) -> Option<PrecipWindow> {
    let first = intervals.iter().position(|i| i.wet)?;
    let run_end = intervals[first..]
        .iter()
        .take_while(|i| i.wet)
        .last()
        .map(|i| i.end)?;

    Some(PrecipWindow {
        onset: intervals[first].start,
        end: run_end,
    })
}
