use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// NWS forecast grid cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridRef {
    pub office: String,
    pub x: i32,
    pub y: i32,
}

impl std::fmt::Display for GridRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{},{}", self.office, self.x, self.y)
    }
}

/// A tracked location, resolved once at setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub id: i64,
    pub zip_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub grid: GridRef,
    pub city: Option<String>,
    pub state: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Location {
    /// "City, ST" when known, the zip code otherwise.
    pub fn display_name(&self) -> String {
        match (&self.city, &self.state) {
            (Some(city), Some(state)) if !city.is_empty() && !state.is_empty() => {
                format!("{}, {}", city, state)
            }
            (Some(city), _) if !city.is_empty() => city.clone(),
            _ => self.zip_code.clone(),
        }
    }
}

/// Location data before it has a database id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLocation {
    pub zip_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub grid: GridRef,
    pub city: Option<String>,
    pub state: Option<String>,
}

/// Dominant precipitation category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecipType {
    Rain,
    Snow,
    Sleet,
    FreezingRain,
    Mixed,
}

impl PrecipType {
    /// Classify forecast wording such as "Chance Rain And Snow" or "Freezing Rain Likely".
    pub fn classify(text: &str) -> Option<Self> {
        let mut t = text.to_lowercase();
        let mut found = Vec::new();

        if t.contains("freezing rain") || t.contains("freezing drizzle") || t.contains("ice storm")
        {
            found.push(Self::FreezingRain);
            t = t
                .replace("freezing rain", "")
                .replace("freezing drizzle", "")
                .replace("ice storm", "");
        }
        if t.contains("sleet") || t.contains("ice pellets") {
            found.push(Self::Sleet);
        }
        let snow = t.contains("snow") || t.contains("flurries") || t.contains("blizzard");
        if snow {
            found.push(Self::Snow);
        }
        let rain = t.contains("rain")
            || t.contains("drizzle")
            || t.contains("thunderstorm")
            || (!snow && t.contains("showers"));
        if rain {
            found.push(Self::Rain);
        }

        match found.as_slice() {
            [] => None,
            [single] => Some(*single),
            _ => Some(Self::Mixed),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Rain => "rain",
            Self::Snow => "snow",
            Self::Sleet => "sleet",
            Self::FreezingRain => "freezing rain",
            Self::Mixed => "wintry mix",
        }
    }
}

/// One named forecast period ("Tonight", "Monday", ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPeriod {
    /// Stable across fetches: `YYYY-MM-DD-day` or `YYYY-MM-DD-night` in the
    /// location's local date.
    pub period_id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub temperature_f: Option<f64>,
    pub snow_amount_in: Option<f64>,
    /// Percent, 0-100
    pub precip_probability: Option<f64>,
    pub precip_type: Option<PrecipType>,
    pub hazard_text: Option<String>,
}

/// One hour of the hourly forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyPoint {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub temperature_f: Option<f64>,
    pub precip_probability: Option<f64>,
    pub precip_type: Option<PrecipType>,
}

/// A gridpoint quantity valid over an interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridValue {
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub value: f64,
}

/// Gridpoint series, already converted to inches / °F / percent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridpointSeries {
    #[serde(default)]
    pub snowfall_in: Vec<GridValue>,
    #[serde(default)]
    pub ice_accumulation_in: Vec<GridValue>,
    #[serde(default)]
    pub wind_chill_f: Vec<GridValue>,
    #[serde(default)]
    pub precip_probability: Vec<GridValue>,
}

/// One fetched forecast for one location at one point in time.
///
/// Never edited once stored; superseded by a later snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSnapshot {
    pub captured_at: DateTime<Utc>,
    pub periods: Vec<ForecastPeriod>,
    #[serde(default)]
    pub hourly: Vec<HourlyPoint>,
    #[serde(default)]
    pub gridpoint: GridpointSeries,
    /// Upstream JSON kept for audit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
}

impl ForecastSnapshot {
    pub fn period(&self, period_id: &str) -> Option<&ForecastPeriod> {
        self.periods.iter().find(|p| p.period_id == period_id)
    }
}

/// Area Forecast Discussion text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discussion {
    pub issued_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub office: String,
    pub text: String,
}

/// A manual measurement entered by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserObservation {
    pub id: i64,
    pub location_id: i64,
    pub observed_at: DateTime<Utc>,
    pub snow_depth_in: Option<f64>,
    pub new_snow_in: Option<f64>,
    pub temperature_f: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewObservation {
    pub observed_at: DateTime<Utc>,
    pub snow_depth_in: Option<f64>,
    pub new_snow_in: Option<f64>,
    pub temperature_f: Option<f64>,
    pub notes: Option<String>,
}

/// Forecast confidence implied by how far ahead a storm starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    VeryHigh,
    High,
    Moderate,
    Low,
    VeryLow,
}

impl Confidence {
    pub fn from_lead_hours(hours: i64) -> Self {
        match hours {
            h if h <= 36 => Self::VeryHigh,
            h if h <= 60 => Self::High,
            h if h <= 96 => Self::Moderate,
            h if h <= 144 => Self::Low,
            _ => Self::VeryLow,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::VeryHigh => "very high",
            Self::High => "high",
            Self::Moderate => "moderate",
            Self::Low => "low",
            Self::VeryLow => "very low",
        }
    }
}

/// A storm: a run of consecutive snowy periods within one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnowEvent {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Period ids in order
    pub periods: Vec<String>,
    pub snow_total_in: f64,
    pub peak_period: String,
    pub peak_snow_in: f64,
    /// Hours from capture to `start_time`, never negative
    pub lead_time_hours: i64,
    pub confidence: Confidence,
    pub has_ice: bool,
    pub has_wind: bool,
}

impl SnowEvent {
    pub fn start_date(&self) -> NaiveDate {
        self.start_time.date_naive()
    }

    /// Date of the last instant of the storm.
    pub fn end_date(&self) -> NaiveDate {
        (self.end_time - chrono::Duration::seconds(1))
            .date_naive()
            .max(self.start_date())
    }

    /// Id for a storm seen for the first time at a location.
    pub fn new_event_id(&self, location_id: i64) -> String {
        let key = format!("{}-{}-{}", location_id, self.start_date(), self.end_date());
        let mut id = hex::encode(Sha256::digest(key.as_bytes()));
        id.truncate(12);
        id
    }

    pub fn headline(&self) -> String {
        let severity = match self.snow_total_in {
            s if s >= 18.0 => "Major winter storm",
            s if s >= 12.0 => "Significant snowstorm",
            s if s >= 6.0 => "Moderate snowstorm",
            s if s >= 3.0 => "Light to moderate snow",
            _ => "Light snow",
        };
        if self.has_ice {
            format!("{} with ice", severity)
        } else {
            severity.to_string()
        }
    }
}

/// A stored storm detection. Detections of the same storm share `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub event_id: String,
    pub detected_at: DateTime<Utc>,
    pub event: SnowEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    SnowTotal,
    Temperature,
    TimingShift,
    PrecipType,
    PrecipProbability,
    NewHazardKeyword,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SnowTotal => "snow_total",
            Self::Temperature => "temperature",
            Self::TimingShift => "timing_shift",
            Self::PrecipType => "precip_type",
            Self::PrecipProbability => "precip_probability",
            Self::NewHazardKeyword => "new_hazard_keyword",
        }
    }

    /// Width used to bucket numeric changes for fingerprinting.
    fn bucket_width(&self) -> f64 {
        match self {
            Self::SnowTotal => 1.0,
            Self::Temperature => 5.0,
            Self::TimingShift => 6.0,
            Self::PrecipProbability => 10.0,
            Self::PrecipType | Self::NewHazardKeyword => 1.0,
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Either side of a detected change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ChangeValue {
    Number(f64),
    Time(DateTime<Utc>),
    Text(String),
    Absent,
}

impl ChangeValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn as_text(&self) -> &str {
        match self {
            Self::Text(t) => t,
            _ => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

/// A significant difference between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Period id. Timing shifts use "onset@<previous time>" or "end@<previous time>"
    pub period: String,
    /// Absolute difference (hours for timing, 1.0 for categorical changes)
    pub magnitude: f64,
    pub previous: ChangeValue,
    pub current: ChangeValue,
    pub severity: Severity,
    /// Capture time of the newer snapshot
    pub detected_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Signed change, current minus previous. Hours for timing shifts.
    pub fn signed_delta(&self) -> Option<f64> {
        match (&self.previous, &self.current) {
            (ChangeValue::Number(p), ChangeValue::Number(c)) => Some(c - p),
            (ChangeValue::Time(p), ChangeValue::Time(c)) => {
                Some((*c - *p).num_minutes() as f64 / 60.0)
            }
            _ => None,
        }
    }

    fn bucket(&self) -> String {
        match self.kind {
            ChangeKind::PrecipType => {
                format!("{}>{}", self.previous.as_text(), self.current.as_text())
            }
            ChangeKind::NewHazardKeyword => self.current.as_text().to_string(),
            _ => {
                let delta = self.signed_delta().unwrap_or(self.magnitude);
                let bucket = (delta / self.kind.bucket_width()).round() as i64;
                bucket.to_string()
            }
        }
    }

    /// Stable identifier of (kind, period, rounded magnitude bucket).
    pub fn fingerprint(&self) -> String {
        let key = format!("{}|{}|{}", self.kind.as_str(), self.period, self.bucket());
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    /// One-line human-readable description
    pub fn summary(&self) -> String {
        match self.kind {
            ChangeKind::SnowTotal => {
                let (p, c) = self.numbers();
                format!(
                    "Snow forecast {} for {}: {:.1}\" → {:.1}\"",
                    if c > p { "increased" } else { "decreased" },
                    self.period,
                    p,
                    c
                )
            }
            ChangeKind::Temperature => {
                let (p, c) = self.numbers();
                format!(
                    "Temperature forecast for {} changed: {:.0}°F → {:.0}°F ({})",
                    self.period,
                    p,
                    c,
                    if c > p { "warmer" } else { "colder" }
                )
            }
            ChangeKind::TimingShift => {
                let what = if self.period.starts_with("end") { "end" } else { "onset" };
                let shift = self.signed_delta().unwrap_or(self.magnitude);
                format!(
                    "Precipitation {} shifted {:.0}h {}: {} → {}",
                    what,
                    shift.abs(),
                    if shift > 0.0 { "later" } else { "earlier" },
                    format_time(&self.previous),
                    format_time(&self.current)
                )
            }
            ChangeKind::PrecipType => format!(
                "Precipitation type for {} changed: {} → {}",
                self.period,
                self.previous.as_text(),
                self.current.as_text()
            ),
            ChangeKind::PrecipProbability => {
                let (p, c) = self.numbers();
                format!(
                    "Precipitation chance for {} {}: {:.0}% → {:.0}%",
                    self.period,
                    if c > p { "increased" } else { "decreased" },
                    p,
                    c
                )
            }
            ChangeKind::NewHazardKeyword => format!(
                "New hazard wording \"{}\" in forecast for {}",
                self.current.as_text(),
                self.period
            ),
        }
    }

    fn numbers(&self) -> (f64, f64) {
        (
            self.previous.as_number().unwrap_or_default(),
            self.current.as_number().unwrap_or_default(),
        )
    }
}

fn format_time(value: &ChangeValue) -> String {
    match value {
        ChangeValue::Time(t) => t.format("%a %m/%d %H:%MZ").to_string(),
        ChangeValue::Absent => "none".to_string(),
        other => other.as_text().to_string(),
    }
}

/// Durable record that a change was already notified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub location_id: i64,
    pub fingerprint: String,
    pub kind: String,
    pub summary: String,
    pub notified_at: DateTime<Utc>,
}
