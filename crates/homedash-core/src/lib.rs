//! Core domain records for the homedash backend.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "homedash-core";

/// One row of the legacy sqlite `prices` table, exactly as stored.
///
/// The `date` column is a free-form timestamp string and every numeric column
/// may be absent; nothing about this shape is trusted until it passes
/// [`validate_source_row`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub date: String,
    pub price_energy: Option<f64>,
    pub p1_counter_energy: Option<f64>,
    pub price_gas: Option<f64>,
    pub p1_counter_gas: Option<f64>,
}

/// Canonical destination row, keyed by its unique timestamp.
///
/// `created_at` / `updated_at` are assigned by the destination store and are
/// deliberately not part of this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyPrice {
    pub timestamp: DateTime<Utc>,
    pub price_energy: Option<f64>,
    pub p1_counter_energy: Option<f64>,
    pub price_gas: Option<f64>,
    pub p1_counter_gas: Option<f64>,
}

/// Simplified current-weather observation served to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub temp: f64,
    pub feels_like: f64,
    pub humidity: f64,
    pub description: String,
    pub icon: String,
    /// Wall-clock time the observation was fetched, in unix milliseconds.
    /// Drives the freshness window for cached responses.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
    pub wind_speed: Option<f64>,
    pub wind_deg: Option<f64>,
    pub pressure: Option<f64>,
    pub clouds: Option<f64>,
    pub rain_1h: Option<f64>,
    pub snow_1h: Option<f64>,
}

/// Outcome of validating a single source row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl RowValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }
}

/// Parses the loosely formatted `date` strings found in the legacy archive.
///
/// Accepts RFC 3339 as well as the naive `YYYY-MM-DD[ HH:MM:SS]` variants the
/// old exporter produced; naive values are taken as UTC.
pub fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(day.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Validates one source row against the destination contract.
///
/// The date must parse to a strictly-positive instant and each numeric field,
/// when present, must be a non-negative finite number. An absent field is
/// always valid; it maps to NULL downstream.
pub fn validate_source_row(record: &SourceRecord) -> RowValidation {
    let mut errors = Vec::new();

    match parse_source_timestamp(&record.date) {
        Some(ts) if ts.timestamp() > 0 => {}
        Some(_) => errors.push(format!("date {:?} is not a positive timestamp", record.date)),
        None => errors.push(format!("date {:?} does not parse", record.date)),
    }

    let numeric_fields = [
        ("price_energy", record.price_energy),
        ("p1_counter_energy", record.p1_counter_energy),
        ("price_gas", record.price_gas),
        ("p1_counter_gas", record.p1_counter_gas),
    ];
    for (name, value) in numeric_fields {
        if let Some(v) = value {
            if !v.is_finite() {
                errors.push(format!("{name} is not finite"));
            } else if v < 0.0 {
                errors.push(format!("{name} is negative ({v})"));
            }
        }
    }

    if errors.is_empty() {
        RowValidation::ok()
    } else {
        RowValidation {
            valid: false,
            errors,
        }
    }
}

impl SourceRecord {
    /// Converts a validated row into its destination shape. Returns `None`
    /// when the date does not parse; callers are expected to have run
    /// [`validate_source_row`] first.
    pub fn to_energy_price(&self) -> Option<EnergyPrice> {
        let timestamp = parse_source_timestamp(&self.date)?;
        Some(EnergyPrice {
            timestamp,
            price_energy: self.price_energy,
            p1_counter_energy: self.p1_counter_energy,
            price_gas: self.price_gas,
            p1_counter_gas: self.p1_counter_gas,
        })
    }
}
