//! Clients for the external weather and energy-price APIs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{TimeZone, Utc};
use homedash_core::{EnergyPrice, WeatherObservation};
use serde::Deserialize;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

pub const CRATE_NAME: &str = "homedash-fetch";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limit: wait before making another request")]
    RateLimited,
    #[error("{0} is not configured")]
    MissingConfig(&'static str),
    #[error("{api} responded with status {status}")]
    HttpStatus { api: &'static str, status: u16 },
    #[error("malformed upstream payload: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// Process-wide minimum-interval gate shared by all external fetchers.
///
/// At most one call is allowed per interval; a second attempt inside the
/// window fails with [`FetchError::RateLimited`]. Built on `Instant` so the
/// clock is monotonic. Construct once at startup and hand out `Arc` clones.
#[derive(Debug)]
pub struct MinIntervalGate {
    min_interval: Duration,
    last_pass: Mutex<Option<Instant>>,
}

impl MinIntervalGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_pass: Mutex::new(None),
        }
    }

    pub async fn try_pass(&self) -> Result<(), FetchError> {
        let mut last = self.last_pass.lock().await;
        if let Some(previous) = *last {
            if previous.elapsed() < self.min_interval {
                return Err(FetchError::RateLimited);
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }
}

/// Environment-driven settings for the outbound HTTP clients.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub min_fetch_interval: Duration,
    pub openweather_api_key: Option<String>,
    pub enever_api_token: Option<String>,
    pub enever_base_url: String,
    pub domoticz_url: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "homedash/0.1".to_string(),
            // The weather upstream allows 60 calls/minute; one per second
            // keeps a wide margin.
            min_fetch_interval: Duration::from_millis(1000),
            openweather_api_key: None,
            enever_api_token: None,
            enever_base_url: "https://enever.nl/api".to_string(),
            domoticz_url: None,
            latitude: 52.3676,
            longitude: 4.9041,
        }
    }
}

impl FetchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: std::env::var("HOMEDASH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("HOMEDASH_USER_AGENT").unwrap_or(defaults.user_agent),
            min_fetch_interval: std::env::var("HOMEDASH_MIN_FETCH_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_fetch_interval),
            openweather_api_key: std::env::var("OPENWEATHER_API_KEY").ok(),
            enever_api_token: std::env::var("ENEVER_API_TOKEN").ok(),
            enever_base_url: std::env::var("ENEVER_BASE_URL").unwrap_or(defaults.enever_base_url),
            domoticz_url: std::env::var("DOMOTICZ_URL").ok(),
            latitude: std::env::var("HOMEDASH_LAT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.latitude),
            longitude: std::env::var("HOMEDASH_LON")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.longitude),
        }
    }
}

fn build_client(config: &FetchConfig) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .gzip(true)
        .timeout(config.timeout)
        .user_agent(config.user_agent.clone())
        .build()
        .context("building reqwest client")
}

// OpenWeather current-weather wire format, reduced to the fields we keep.

#[derive(Debug, Deserialize)]
struct OwmResponse {
    main: OwmMain,
    weather: Vec<OwmCondition>,
    wind: Option<OwmWind>,
    clouds: Option<OwmClouds>,
    rain: Option<OwmPrecipitation>,
    snow: Option<OwmPrecipitation>,
    dt: i64,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
    feels_like: f64,
    humidity: f64,
    pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmCondition {
    description: String,
    icon: String,
}

#[derive(Debug, Deserialize)]
struct OwmWind {
    speed: Option<f64>,
    deg: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmClouds {
    all: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmPrecipitation {
    #[serde(rename = "1h")]
    one_hour: Option<f64>,
}

/// Current-weather client. Observations can optionally be archived to the
/// `weather_history` table; that write is best-effort and never fails the
/// fetch itself.
pub struct WeatherClient {
    client: reqwest::Client,
    api_key: Option<String>,
    latitude: f64,
    longitude: f64,
    gate: Arc<MinIntervalGate>,
}

impl WeatherClient {
    pub fn new(config: &FetchConfig, gate: Arc<MinIntervalGate>) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            api_key: config.openweather_api_key.clone(),
            latitude: config.latitude,
            longitude: config.longitude,
            gate,
        })
    }

    pub async fn fetch(
        &self,
        history_pool: Option<&PgPool>,
    ) -> Result<WeatherObservation, FetchError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(FetchError::MissingConfig("OPENWEATHER_API_KEY"))?;
        self.gate.try_pass().await?;

        let url = format!(
            "https://api.openweathermap.org/data/2.5/weather?lat={}&lon={}&units=metric&appid={}",
            self.latitude, self.longitude, api_key
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus {
                api: "openweather",
                status: response.status().as_u16(),
            });
        }

        let raw: serde_json::Value = response.json().await?;
        let body: OwmResponse = serde_json::from_value(raw.clone())?;
        let condition = body
            .weather
            .first()
            .ok_or(FetchError::Malformed("empty weather condition list"))?;

        let observation = WeatherObservation {
            temp: body.main.temp.round(),
            feels_like: body.main.feels_like.round(),
            humidity: body.main.humidity,
            description: condition.description.clone(),
            icon: condition.icon.clone(),
            timestamp_ms: Utc::now().timestamp_millis(),
            wind_speed: body.wind.as_ref().and_then(|w| w.speed),
            wind_deg: body.wind.as_ref().and_then(|w| w.deg),
            pressure: body.main.pressure,
            clouds: body.clouds.as_ref().and_then(|c| c.all),
            rain_1h: body.rain.as_ref().and_then(|r| r.one_hour),
            snow_1h: body.snow.as_ref().and_then(|s| s.one_hour),
        };

        if let Some(pool) = history_pool {
            self.record_history(pool, &body, &observation, &raw).await;
        }

        Ok(observation)
    }

    async fn record_history(
        &self,
        pool: &PgPool,
        body: &OwmResponse,
        observation: &WeatherObservation,
        raw: &serde_json::Value,
    ) {
        let observed_at = match Utc.timestamp_opt(body.dt, 0).single() {
            Some(ts) => ts,
            None => {
                warn!(dt = body.dt, "weather history skipped: bad observation time");
                return;
            }
        };
        let outcome = sqlx::query(
            r#"
            INSERT INTO weather_history (
                timestamp, temp, feels_like, humidity, description, icon,
                wind_speed, wind_deg, pressure, clouds, rain_1h, snow_1h,
                lat, lon, location_name, raw_data
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(observed_at)
        .bind(observation.temp)
        .bind(observation.feels_like)
        .bind(observation.humidity)
        .bind(&observation.description)
        .bind(&observation.icon)
        .bind(observation.wind_speed)
        .bind(observation.wind_deg)
        .bind(observation.pressure)
        .bind(observation.clouds)
        .bind(observation.rain_1h)
        .bind(observation.snow_1h)
        .bind(self.latitude)
        .bind(self.longitude)
        .bind(body.name.as_deref())
        .bind(raw)
        .execute(pool)
        .await;

        if let Err(err) = outcome {
            warn!(error = %err, "failed to record weather history");
        }
    }
}

/// Which day-ahead feed to ask the price provider for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceFeed {
    Energy,
    Gas,
}

impl PriceFeed {
    fn endpoint(self) -> &'static str {
        match self {
            Self::Energy => "stroomprijs_morgen.php",
            Self::Gas => "gasprijs_vandaag.php",
        }
    }
}

/// Day-ahead price feed client plus the Domoticz P1 meter bridge.
pub struct EnergyClient {
    client: reqwest::Client,
    api_token: Option<String>,
    base_url: String,
    domoticz_url: Option<String>,
    gate: Arc<MinIntervalGate>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct P1Counters {
    pub energy: f64,
    pub gas: f64,
}

#[derive(Debug, Deserialize)]
struct DomoticzReply {
    result: Vec<DomoticzDevice>,
}

#[derive(Debug, Deserialize)]
struct DomoticzDevice {
    #[serde(rename = "Counter")]
    counter: String,
}

impl EnergyClient {
    pub fn new(config: &FetchConfig, gate: Arc<MinIntervalGate>) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            api_token: config.enever_api_token.clone(),
            base_url: config.enever_base_url.trim_end_matches('/').to_string(),
            domoticz_url: config
                .domoticz_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            gate,
        })
    }

    /// Fetches the raw day-ahead price payload for one feed.
    pub async fn fetch_day_ahead(&self, feed: PriceFeed) -> Result<serde_json::Value, FetchError> {
        let token = self
            .api_token
            .as_deref()
            .ok_or(FetchError::MissingConfig("ENEVER_API_TOKEN"))?;
        self.gate.try_pass().await?;

        let url = format!("{}/{}?token={}", self.base_url, feed.endpoint(), token);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus {
                api: "enever",
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    /// Reads the P1 meter counters (energy rid=1, gas rid=5) from Domoticz.
    pub async fn fetch_p1_counters(&self) -> Result<P1Counters, FetchError> {
        let base = self
            .domoticz_url
            .as_deref()
            .ok_or(FetchError::MissingConfig("DOMOTICZ_URL"))?;
        self.gate.try_pass().await?;

        let energy = self.read_counter(base, 1).await?;
        let gas = self.read_counter(base, 5).await?;
        Ok(P1Counters { energy, gas })
    }

    async fn read_counter(&self, base: &str, rid: u32) -> Result<f64, FetchError> {
        let url = format!("{base}/json.htm?type=devices&rid={rid}");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus {
                api: "domoticz",
                status: response.status().as_u16(),
            });
        }
        let reply: DomoticzReply = response.json().await?;
        let device = reply
            .result
            .first()
            .ok_or(FetchError::Malformed("empty Domoticz device list"))?;
        device
            .counter
            .parse()
            .map_err(|_| FetchError::Malformed("Domoticz counter is not numeric"))
    }
}

/// Loads the last 24 hours of stored prices, newest first.
pub async fn load_recent_prices(pool: &PgPool) -> anyhow::Result<Vec<EnergyPrice>> {
    let rows = sqlx::query(
        r#"
        SELECT timestamp, price_energy, p1_counter_energy, price_gas, p1_counter_gas
          FROM energy_prices
         WHERE timestamp >= NOW() - INTERVAL '24 hours'
         ORDER BY timestamp DESC
        "#,
    )
    .fetch_all(pool)
    .await
    .context("querying recent energy prices")?;

    let mut prices = Vec::with_capacity(rows.len());
    for row in rows {
        prices.push(EnergyPrice {
            timestamp: row.try_get("timestamp")?,
            price_energy: row.try_get("price_energy")?,
            p1_counter_energy: row.try_get("p1_counter_energy")?,
            price_gas: row.try_get("price_gas")?,
            p1_counter_gas: row.try_get("p1_counter_gas")?,
        });
    }
    Ok(prices)
}
