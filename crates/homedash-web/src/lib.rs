//! Axum JSON + dashboard surface for homedash.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use homedash_cache::{Cache, CacheLookup};
use homedash_core::{EnergyPrice, WeatherObservation};
use homedash_fetch::{
    load_recent_prices, EnergyClient, FetchConfig, MinIntervalGate, WeatherClient,
};
use homedash_migrate::{run_batch_from_file, BatchResult, MigrateError, PgDestination};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row};
use tokio::net::TcpListener;
use tracing::warn;

pub const CRATE_NAME: &str = "homedash-web";

const WEATHER_CACHE_KEY: &str = "weather_data";
const WEATHER_CACHE_TTL: Duration = Duration::from_secs(1800);
/// A cached observation older than this is stale and triggers a refetch.
const WEATHER_STALE_MS: i64 = 30 * 60 * 1000;

const ENERGY_CACHE_KEY: &str = "energy:prices:latest";
const ENERGY_CACHE_TTL: Duration = Duration::from_secs(3600);

pub struct AppState {
    pub pg: Option<PgPool>,
    pub cache: Cache,
    pub weather: WeatherClient,
    pub energy: EnergyClient,
    pub sqlite_path: PathBuf,
}

impl AppState {
    pub fn new(
        pg: Option<PgPool>,
        cache: Cache,
        weather: WeatherClient,
        energy: EnergyClient,
        sqlite_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pg,
            cache,
            weather,
            energy,
            sqlite_path: sqlite_path.into(),
        }
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        let pg = match std::env::var("DATABASE_URL") {
            Ok(url) => match PgPool::connect(&url).await {
                Ok(pool) => Some(pool),
                Err(err) => {
                    warn!(error = %err, "database unreachable, continuing without it");
                    None
                }
            },
            Err(_) => None,
        };
        let cache = match std::env::var("REDIS_URL") {
            Ok(url) => match Cache::connect(&url).await {
                Ok(cache) => cache,
                Err(err) => {
                    warn!(error = %err, "cache unreachable, continuing without it");
                    Cache::disabled()
                }
            },
            Err(_) => Cache::disabled(),
        };
        let config = FetchConfig::from_env();
        let gate = Arc::new(MinIntervalGate::new(config.min_fetch_interval));
        let weather = WeatherClient::new(&config, Arc::clone(&gate))?;
        let energy = EnergyClient::new(&config, gate)?;
        let sqlite_path = std::env::var("HOMEDASH_SQLITE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("db-to-migrate/energy.db"));
        Ok(Self::new(pg, cache, weather, energy, sqlite_path))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/migrations/sqlite", get(migrations_sqlite_handler))
        .route("/api/health/kv", get(health_kv_handler))
        .route("/api/metrics/weather", get(metrics_weather_handler))
        .route("/api/metrics/weather/history", get(weather_history_handler))
        .route("/api/metrics/energy", get(metrics_energy_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("HOMEDASH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::from_env().await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    db_configured: bool,
    cache_enabled: bool,
    sqlite_path: String,
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let tpl = IndexTemplate {
        db_configured: state.pg.is_some(),
        cache_enabled: state.cache.is_enabled(),
        sqlite_path: state.sqlite_path.display().to_string(),
    };
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct PagingQuery {
    start: Option<String>,
    batch: Option<String>,
}

#[derive(Debug, Serialize)]
struct MigrationResponse {
    success: bool,
    #[serde(flatten)]
    results: BatchResult,
}

async fn migrations_sqlite_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PagingQuery>,
) -> Response {
    let start = match parse_numeric_param(query.start.as_deref(), 0, "start") {
        Ok(v) => v,
        Err(message) => return client_error(message),
    };
    let batch = match parse_numeric_param(query.batch.as_deref(), 10, "batch") {
        Ok(v) => v,
        Err(message) => return client_error(message),
    };
    if start < 0 {
        return client_error("start must be >= 0");
    }
    if batch <= 0 {
        return client_error("batch must be > 0");
    }

    let Some(pool) = &state.pg else {
        return server_error("DATABASE_URL is not configured");
    };
    let dest = PgDestination::new(pool.clone());
    match run_batch_from_file(&state.sqlite_path, &dest, start, batch).await {
        Ok(results) => Json(MigrationResponse {
            success: true,
            results,
        })
        .into_response(),
        Err(err @ MigrateError::InvalidRange { .. }) => client_error(err.to_string()),
        Err(err) => server_error(err),
    }
}

async fn health_kv_handler(State(state): State<Arc<AppState>>) -> Response {
    let probe = json!({ "timestamp": Utc::now().timestamp_millis() });
    state
        .cache
        .set("health_check", &probe, Some(Duration::from_secs(60)))
        .await;

    match state.cache.get::<serde_json::Value>("health_check").await {
        CacheLookup::Hit(value) => Json(json!({
            "status": "healthy",
            "cache": { "write": true, "read": true, "value": value }
        }))
        .into_response(),
        CacheLookup::Miss => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "unhealthy",
                "error": "probe value was not readable after write"
            })),
        )
            .into_response(),
        CacheLookup::Unavailable => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "unhealthy",
                "error": "cache is unavailable"
            })),
        )
            .into_response(),
    }
}

async fn metrics_weather_handler(State(state): State<Arc<AppState>>) -> Response {
    let cached = state
        .cache
        .get::<WeatherObservation>(WEATHER_CACHE_KEY)
        .await
        .into_option();
    if let Some(observation) = &cached {
        if Utc::now().timestamp_millis() - observation.timestamp_ms < WEATHER_STALE_MS {
            return Json(json!({ "data": observation, "source": "cache" })).into_response();
        }
    }

    match state.weather.fetch(state.pg.as_ref()).await {
        Ok(observation) => {
            state
                .cache
                .set(WEATHER_CACHE_KEY, &observation, Some(WEATHER_CACHE_TTL))
                .await;
            Json(json!({ "data": observation, "source": "api" })).into_response()
        }
        Err(err) if err.is_rate_limited() => match cached {
            // Serve the stale value rather than failing the request.
            Some(observation) => Json(json!({
                "data": observation,
                "source": "cache",
                "notice": "Using cached data due to rate limiting"
            }))
            .into_response(),
            None => server_error(err),
        },
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    days: Option<String>,
}

#[derive(Debug, Serialize)]
struct WeatherHistoryRow {
    timestamp: DateTime<Utc>,
    temp: f64,
    feels_like: f64,
    humidity: f64,
    description: String,
    icon: String,
    wind_speed: Option<f64>,
    wind_deg: Option<f64>,
    pressure: Option<f64>,
    clouds: Option<f64>,
    rain_1h: Option<f64>,
    snow_1h: Option<f64>,
}

async fn weather_history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let days = match parse_numeric_param(query.days.as_deref(), 7, "days") {
        Ok(v) => v,
        Err(message) => return client_error(message),
    };
    if days <= 0 {
        return client_error("days must be > 0");
    }
    let days = days.min(30);

    let Some(pool) = &state.pg else {
        return server_error("DATABASE_URL is not configured");
    };
    match load_weather_history(pool, days).await {
        Ok(rows) => Json(json!({ "data": rows, "count": rows.len() })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn load_weather_history(pool: &PgPool, days: i64) -> anyhow::Result<Vec<WeatherHistoryRow>> {
    // Hourly cadence: 30 days caps the response at 720 rows.
    let limit = days * 24;
    let rows = sqlx::query(
        r#"
        SELECT timestamp, temp, feels_like, humidity, description, icon,
               wind_speed, wind_deg, pressure, clouds, rain_1h, snow_1h
          FROM weather_history
         WHERE timestamp > NOW() - make_interval(days => $1::int)
         ORDER BY timestamp DESC
         LIMIT $2
        "#,
    )
    .bind(days)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(WeatherHistoryRow {
            timestamp: row.try_get("timestamp")?,
            temp: row.try_get("temp")?,
            feels_like: row.try_get("feels_like")?,
            humidity: row.try_get("humidity")?,
            description: row.try_get("description")?,
            icon: row.try_get("icon")?,
            wind_speed: row.try_get("wind_speed")?,
            wind_deg: row.try_get("wind_deg")?,
            pressure: row.try_get("pressure")?,
            clouds: row.try_get("clouds")?,
            rain_1h: row.try_get("rain_1h")?,
            snow_1h: row.try_get("snow_1h")?,
        });
    }
    Ok(out)
}

async fn metrics_energy_handler(State(state): State<Arc<AppState>>) -> Response {
    if let CacheLookup::Hit(prices) = state.cache.get::<Vec<EnergyPrice>>(ENERGY_CACHE_KEY).await {
        return Json(json!({ "success": true, "data": prices, "source": "cache" })).into_response();
    }

    let Some(pool) = &state.pg else {
        return server_error("DATABASE_URL is not configured");
    };
    match load_recent_prices(pool).await {
        Ok(prices) => {
            state
                .cache
                .set(ENERGY_CACHE_KEY, &prices, Some(ENERGY_CACHE_TTL))
                .await;
            Json(json!({ "success": true, "data": prices, "source": "api" })).into_response()
        }
        Err(err) => server_error(err),
    }
}

fn parse_numeric_param(raw: Option<&str>, default: i64, name: &str) -> Result<i64, String> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| format!("{name} must be a valid number")),
    }
}

fn client_error(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = FetchConfig::default();
        let gate = Arc::new(MinIntervalGate::new(config.min_fetch_interval));
        AppState::new(
            None,
            Cache::disabled(),
            WeatherClient::new(&config, Arc::clone(&gate)).expect("weather client"),
            EnergyClient::new(&config, gate).expect("energy client"),
            "/nonexistent/energy.db",
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn non_numeric_paging_params_are_rejected() {
        let app = app(test_state());
        let (status, body) = get_json(app, "/api/migrations/sqlite?start=abc&batch=10").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("start"));
    }

    #[tokio::test]
    async fn negative_start_is_rejected() {
        let app = app(test_state());
        let (status, body) = get_json(app, "/api/migrations/sqlite?start=-5").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn zero_batch_is_rejected() {
        let app = app(test_state());
        let (status, _body) = get_json(app, "/api/migrations/sqlite?batch=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn migration_without_database_is_a_server_error() {
        let app = app(test_state());
        let (status, body) = get_json(app, "/api/migrations/sqlite?start=0&batch=10").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn health_reports_unhealthy_when_cache_is_down() {
        let app = app(test_state());
        let (status, body) = get_json(app, "/api/health/kv").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "unhealthy");
    }

    #[tokio::test]
    async fn weather_without_api_key_is_a_server_error() {
        let app = app(test_state());
        let (status, body) = get_json(app, "/api/metrics/weather").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("OPENWEATHER_API_KEY"));
    }

    #[tokio::test]
    async fn energy_without_database_is_a_server_error() {
        let app = app(test_state());
        let (status, body) = get_json(app, "/api/metrics/energy").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn history_rejects_non_numeric_days() {
        let app = app(test_state());
        let (status, body) = get_json(app, "/api/metrics/weather/history?days=soon").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("days"));
    }

    #[tokio::test]
    async fn index_page_renders() {
        let app = app(test_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Homedash"));
        assert!(text.contains("not configured"));
    }
}
