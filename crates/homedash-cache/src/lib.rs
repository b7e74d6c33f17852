//! Best-effort Redis cache wrapper.
//!
//! Every operation swallows its own errors: a broken or absent Redis must
//! never take a request down with it. `get` makes the failure case explicit
//! in its return type instead of pretending it was a miss, so callers can
//! still tell the two apart when they care (the health endpoint does).

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

pub const CRATE_NAME: &str = "homedash-cache";

/// Result of a cache read. `Miss` means the key was absent; `Unavailable`
/// means the cache itself failed (connection error, corrupt payload).
/// Callers treat both the same way unless they are probing cache health.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Hit(T),
    Miss,
    Unavailable,
}

impl<T> CacheLookup<T> {
    /// Folds `Miss` and `Unavailable` into `None`.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Hit(value) => Some(value),
            Self::Miss | Self::Unavailable => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// Handle to the remote key-value store. Values are stored as JSON strings.
///
/// Cloning is cheap; the underlying connection manager multiplexes.
#[derive(Clone)]
pub struct Cache {
    conn: Option<ConnectionManager>,
}

impl Cache {
    /// Connects to Redis at `url`. Startup is the one place a cache error
    /// is surfaced instead of swallowed.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn: Some(conn) })
    }

    /// A cache that ignores all operations. The system stays correct with
    /// this in place; everything it backs is advisory.
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheLookup<T> {
        let Some(conn) = &self.conn else {
            return CacheLookup::Unavailable;
        };
        let mut conn = conn.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(payload)) => match serde_json::from_str(&payload) {
                Ok(value) => CacheLookup::Hit(value),
                Err(err) => {
                    warn!(key, error = %err, "cache payload failed to decode");
                    CacheLookup::Unavailable
                }
            },
            Ok(None) => CacheLookup::Miss,
            Err(err) => {
                warn!(key, error = %err, "cache get failed");
                CacheLookup::Unavailable
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let Some(conn) = &self.conn else {
            return;
        };
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key, error = %err, "cache value failed to encode");
                return;
            }
        };
        let mut conn = conn.clone();
        let outcome = match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, payload, ttl.as_secs().max(1))
                    .await
            }
            None => conn.set::<_, _, ()>(key, payload).await,
        };
        if let Err(err) = outcome {
            warn!(key, error = %err, "cache set failed");
        }
    }

    pub async fn del(&self, key: &str) {
        let Some(conn) = &self.conn else {
            return;
        };
        let mut conn = conn.clone();
        if let Err(err) = conn.del::<_, i64>(key).await {
            warn!(key, error = %err, "cache del failed");
        }
    }
}
