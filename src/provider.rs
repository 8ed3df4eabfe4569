use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{MarketEntity, MarketSnapshot};

/// Why a single fetch attempt failed. All variants are recoverable: the
/// navigator retries them within a cycle and the controller skips the
/// cycle once retries are exhausted.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    /// Covers malformed payloads and selector/extraction failures from
    /// scrape-backed providers alike.
    #[error("parse error: {0}")]
    Parse(String),
}

/// Produces a `MarketSnapshot` on demand. The core is agnostic to whether
/// the implementation scrapes a page, calls an HTTP API, or replays a fixture.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch(&self) -> Result<MarketSnapshot, FetchError>;
}

/// One event as served by the upstream money-feed endpoint.
#[derive(Debug, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub league: Option<String>,
    #[serde(default)]
    pub sport: Option<String>,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub minute: Option<u32>,
    #[serde(default)]
    pub odds: BTreeMap<String, f64>,
    #[serde(default)]
    pub limit: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub flow: Option<f64>,
}

/// Polls an HTTP endpoint that returns a JSON array of events.
///
/// All optional/missing-field handling happens here, once, at parse time:
/// raw wire values become typed `Option<T>` fields and out-of-range figures
/// are dropped rather than propagated. `volume` reported by this endpoint
/// is the money wagered since the previous observation.
pub struct HttpSnapshotProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSnapshotProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    async fn fetch(&self) -> Result<MarketSnapshot, FetchError> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Network(format!("unexpected status {status}")));
        }

        let raw: Vec<RawEvent> = response.json().await.map_err(|e| {
            if e.is_decode() {
                FetchError::Parse(e.to_string())
            } else {
                classify_transport_error(e)
            }
        })?;

        let captured_at = Utc::now();
        let mut snapshot = MarketSnapshot::new(captured_at);
        for event in raw {
            match entity_from_raw(event, captured_at) {
                Some(entity) => snapshot.insert(entity),
                None => warn!("Dropping event without a usable id"),
            }
        }
        debug!("Fetched {} entities from {}", snapshot.len(), self.endpoint);
        Ok(snapshot)
    }
}

fn classify_transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e.to_string())
    }
}

/// Convert a raw wire event into a typed entity. Returns `None` when the
/// event has no usable id, since such events cannot be diffed across polls.
pub fn entity_from_raw(raw: RawEvent, captured_at: DateTime<Utc>) -> Option<MarketEntity> {
    let entity_id = raw.id.filter(|id| !id.is_empty())?;
    Some(MarketEntity {
        entity_id,
        event_name: raw.name.filter(|n| !n.is_empty()),
        league: raw.league.filter(|l| !l.is_empty()),
        sport: raw.sport.filter(|s| !s.is_empty()),
        is_live: raw.live,
        match_minute: raw.minute,
        quotes: raw.odds,
        max_stake_limit: raw.limit.filter(|v| v.is_finite() && *v >= 0.0),
        money_volume: raw.volume.filter(|v| v.is_finite() && *v >= 0.0),
        flow_percent: raw.flow.filter(|v| (0.0..=100.0).contains(v)),
        captured_at,
    })
}
