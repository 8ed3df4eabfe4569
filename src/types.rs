use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One tradable event-market pair observed at a point in time.
///
/// Produced by a snapshot provider once per poll. All missing-field handling
/// happens at the provider boundary; everything downstream works with
/// `Option<T>` fields, never untyped values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEntity {
    /// Stable identifier across polls. Diffing degrades to "entity is new"
    /// when a provider cannot keep this stable.
    pub entity_id: String,
    pub event_name: Option<String>,
    pub league: Option<String>,
    pub sport: Option<String>,
    pub is_live: bool,
    /// Minute of play; meaningful only when `is_live`.
    pub match_minute: Option<u32>,
    /// Outcome label ("1", "X", "2", "Over 2.5", …) → decimal odds.
    /// Valid odds are strictly > 1.0; the upstream page pads missing
    /// outcomes with 1.0, so values at or below 1.0 are ignored by the
    /// movement rules rather than treated as prices.
    pub quotes: BTreeMap<String, f64>,
    /// Maximum stake the bookmaker currently accepts, when surfaced.
    pub max_stake_limit: Option<f64>,
    /// Money wagered on this entity since the previous observation.
    pub money_volume: Option<f64>,
    /// Percentage (0–100) of staked money concentrated on one outcome.
    pub flow_percent: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl MarketEntity {
    /// Human-readable label for alerts and the feed, frozen at detection.
    pub fn display_name(&self) -> &str {
        self.event_name.as_deref().unwrap_or(&self.entity_id)
    }
}

/// A complete observation of all tracked entities at one instant,
/// keyed by `entity_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub entities: BTreeMap<String, MarketEntity>,
    pub captured_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            entities: BTreeMap::new(),
            captured_at,
        }
    }

    /// Insert an entity, last-write-wins on duplicate ids.
    pub fn insert(&mut self, entity: MarketEntity) {
        self.entities.insert(entity.entity_id.clone(), entity);
    }

    pub fn get(&self, entity_id: &str) -> Option<&MarketEntity> {
        self.entities.get(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Classified anomaly kinds. Serialized snake_case, the vocabulary the
/// dashboard and alert consumers filter on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    SharpDrop,
    SharpRise,
    ValueBet,
    UnbalancedFlow,
    TotalOverSpike,
    LateGameSpike,
    CorridorBreach,
    LimitCut,
}

/// Severity tier, derived from magnitude thresholds and never hand-set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Bump one tier, saturating at `Critical`.
    pub fn escalate(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

/// Identity and labels of the entity an anomaly refers to, frozen at
/// detection time, since the source entity may vanish from later snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_id: String,
    pub event_name: String,
    pub league: String,
    pub sport: String,
    pub is_live: bool,
}

impl EntityRef {
    pub fn from_entity(entity: &MarketEntity) -> Self {
        Self {
            entity_id: entity.entity_id.clone(),
            event_name: entity.display_name().to_string(),
            league: entity.league.clone().unwrap_or_default(),
            sport: entity.sport.clone().unwrap_or_default(),
            is_live: entity.is_live,
        }
    }
}

/// One detected deviation. Created once, immutable, owned by the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub entity: EntityRef,
    /// Affected outcome ("1", "Over 2.5"); "volume" for money-flow signals.
    pub market_label: String,
    /// Kind-dependent: odds pair for drop/rise/corridor, volume or flow
    /// pair for flow-based kinds.
    pub before: f64,
    pub after: f64,
    /// `(after - before) / before * 100`, present only when `before > 0`.
    pub change_percent: Option<f64>,
    pub detected_at: DateTime<Utc>,
}

/// Data-quality diagnostic for an entity the classifier could not process.
/// Recorded and skipped; a classification pass is never aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedEntity {
    pub entity_id: String,
    pub reason: String,
}

/// Output of one classification pass: ordered anomalies plus diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ClassificationReport {
    /// Ordered by entity id, then kind, then market label; stable across
    /// repeated passes over the same snapshot pair.
    pub anomalies: Vec<Anomaly>,
    pub skipped: Vec<SkippedEntity>,
}
