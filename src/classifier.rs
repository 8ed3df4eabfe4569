use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    Anomaly, AnomalyKind, ClassificationReport, EntityRef, MarketEntity, MarketSnapshot,
    Severity, SkippedEntity,
};

/// Market label used for entity-level flow signals.
pub const FLOW_LABEL: &str = "flow";
/// Market label used for entity-level money-volume signals.
pub const VOLUME_LABEL: &str = "volume";
/// Market label used for stake-limit cuts.
pub const LIMIT_LABEL: &str = "limit";

/// One row of the magnitude → severity table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityTier {
    pub min_magnitude_pct: f64,
    pub severity: Severity,
}

/// Threshold/rule configuration for the classifier. Everything here is
/// data: tier boundaries and thresholds are tuned in the config file, not
/// baked into control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// A drop of at least this much (percent) is a `SharpDrop`.
    pub drop_threshold_pct: f64,
    /// A rise of at least this much (percent) is a `SharpRise`.
    pub rise_threshold_pct: f64,
    /// Magnitude tiers mapping |change %| to severity.
    pub severity_tiers: Vec<SeverityTier>,
    /// Flow above this percentage is an `UnbalancedFlow`.
    pub flow_threshold_pct: f64,
    /// Money volume above this figure escalates the entity's anomalies and
    /// is reported as its own signal.
    pub high_volume_threshold: f64,
    /// Minimum quoted-vs-fair edge (percent) for a `ValueBet`.
    pub value_margin_pct: f64,
    /// Half-width of the allowed band around a corridor baseline, percent.
    pub corridor_width_pct: f64,
    /// A stake-limit drop of at least this much (percent) is a `LimitCut`.
    pub limit_cut_pct: f64,
    /// Minute of play from which movement also counts as `LateGameSpike`.
    pub late_game_minute: u32,
    /// Market-label prefixes that mark totals markets.
    pub total_label_prefixes: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            drop_threshold_pct: 5.0,
            rise_threshold_pct: 5.0,
            severity_tiers: vec![
                SeverityTier {
                    min_magnitude_pct: 0.0,
                    severity: Severity::Low,
                },
                SeverityTier {
                    min_magnitude_pct: 10.0,
                    severity: Severity::Medium,
                },
                SeverityTier {
                    min_magnitude_pct: 20.0,
                    severity: Severity::High,
                },
                SeverityTier {
                    min_magnitude_pct: 40.0,
                    severity: Severity::Critical,
                },
            ],
            flow_threshold_pct: 80.0,
            high_volume_threshold: 10_000.0,
            value_margin_pct: 13.0,
            corridor_width_pct: 5.0,
            limit_cut_pct: 50.0,
            late_game_minute: 80,
            total_label_prefixes: vec!["Total".to_string(), "Over".to_string()],
        }
    }
}

impl ClassifierConfig {
    /// Severity for a change magnitude: the highest tier whose floor the
    /// magnitude reaches. Falls back to `Low` when no tier matches.
    pub fn severity_for(&self, magnitude_pct: f64) -> Severity {
        self.severity_tiers
            .iter()
            .filter(|t| magnitude_pct >= t.min_magnitude_pct)
            .map(|t| t.severity)
            .max()
            .unwrap_or(Severity::Low)
    }

    fn is_total_label(&self, label: &str) -> bool {
        self.total_label_prefixes
            .iter()
            .any(|p| label.starts_with(p.as_str()))
    }
}

/// Second-operand source for rules whose baseline is not the previous
/// snapshot: corridor baselines come from another bookmaker, fair odds
/// from an external estimate. Injected so the computation stays out of
/// core scope.
pub trait ReferenceQuotes: Send + Sync {
    fn corridor_baseline(&self, entity_id: &str, market_label: &str) -> Option<f64>;
    fn fair_odds(&self, entity_id: &str, market_label: &str) -> Option<f64>;
}

/// Reference source with no data; corridor and value rules stay silent.
pub struct NoReferences;

impl ReferenceQuotes for NoReferences {
    fn corridor_baseline(&self, _entity_id: &str, _market_label: &str) -> Option<f64> {
        None
    }

    fn fair_odds(&self, _entity_id: &str, _market_label: &str) -> Option<f64> {
        None
    }
}

/// One configured reference quote for an entity's market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub entity_id: String,
    pub market_label: String,
    #[serde(default)]
    pub corridor: Option<f64>,
    #[serde(default)]
    pub fair: Option<f64>,
}

/// Map-backed reference source, loadable from the config file.
#[derive(Debug, Default)]
pub struct StaticReferences {
    corridor: HashMap<(String, String), f64>,
    fair: HashMap<(String, String), f64>,
}

impl StaticReferences {
    pub fn from_entries(entries: &[ReferenceEntry]) -> Self {
        let mut refs = Self::default();
        for entry in entries {
            let key = (entry.entity_id.clone(), entry.market_label.clone());
            if let Some(odd) = entry.corridor.filter(|v| v.is_finite() && *v > 0.0) {
                refs.corridor.insert(key.clone(), odd);
            }
            if let Some(odd) = entry.fair.filter(|v| v.is_finite() && *v > 0.0) {
                refs.fair.insert(key, odd);
            }
        }
        refs
    }
}

impl ReferenceQuotes for StaticReferences {
    fn corridor_baseline(&self, entity_id: &str, market_label: &str) -> Option<f64> {
        self.corridor
            .get(&(entity_id.to_string(), market_label.to_string()))
            .copied()
    }

    fn fair_odds(&self, entity_id: &str, market_label: &str) -> Option<f64> {
        self.fair
            .get(&(entity_id.to_string(), market_label.to_string()))
            .copied()
    }
}

/// A quote is usable by movement rules only above 1.0; the upstream page
/// pads absent outcomes with exactly 1.0.
fn quote_valid(odd: f64) -> bool {
    odd.is_finite() && odd > 1.0
}

/// Percent figures are reported to two decimals; thresholds and tier
/// boundaries compare against the reported value, so a 2.00 → 1.80 move
/// is exactly -10.00%, not a hair under.
fn change_percent(before: f64, after: f64) -> f64 {
    ((after - before) / before * 10_000.0).round() / 100.0
}

/// Classify the diff between two snapshots plus the current snapshot's
/// own flow/volume/reference signals.
///
/// Pure: no I/O, no clock reads (`detected_at` is supplied by the caller),
/// and the same inputs always yield the same report, order included.
/// Malformed entities are recorded as skipped, never abort the pass.
pub fn classify(
    previous: Option<&MarketSnapshot>,
    current: &MarketSnapshot,
    config: &ClassifierConfig,
    references: &dyn ReferenceQuotes,
    detected_at: DateTime<Utc>,
) -> ClassificationReport {
    let mut report = ClassificationReport::default();

    for (entity_id, entity) in &current.entities {
        if entity_id.is_empty() {
            report.skipped.push(SkippedEntity {
                entity_id: entity_id.clone(),
                reason: "missing entity id".to_string(),
            });
            continue;
        }
        if entity.quotes.values().any(|v| !v.is_finite()) {
            report.skipped.push(SkippedEntity {
                entity_id: entity_id.clone(),
                reason: "non-finite quote value".to_string(),
            });
            continue;
        }

        let previous_entity = previous.and_then(|p| p.get(entity_id));
        let mut found = classify_entity(entity, previous_entity, config, references, detected_at);

        // High money volume: always its own low-severity signal, and an
        // escalation of everything else raised for the entity this cycle.
        if let Some(volume) = entity
            .money_volume
            .filter(|v| *v > config.high_volume_threshold)
        {
            for anomaly in &mut found {
                anomaly.severity = anomaly.severity.escalate();
            }
            found.push(Anomaly {
                kind: AnomalyKind::UnbalancedFlow,
                severity: Severity::Low,
                entity: EntityRef::from_entity(entity),
                market_label: VOLUME_LABEL.to_string(),
                before: config.high_volume_threshold,
                after: volume,
                change_percent: None,
                detected_at,
            });
        }

        report.anomalies.append(&mut found);
    }

    report.anomalies.sort_by(|a, b| {
        a.entity
            .entity_id
            .cmp(&b.entity.entity_id)
            .then(a.kind.cmp(&b.kind))
            .then(a.market_label.cmp(&b.market_label))
    });
    report
}

fn classify_entity(
    entity: &MarketEntity,
    previous: Option<&MarketEntity>,
    config: &ClassifierConfig,
    references: &dyn ReferenceQuotes,
    detected_at: DateTime<Utc>,
) -> Vec<Anomaly> {
    let entity_ref = EntityRef::from_entity(entity);
    let mut found = Vec::new();

    let mk = |kind, severity, label: &str, before: f64, after: f64, change: Option<f64>| Anomaly {
        kind,
        severity,
        entity: entity_ref.clone(),
        market_label: label.to_string(),
        before,
        after,
        change_percent: change,
        detected_at,
    };

    let late_game = entity.is_live && entity.match_minute.unwrap_or(0) >= config.late_game_minute;

    // Movement rules need a previous observation of the same entity;
    // without one the entity is new and only snapshot-only rules apply.
    if let Some(prev) = previous {
        for (label, &new_odd) in &entity.quotes {
            if !quote_valid(new_odd) {
                continue;
            }
            let Some(&old_odd) = prev.quotes.get(label) else {
                continue;
            };
            if !quote_valid(old_odd) {
                continue;
            }

            let change_pct = change_percent(old_odd, new_odd);
            let severity = config.severity_for(change_pct.abs());
            let dropped = change_pct <= -config.drop_threshold_pct;
            let risen = change_pct >= config.rise_threshold_pct;

            if dropped {
                found.push(mk(
                    AnomalyKind::SharpDrop,
                    severity,
                    label,
                    old_odd,
                    new_odd,
                    Some(change_pct),
                ));
            } else if risen {
                found.push(mk(
                    AnomalyKind::SharpRise,
                    severity,
                    label,
                    old_odd,
                    new_odd,
                    Some(change_pct),
                ));
            }

            if (dropped || risen) && config.is_total_label(label) {
                found.push(mk(
                    AnomalyKind::TotalOverSpike,
                    severity,
                    label,
                    old_odd,
                    new_odd,
                    Some(change_pct),
                ));
            }
            if (dropped || risen) && late_game {
                found.push(mk(
                    AnomalyKind::LateGameSpike,
                    severity,
                    label,
                    old_odd,
                    new_odd,
                    Some(change_pct),
                ));
            }
        }

        // A previously tradable market vanishing from the board is a cut.
        for (label, &old_odd) in &prev.quotes {
            if quote_valid(old_odd) && !entity.quotes.contains_key(label) {
                found.push(mk(
                    AnomalyKind::LimitCut,
                    Severity::Critical,
                    label,
                    old_odd,
                    0.0,
                    Some(-100.0),
                ));
            }
        }

        if let (Some(old_limit), Some(new_limit)) = (prev.max_stake_limit, entity.max_stake_limit)
        {
            if old_limit > 0.0 {
                let change_pct = change_percent(old_limit, new_limit);
                if change_pct <= -config.limit_cut_pct {
                    found.push(mk(
                        AnomalyKind::LimitCut,
                        Severity::Critical,
                        LIMIT_LABEL,
                        old_limit,
                        new_limit,
                        Some(change_pct),
                    ));
                }
            }
        }
    }

    // Snapshot-only rules: one observation is enough.
    if let Some(flow) = entity
        .flow_percent
        .filter(|f| *f > config.flow_threshold_pct)
    {
        let severity = config.severity_for(flow - config.flow_threshold_pct);
        found.push(mk(
            AnomalyKind::UnbalancedFlow,
            severity,
            FLOW_LABEL,
            config.flow_threshold_pct,
            flow,
            None,
        ));
    }

    for (label, &odd) in &entity.quotes {
        if !quote_valid(odd) {
            continue;
        }

        if let Some(baseline) = references
            .corridor_baseline(&entity.entity_id, label)
            .filter(|b| *b > 0.0)
        {
            let half_width = config.corridor_width_pct / 100.0;
            let low = baseline * (1.0 - half_width);
            let high = baseline * (1.0 + half_width);
            if odd < low || odd > high {
                let change_pct = change_percent(baseline, odd);
                found.push(mk(
                    AnomalyKind::CorridorBreach,
                    config.severity_for(change_pct.abs()),
                    label,
                    baseline,
                    odd,
                    Some(change_pct),
                ));
            }
        }

        if let Some(fair) = references
            .fair_odds(&entity.entity_id, label)
            .filter(|f| *f > 0.0)
        {
            // Quoted odds above fair imply a lower probability than the
            // fair estimate, i.e. the quoted price is value.
            let edge_pct = change_percent(fair, odd);
            if edge_pct >= config.value_margin_pct {
                found.push(mk(
                    AnomalyKind::ValueBet,
                    config.severity_for(edge_pct),
                    label,
                    fair,
                    odd,
                    Some(edge_pct),
                ));
            }
        }
    }

    found
}
