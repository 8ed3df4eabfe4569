use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::warn;

use crate::types::{Anomaly, AnomalyKind};

/// Why an append failed. Surfaced to the controller, logged, never fatal:
/// the cycle completes and the batch is not re-queued by the core.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Persists or publishes an anomaly batch. At-least-once delivery is
/// acceptable: `append` may see the same batch more than once under retry,
/// so implementations dedup where double-counting would matter. `&self`
/// because one sink may serve several controllers concurrently.
#[async_trait]
pub trait AnomalySink: Send + Sync {
    async fn append(&self, batch: &[Anomaly]) -> Result<(), SinkError>;
}

/// Filter for querying stored anomalies.
#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub kind: Option<AnomalyKind>,
    /// Recency window in hours; `None` means no cutoff.
    pub hours: Option<u32>,
    /// `Some(true)` keeps live entities only, `Some(false)` prematch only.
    pub live: Option<bool>,
    pub limit: usize,
}

struct MemoryStore {
    anomalies: VecDeque<Anomaly>,
    seen: HashSet<(String, AnomalyKind, String, DateTime<Utc>)>,
}

/// Bounded in-memory sink backing the published feed.
///
/// Deduplicates by `(entity_id, kind, market_label, detected_at)` so a
/// batch replayed under retry is counted once. Oldest entries are evicted
/// when the buffer is full.
pub struct MemorySink {
    store: RwLock<MemoryStore>,
    max_size: usize,
}

impl MemorySink {
    pub fn new(max_size: usize) -> Self {
        Self {
            store: RwLock::new(MemoryStore {
                anomalies: VecDeque::with_capacity(max_size.min(1024)),
                seen: HashSet::new(),
            }),
            max_size: max_size.max(1),
        }
    }

    fn dedup_key(anomaly: &Anomaly) -> (String, AnomalyKind, String, DateTime<Utc>) {
        (
            anomaly.entity.entity_id.clone(),
            anomaly.kind,
            anomaly.market_label.clone(),
            anomaly.detected_at,
        )
    }

    /// Stored anomalies matching the filter, newest first.
    pub fn query(&self, filter: &AnomalyFilter, now: DateTime<Utc>) -> Vec<Anomaly> {
        let cutoff = filter.hours.map(|h| now - Duration::hours(i64::from(h)));
        let store = self.store.read();
        store
            .anomalies
            .iter()
            .rev()
            .filter(|a| filter.kind.is_none_or(|k| a.kind == k))
            .filter(|a| cutoff.is_none_or(|c| a.detected_at >= c))
            .filter(|a| filter.live.is_none_or(|l| a.entity.is_live == l))
            .take(filter.limit)
            .cloned()
            .collect()
    }

    /// Count of stored anomalies per kind within the recency window.
    pub fn counts_by_kind(
        &self,
        hours: Option<u32>,
        now: DateTime<Utc>,
    ) -> std::collections::BTreeMap<AnomalyKind, usize> {
        let cutoff = hours.map(|h| now - Duration::hours(i64::from(h)));
        let store = self.store.read();
        let mut counts = std::collections::BTreeMap::new();
        for anomaly in store
            .anomalies
            .iter()
            .filter(|a| cutoff.is_none_or(|c| a.detected_at >= c))
        {
            *counts.entry(anomaly.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.store.read().anomalies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AnomalySink for MemorySink {
    async fn append(&self, batch: &[Anomaly]) -> Result<(), SinkError> {
        let mut store = self.store.write();
        for anomaly in batch {
            if !store.seen.insert(Self::dedup_key(anomaly)) {
                continue;
            }
            if store.anomalies.len() >= self.max_size {
                if let Some(evicted) = store.anomalies.pop_front() {
                    store.seen.remove(&Self::dedup_key(&evicted));
                }
            }
            store.anomalies.push_back(anomaly.clone());
        }
        Ok(())
    }
}

/// Appends one JSON line per anomaly to a log file.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AnomalySink for JsonlSink {
    async fn append(&self, batch: &[Anomaly]) -> Result<(), SinkError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for anomaly in batch {
            let line = serde_json::to_string(anomaly)
                .map_err(|e| SinkError::Transport(e.to_string()))?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

/// Fans a batch out to every child sink. A failing child is logged and the
/// rest still receive the batch; the append succeeds if any child accepted
/// it.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AnomalySink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn AnomalySink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AnomalySink for FanoutSink {
    async fn append(&self, batch: &[Anomaly]) -> Result<(), SinkError> {
        let mut delivered = 0usize;
        for sink in &self.sinks {
            match sink.append(batch).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Sink rejected batch of {}: {e}", batch.len()),
            }
        }
        if delivered == 0 && !self.sinks.is_empty() {
            return Err(SinkError::Transport(
                "no sink accepted the batch".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{EntityRef, Severity};

    use super::*;

    fn make_anomaly(
        entity_id: &str,
        kind: AnomalyKind,
        live: bool,
        detected_at: DateTime<Utc>,
    ) -> Anomaly {
        Anomaly {
            kind,
            severity: Severity::Medium,
            entity: EntityRef {
                entity_id: entity_id.to_string(),
                event_name: format!("Event {entity_id}"),
                league: "League".to_string(),
                sport: "Football".to_string(),
                is_live: live,
            },
            market_label: "1".to_string(),
            before: 2.0,
            after: 1.8,
            change_percent: Some(-10.0),
            detected_at,
        }
    }

    #[tokio::test]
    async fn replayed_batch_is_stored_once() {
        let sink = MemorySink::new(100);
        let now = Utc::now();
        let batch = vec![make_anomaly("E1", AnomalyKind::SharpDrop, false, now)];
        sink.append(&batch).await.unwrap();
        sink.append(&batch).await.unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn eviction_keeps_buffer_bounded() {
        let sink = MemorySink::new(2);
        let now = Utc::now();
        for i in 0..5 {
            let batch = vec![make_anomaly(
                &format!("E{i}"),
                AnomalyKind::SharpDrop,
                false,
                now,
            )];
            sink.append(&batch).await.unwrap();
        }
        assert_eq!(sink.len(), 2);
        let all = sink.query(
            &AnomalyFilter {
                limit: 10,
                ..Default::default()
            },
            now,
        );
        // Newest first, oldest evicted.
        assert_eq!(all[0].entity.entity_id, "E4");
        assert_eq!(all[1].entity.entity_id, "E3");
    }

    #[tokio::test]
    async fn query_filters_kind_recency_and_live() {
        let sink = MemorySink::new(100);
        let now = Utc::now();
        let old = now - Duration::hours(30);
        sink.append(&[
            make_anomaly("E1", AnomalyKind::SharpDrop, false, now),
            make_anomaly("E2", AnomalyKind::SharpRise, true, now),
            make_anomaly("E3", AnomalyKind::SharpDrop, true, old),
        ])
        .await
        .unwrap();

        let drops = sink.query(
            &AnomalyFilter {
                kind: Some(AnomalyKind::SharpDrop),
                limit: 10,
                ..Default::default()
            },
            now,
        );
        assert_eq!(drops.len(), 2);

        let recent = sink.query(
            &AnomalyFilter {
                hours: Some(24),
                limit: 10,
                ..Default::default()
            },
            now,
        );
        assert_eq!(recent.len(), 2);

        let live = sink.query(
            &AnomalyFilter {
                live: Some(true),
                limit: 10,
                ..Default::default()
            },
            now,
        );
        assert_eq!(live.len(), 2);

        let narrow = sink.query(
            &AnomalyFilter {
                kind: Some(AnomalyKind::SharpDrop),
                hours: Some(24),
                live: Some(true),
                limit: 10,
            },
            now,
        );
        assert!(narrow.is_empty());
    }

    #[tokio::test]
    async fn counts_group_by_kind() {
        let sink = MemorySink::new(100);
        let now = Utc::now();
        sink.append(&[
            make_anomaly("E1", AnomalyKind::SharpDrop, false, now),
            make_anomaly("E2", AnomalyKind::SharpDrop, false, now),
            make_anomaly("E3", AnomalyKind::UnbalancedFlow, false, now),
        ])
        .await
        .unwrap();
        let counts = sink.counts_by_kind(Some(24), now);
        assert_eq!(counts.get(&AnomalyKind::SharpDrop), Some(&2));
        assert_eq!(counts.get(&AnomalyKind::UnbalancedFlow), Some(&1));
    }

    #[tokio::test]
    async fn jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anomalies.jsonl");
        let sink = JsonlSink::new(&path);
        let now = Utc::now();
        sink.append(&[make_anomaly("E1", AnomalyKind::SharpDrop, false, now)])
            .await
            .unwrap();
        sink.append(&[make_anomaly("E2", AnomalyKind::SharpRise, false, now)])
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Anomaly = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.entity.entity_id, "E1");
    }

    struct RejectingSink;

    #[async_trait]
    impl AnomalySink for RejectingSink {
        async fn append(&self, _batch: &[Anomaly]) -> Result<(), SinkError> {
            Err(SinkError::Transport("down".to_string()))
        }
    }

    #[tokio::test]
    async fn fanout_tolerates_a_failing_child() {
        let memory = Arc::new(MemorySink::new(100));
        let fanout = FanoutSink::new(vec![Arc::new(RejectingSink), memory.clone()]);
        let batch = vec![make_anomaly("E1", AnomalyKind::SharpDrop, false, Utc::now())];
        assert!(fanout.append(&batch).await.is_ok());
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn fanout_fails_when_every_child_rejects() {
        let fanout = FanoutSink::new(vec![Arc::new(RejectingSink), Arc::new(RejectingSink)]);
        let batch = vec![make_anomaly("E1", AnomalyKind::SharpDrop, false, Utc::now())];
        assert!(fanout.append(&batch).await.is_err());
    }
}
