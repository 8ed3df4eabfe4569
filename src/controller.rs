use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::classifier::{ClassifierConfig, ReferenceQuotes, classify};
use crate::navigator::RetryNavigator;
use crate::provider::SnapshotProvider;
use crate::sink::AnomalySink;
use crate::types::MarketSnapshot;

/// Controller-level settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Pause between poll cycles, in seconds.
    pub poll_interval_secs: u64,
    /// When set, the previous snapshot is persisted here and restored on
    /// startup, so a restart diffs against the last observed state instead
    /// of treating every entity as new.
    pub state_path: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            state_path: None,
        }
    }
}

/// What one cycle did, for logging and tests.
#[derive(Debug, Clone, Copy)]
pub struct CycleReport {
    pub fetched: bool,
    pub anomalies: usize,
    pub published: bool,
    pub skipped: usize,
}

/// Lifetime counters, reported once on shutdown.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunSummary {
    pub cycles: u64,
    pub failed_fetches: u64,
    pub anomalies_published: u64,
    pub entities_skipped: u64,
}

/// Owns the poll loop for one provider: fetch via the retry navigator,
/// diff against the held previous snapshot, hand anomalies to the sink,
/// retain the fresh snapshot for the next cycle.
///
/// The previous snapshot is exclusively owned here and exposed to the
/// classifier only as a read-only borrow for the duration of one cycle;
/// cycles never overlap.
pub struct PollController<P> {
    navigator: RetryNavigator<P>,
    classifier: ClassifierConfig,
    references: Arc<dyn ReferenceQuotes>,
    sink: Arc<dyn AnomalySink>,
    config: ControllerConfig,
    previous: Option<MarketSnapshot>,
    summary: RunSummary,
}

impl<P: SnapshotProvider> PollController<P> {
    pub fn new(
        navigator: RetryNavigator<P>,
        classifier: ClassifierConfig,
        references: Arc<dyn ReferenceQuotes>,
        sink: Arc<dyn AnomalySink>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            navigator,
            classifier,
            references,
            sink,
            config,
            previous: None,
            summary: RunSummary::default(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    /// Restore the persisted previous snapshot, if configured and present.
    /// Called before the first fetch; a corrupt state file is logged and
    /// ignored rather than blocking startup.
    pub fn load_state(&mut self) {
        let Some(path) = self.config.state_path.clone() else {
            return;
        };
        match read_state(&path) {
            Ok(Some(snapshot)) => {
                info!(
                    "Restored previous snapshot ({} entities) from {}",
                    snapshot.len(),
                    path.display()
                );
                self.previous = Some(snapshot);
            }
            Ok(None) => {
                info!("No snapshot state at {} (first run)", path.display());
            }
            Err(e) => {
                warn!("Ignoring unreadable snapshot state: {e:#}");
            }
        }
    }

    /// One full Fetching → Classifying → Publishing pass.
    ///
    /// Never propagates an error: a terminal fetch failure leaves the held
    /// previous snapshot untouched so the next cycle diffs against the
    /// last successfully observed state, and a sink failure is logged with
    /// the cycle still completing.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.summary.cycles += 1;

        let current = match self.navigator.fetch().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("No snapshot this cycle: {e}");
                self.summary.failed_fetches += 1;
                return CycleReport {
                    fetched: false,
                    anomalies: 0,
                    published: false,
                    skipped: 0,
                };
            }
        };

        let report = classify(
            self.previous.as_ref(),
            &current,
            &self.classifier,
            self.references.as_ref(),
            Utc::now(),
        );
        for skipped in &report.skipped {
            warn!(
                "Skipped entity '{}': {}",
                skipped.entity_id, skipped.reason
            );
        }
        self.summary.entities_skipped += report.skipped.len() as u64;

        let published = if report.anomalies.is_empty() {
            debug!("No anomalies across {} entities", current.len());
            false
        } else {
            info!(
                "Detected {} anomalies across {} entities",
                report.anomalies.len(),
                current.len()
            );
            match self.sink.append(&report.anomalies).await {
                Ok(()) => {
                    self.summary.anomalies_published += report.anomalies.len() as u64;
                    true
                }
                Err(e) => {
                    warn!("Failed to publish anomaly batch: {e}");
                    false
                }
            }
        };

        if let Some(path) = self.config.state_path.clone() {
            if let Err(e) = write_state(&path, &current) {
                warn!("Failed to persist snapshot state: {e:#}");
            }
        }
        self.previous = Some(current);

        CycleReport {
            fetched: true,
            anomalies: report.anomalies.len(),
            published,
            skipped: report.skipped.len(),
        }
    }

    /// The poll loop: cycle, wait, repeat until the shutdown channel
    /// flips. Both the in-flight cycle and the inter-cycle wait are raced
    /// against the channel, so a stop signal during any suspension drops
    /// the cycle without publishing and stops promptly.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.load_state();
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        info!(
            "Entering polling loop (interval: {}s)",
            self.config.poll_interval_secs
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                report = self.run_cycle() => {
                    debug!(
                        "Cycle complete: fetched={} anomalies={} skipped={}",
                        report.fetched, report.anomalies, report.skipped
                    );
                }
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        let summary = self.summary;
        info!(
            "Stopped after {} cycles — {} anomalies published, {} failed fetches, {} entities skipped",
            summary.cycles,
            summary.anomalies_published,
            summary.failed_fetches,
            summary.entities_skipped
        );
        Ok(())
    }
}

fn read_state(path: &Path) -> Result<Option<MarketSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(snapshot))
}

/// Write the snapshot to a sibling temp file, then rename over the target,
/// so the state file is never observed partially written.
fn write_state(path: &Path, snapshot: &MarketSnapshot) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let contents = serde_json::to_string(snapshot).context("failed to serialize snapshot")?;
    std::fs::write(&tmp, contents)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use parking_lot::RwLock;

    use crate::classifier::NoReferences;
    use crate::navigator::NavigatorConfig;
    use crate::provider::FetchError;
    use crate::sink::{MemorySink, SinkError};
    use crate::types::{Anomaly, AnomalyKind, MarketEntity};

    use super::*;

    fn make_entity(id: &str, odd: f64) -> MarketEntity {
        MarketEntity {
            entity_id: id.to_string(),
            event_name: Some(format!("Event {id}")),
            league: None,
            sport: None,
            is_live: false,
            match_minute: None,
            quotes: BTreeMap::from([("1".to_string(), odd)]),
            max_stake_limit: None,
            money_volume: None,
            flow_percent: None,
            captured_at: Utc::now(),
        }
    }

    fn snapshot_with(entities: Vec<MarketEntity>) -> MarketSnapshot {
        let mut snapshot = MarketSnapshot::new(Utc::now());
        for entity in entities {
            snapshot.insert(entity);
        }
        snapshot
    }

    /// Pops scripted responses, then keeps failing; counts provider calls.
    struct ScriptedProvider {
        responses: Mutex<Vec<Result<MarketSnapshot, FetchError>>>,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<MarketSnapshot, FetchError>>) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    responses: Mutex::new(responses),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl SnapshotProvider for ScriptedProvider {
        async fn fetch(&self) -> Result<MarketSnapshot, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(FetchError::Network("script exhausted".to_string()))
            } else {
                responses.remove(0)
            }
        }
    }

    struct RejectingSink;

    #[async_trait]
    impl AnomalySink for RejectingSink {
        async fn append(&self, _batch: &[Anomaly]) -> Result<(), SinkError> {
            Err(SinkError::Transport("down".to_string()))
        }
    }

    /// Collects appended batches.
    #[derive(Default)]
    struct CollectingSink {
        batches: RwLock<Vec<Vec<Anomaly>>>,
    }

    #[async_trait]
    impl AnomalySink for CollectingSink {
        async fn append(&self, batch: &[Anomaly]) -> Result<(), SinkError> {
            self.batches.write().push(batch.to_vec());
            Ok(())
        }
    }

    fn fast_navigator(provider: ScriptedProvider, max_attempts: u32) -> RetryNavigator<ScriptedProvider> {
        RetryNavigator::new(
            provider,
            NavigatorConfig {
                max_attempts,
                attempt_timeout_secs: 5,
                retry_delay_secs: 0,
                settle_delay_secs: 0,
            },
        )
    }

    fn make_controller(
        provider: ScriptedProvider,
        max_attempts: u32,
        sink: Arc<dyn AnomalySink>,
        config: ControllerConfig,
    ) -> PollController<ScriptedProvider> {
        PollController::new(
            fast_navigator(provider, max_attempts),
            ClassifierConfig::default(),
            Arc::new(NoReferences),
            sink,
            config,
        )
    }

    #[tokio::test]
    async fn diffs_consecutive_snapshots_and_publishes() {
        let (provider, _) = ScriptedProvider::new(vec![
            Ok(snapshot_with(vec![make_entity("E1", 2.00)])),
            Ok(snapshot_with(vec![make_entity("E1", 1.80)])),
        ]);
        let sink = Arc::new(CollectingSink::default());
        let mut controller =
            make_controller(provider, 1, sink.clone(), ControllerConfig::default());

        let first = controller.run_cycle().await;
        assert!(first.fetched);
        assert_eq!(first.anomalies, 0);

        let second = controller.run_cycle().await;
        assert!(second.published);
        assert_eq!(second.anomalies, 1);

        let batches = sink.batches.read();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].kind, AnomalyKind::SharpDrop);
        assert_eq!(batches[0][0].entity.entity_id, "E1");
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_snapshot() {
        let (provider, _) = ScriptedProvider::new(vec![
            Ok(snapshot_with(vec![make_entity("E1", 2.00)])),
            Err(FetchError::Network("outage".to_string())),
            Ok(snapshot_with(vec![make_entity("E1", 1.80)])),
        ]);
        let sink = Arc::new(CollectingSink::default());
        let mut controller =
            make_controller(provider, 1, sink.clone(), ControllerConfig::default());

        controller.run_cycle().await;
        let failed = controller.run_cycle().await;
        assert!(!failed.fetched);

        // The third cycle diffs against the first snapshot, not the outage.
        let third = controller.run_cycle().await;
        assert_eq!(third.anomalies, 1);
        assert_eq!(controller.summary().failed_fetches, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_skip_classification() {
        let (provider, calls) = ScriptedProvider::new(vec![]);
        let sink = Arc::new(CollectingSink::default());
        let mut controller =
            make_controller(provider, 3, sink.clone(), ControllerConfig::default());

        let report = controller.run_cycle().await;
        assert!(!report.fetched);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(sink.batches.read().is_empty());
        assert!(controller.previous.is_none());
    }

    #[tokio::test]
    async fn sink_failure_does_not_abort_the_cycle() {
        let (provider, _) = ScriptedProvider::new(vec![
            Ok(snapshot_with(vec![make_entity("E1", 2.00)])),
            Ok(snapshot_with(vec![make_entity("E1", 1.80)])),
        ]);
        let mut controller = make_controller(
            provider,
            1,
            Arc::new(RejectingSink),
            ControllerConfig::default(),
        );

        controller.run_cycle().await;
        let report = controller.run_cycle().await;
        assert!(report.fetched);
        assert_eq!(report.anomalies, 1);
        assert!(!report.published);
        // The fresh snapshot is still retained for the next diff.
        assert!(controller.previous.is_some());
    }

    #[tokio::test]
    async fn stop_during_waiting_prevents_the_next_fetch() {
        let (provider, calls) = ScriptedProvider::new(vec![Ok(snapshot_with(vec![
            make_entity("E1", 2.00),
        ]))]);
        let sink = Arc::new(CollectingSink::default());
        let mut controller = make_controller(
            provider,
            1,
            sink,
            ControllerConfig {
                poll_interval_secs: 3600,
                state_path: None,
            },
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            controller.run(shutdown_rx).await.unwrap();
            controller.summary()
        });

        // Let the first cycle finish, then stop during the waiting sleep.
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let summary = handle.await.unwrap();
        assert_eq!(summary.cycles, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_state_round_trips_across_controllers() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("snapshot_state.json");
        let config = ControllerConfig {
            poll_interval_secs: 60,
            state_path: Some(state_path.clone()),
        };

        let (provider, _) = ScriptedProvider::new(vec![Ok(snapshot_with(vec![make_entity(
            "E1", 2.00,
        )]))]);
        let sink = Arc::new(CollectingSink::default());
        let mut first = make_controller(provider, 1, sink.clone(), config.clone());
        first.run_cycle().await;
        assert!(state_path.exists());

        // A fresh controller restores the state and diffs against it.
        let (provider, _) = ScriptedProvider::new(vec![Ok(snapshot_with(vec![make_entity(
            "E1", 1.80,
        )]))]);
        let mut second = make_controller(provider, 1, sink.clone(), config);
        second.load_state();
        let report = second.run_cycle().await;
        assert_eq!(report.anomalies, 1);
    }

    #[tokio::test]
    async fn memory_sink_integration_feeds_queries() {
        let (provider, _) = ScriptedProvider::new(vec![
            Ok(snapshot_with(vec![make_entity("E1", 2.00)])),
            Ok(snapshot_with(vec![make_entity("E1", 1.50)])),
        ]);
        let memory = Arc::new(MemorySink::new(100));
        let mut controller =
            make_controller(provider, 1, memory.clone(), ControllerConfig::default());
        controller.run_cycle().await;
        controller.run_cycle().await;
        assert_eq!(memory.len(), 1);
    }
}
