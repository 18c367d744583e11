//! Drives the periodic full-discovery cycle.
//!
//! Per cycle the state machine walks Idle -> Indexing -> Sampling(k) ->
//! Aggregating -> Building -> Emitting -> Idle. Exactly one cycle runs
//! at a time; ticks that fire while a cycle is in flight are coalesced,
//! never queued. The cycle deadline ends sampling early; a fatal error
//! aborts the cycle and the next tick starts over from scratch.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use k8s_openapi::api::core::v1::Node;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::worker::run_worker_pool;
use crate::aggregation::UsageDataStrategy;
use crate::aggregation::UtilizationDataStrategy;
use crate::cluster::ClusterIndexer;
use crate::cluster::IndexedCluster;
use crate::dto::entities::seed_capacity_samples;
use crate::dto::SnapshotBuilder;
use crate::kubelet::NodeScraper;
use crate::market::MarketTransport;
use crate::metrics::EntityMetricSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Indexing,
    Sampling(usize),
    Aggregating,
    Building,
    Emitting,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub discovery_interval: Duration,
    pub discovery_timeout: Duration,
    pub discovery_workers: usize,
    pub discovery_samples: usize,
    pub discovery_sample_interval: Duration,
    pub validation_workers: usize,
    pub validation_timeout: Duration,
    pub utilization_strategy: UtilizationDataStrategy,
    pub usage_strategy: UsageDataStrategy,
    /// Stitch nodes to their VMs by UUID; IP stitching otherwise.
    pub stitch_with_uuid: bool,
}

/// Cycle status shared with the admin endpoints.
#[derive(Default)]
pub struct DiscoveryStatus {
    phase: Mutex<Option<CyclePhase>>,
    last_success_ms: AtomicI64,
}

impl DiscoveryStatus {
    pub fn phase(&self) -> CyclePhase {
        self.phase
            .lock()
            .expect("poisoned")
            .unwrap_or(CyclePhase::Idle)
    }

    pub fn last_success_ms(&self) -> i64 {
        self.last_success_ms.load(Ordering::SeqCst)
    }

    fn enter(&self, phase: CyclePhase) {
        debug!(?phase, "discovery phase transition");
        *self.phase.lock().expect("poisoned") = Some(phase);
    }

    fn mark_success(&self) {
        self.last_success_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
    }
}

pub struct DiscoveryOrchestrator {
    indexer: ClusterIndexer,
    scraper: Arc<NodeScraper>,
    transport: Arc<dyn MarketTransport>,
    config: DiscoveryConfig,
    status: Arc<DiscoveryStatus>,
}

impl DiscoveryOrchestrator {
    pub fn new(
        indexer: ClusterIndexer,
        scraper: Arc<NodeScraper>,
        transport: Arc<dyn MarketTransport>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            indexer,
            scraper,
            transport,
            config,
            status: Arc::new(DiscoveryStatus::default()),
        }
    }

    pub fn status(&self) -> Arc<DiscoveryStatus> {
        Arc::clone(&self.status)
    }

    /// Runs the startup validation pass and then the periodic discovery
    /// loop until cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        self.validate(&cancel).await;

        let mut interval = tokio::time::interval(self.config.discovery_interval);
        // Coalesce: a cycle that outlives the interval swallows the
        // pending ticks instead of queueing them.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("discovery orchestrator cancelled");
                    break;
                }
                _ = interval.tick() => {
                    match self.run_cycle(&cancel).await {
                        Ok(()) => self.status.mark_success(),
                        Err(e) => error!("discovery cycle failed: {e:#}"),
                    }
                    self.status.enter(CyclePhase::Idle);
                }
            }
        }
    }

    /// A startup dry run: index the topology and scrape one sample over
    /// the validation worker pool. Failure only delays useful data until
    /// the first discovery cycle.
    async fn validate(&self, cancel: &CancellationToken) {
        info!(
            workers = self.config.validation_workers,
            "running startup validation"
        );
        let indexed = match self.indexer.index().await {
            Ok(indexed) => indexed,
            Err(e) => {
                warn!("startup validation could not index the cluster: {e:?}");
                return;
            }
        };

        let sink = Arc::new(EntityMetricSink::new());
        let stats = self
            .scrape_round(
                indexed.nodes.clone(),
                &sink,
                self.config.validation_workers,
                self.config.validation_timeout,
                cancel,
            )
            .await;
        info!(
            nodes = indexed.nodes.len(),
            scraped = stats.completed,
            failed = stats.failed,
            "startup validation finished"
        );
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let cycle_cancel = cancel.child_token();
        let deadline = Instant::now() + self.config.discovery_timeout;
        info!("starting discovery cycle");

        self.status.enter(CyclePhase::Indexing);
        let IndexedCluster { snapshot, nodes } = self
            .indexer
            .index()
            .await
            .map_err(|e| anyhow::anyhow!("indexing topology: {e:?}"))?;

        // A fresh sink per cycle; the previous one is released at the
        // cycle boundary.
        let sink =
            Arc::new(EntityMetricSink::new().with_max_metric_points(self.config.discovery_samples));

        for k in 0..self.config.discovery_samples {
            if cycle_cancel.is_cancelled() {
                warn!("discovery cycle cancelled during sampling");
                break;
            }
            if Instant::now() >= deadline {
                warn!(sub_cycle = k, "discovery deadline reached, ending sampling early");
                break;
            }

            self.status.enter(CyclePhase::Sampling(k));
            let stats = self
                .scrape_round(
                    nodes.clone(),
                    &sink,
                    self.config.discovery_workers,
                    self.config.discovery_timeout,
                    &cycle_cancel,
                )
                .await;
            debug!(sub_cycle = k, ?stats, "sampling sub-cycle complete");

            let is_last = k + 1 == self.config.discovery_samples;
            if !is_last {
                let sleep = self
                    .config
                    .discovery_sample_interval
                    .min(deadline.saturating_duration_since(Instant::now()));
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = cycle_cancel.cancelled() => {}
                }
            }
        }

        self.status.enter(CyclePhase::Aggregating);
        seed_capacity_samples(&snapshot, &sink);

        self.status.enter(CyclePhase::Building);
        let market_snapshot = SnapshotBuilder::new(
            &snapshot,
            &sink,
            self.config.utilization_strategy,
            self.config.usage_strategy,
        )
        .with_uuid_stitching(self.config.stitch_with_uuid)
        .build()
        .context("building snapshot DTOs")?;

        self.status.enter(CyclePhase::Emitting);
        self.transport
            .send_snapshot(&market_snapshot)
            .await
            .context("emitting snapshot to the market")?;

        info!(
            entities = market_snapshot.entities.len(),
            "discovery cycle complete"
        );
        Ok(())
    }

    /// One sampling sub-cycle: every node scraped once through the
    /// bounded pool. Per-node failures are isolated; the round always
    /// completes.
    async fn scrape_round(
        &self,
        nodes: Vec<Node>,
        sink: &Arc<EntityMetricSink>,
        workers: usize,
        per_task_timeout: Duration,
        cancel: &CancellationToken,
    ) -> super::worker::PoolStats {
        let scraper = Arc::clone(&self.scraper);
        let sink = Arc::clone(sink);

        run_worker_pool(
            nodes,
            workers,
            per_task_timeout,
            cancel,
            |node| node.metadata.name.clone().unwrap_or_default(),
            move |node| {
                let scraper = Arc::clone(&scraper);
                let sink = Arc::clone(&sink);
                async move {
                    scraper
                        .scrape(&node, &sink)
                        .await
                        .map_err(|e| format!("{e:?}"))
                }
            },
        )
        .await
    }
}
