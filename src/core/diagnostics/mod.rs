//! Pipeline diagnostics engine.
//!
//! One [`Diagnostics`] value owns the topology, the warehouse, the probe
//! client and the history store. Every per-node, per-rule and per-probe check
//! runs on a shared bounded pool; reports are assembled only after every
//! check has resolved, and a full run appends exactly one history row last.

pub mod e2e;
pub mod gaps;
pub mod graph;
pub mod health;
pub mod history;
pub mod reconcile;
pub mod report;

#[cfg(test)]
pub(crate) mod tests;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use self::e2e::ProbeClient;
use self::gaps::GapPolicy;
use self::graph::{TableHealth, TableTarget};
use self::history::{HistoryError, HistoryStore};
use self::reconcile::ReconcilePolicy;
use crate::core::config::Config;
use crate::core::model::{
    ConsistencyReport, E2ECheck, E2ELayer, E2EReport, FlowGraphReport, HistoryReport, PipelineReport,
    RunReport, Status,
};
use crate::core::topology::Topology;
use crate::core::warehouse::{
    DateWindow, SqliteWarehouse, TimedWarehouse, Warehouse, WarehouseError,
};

/// Trailing window of the revenue figure stored with each run.
pub const REVENUE_WINDOW_DAYS: u32 = 7;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub max_concurrency: usize,
    pub query_timeout: Duration,
    pub gaps: GapPolicy,
    pub reconcile: ReconcilePolicy,
    pub history_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            query_timeout: Duration::from_secs(10),
            gaps: GapPolicy::default(),
            reconcile: ReconcilePolicy::default(),
            history_limit: 30,
        }
    }
}

/// E2E checks plus the status of each probed endpoint path, which the flow
/// graph uses for its API nodes.
struct E2EOutcome {
    checks: Vec<E2ECheck>,
    api_statuses: HashMap<String, Status>,
}

pub struct Diagnostics {
    topology: Arc<Topology>,
    warehouse: Arc<dyn Warehouse>,
    probe: ProbeClient,
    history: HistoryStore,
    settings: EngineSettings,
    pool: Arc<Semaphore>,
}

impl Diagnostics {
    pub fn new(
        topology: Arc<Topology>,
        warehouse: Arc<dyn Warehouse>,
        probe: ProbeClient,
        history: HistoryStore,
        settings: EngineSettings,
    ) -> Self {
        let warehouse: Arc<dyn Warehouse> =
            Arc::new(TimedWarehouse::new(warehouse, settings.query_timeout));
        let pool = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
        Self {
            topology,
            warehouse,
            probe,
            history,
            settings,
            pool,
        }
    }

    pub async fn from_config(config: &Config) -> Result<Self> {
        let topology = Topology::load(config.topology_path.as_deref())
            .context("loading pipeline topology")?;
        let warehouse = SqliteWarehouse::open(&config.warehouse.path)
            .with_context(|| format!("opening warehouse {}", config.warehouse.path.display()))?;
        let probe = ProbeClient::new(&config.probe.base_url, config.probe_timeout())
            .context("building HTTP probe client")?;
        let history = HistoryStore::open(&config.history.path)
            .await
            .with_context(|| format!("opening history store {}", config.history.path.display()))?;

        info!(
            sources = topology.sources.len(),
            rules = topology.rules.len(),
            endpoints = topology.e2e.endpoints.len(),
            "Diagnostics engine ready"
        );
        Ok(Self::new(
            Arc::new(topology),
            Arc::new(warehouse),
            probe,
            history,
            config.engine_settings(),
        ))
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Run every future on the shared pool and collect results in input
    /// order. A task that panics yields `Err` with the panic message and
    /// leaves its siblings untouched.
    async fn fan_out<T, Fut>(&self, futures: Vec<Fut>) -> Vec<Result<T, String>>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let count = futures.len();
        let mut set = JoinSet::new();
        let mut slots = HashMap::with_capacity(count);

        for (idx, fut) in futures.into_iter().enumerate() {
            let pool = self.pool.clone();
            let handle = set.spawn(async move {
                let _permit = pool.acquire_owned().await.ok();
                fut.await
            });
            slots.insert(handle.id(), idx);
        }

        let mut results: Vec<Result<T, String>> =
            (0..count).map(|_| Err("check did not complete".to_string())).collect();
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, value)) => {
                    if let Some(&idx) = slots.get(&id) {
                        results[idx] = Ok(value);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Diagnostic task aborted");
                    if let Some(&idx) = slots.get(&e.id()) {
                        results[idx] = Err(e.to_string());
                    }
                }
            }
        }
        results
    }

    async fn probe_tables(&self, today: NaiveDate) -> Vec<TableHealth> {
        let targets: Vec<TableTarget> = self
            .topology
            .table_nodes()
            .iter()
            .map(TableTarget::from)
            .collect();

        let futures = targets
            .iter()
            .cloned()
            .map(|target| {
                let warehouse = self.warehouse.clone();
                let policy = self.settings.gaps;
                async move { graph::probe_table(warehouse.as_ref(), target, today, &policy).await }
            })
            .collect();

        self.fan_out(futures)
            .await
            .into_iter()
            .zip(targets)
            .map(|(result, target)| {
                result.unwrap_or_else(|e| TableHealth::failed(target, &WarehouseError::Query(e)))
            })
            .collect()
    }

    async fn consistency(&self, today: NaiveDate) -> ConsistencyReport {
        let futures = self
            .topology
            .rules
            .iter()
            .cloned()
            .map(|rule| {
                let warehouse = self.warehouse.clone();
                let policy = self.settings.reconcile;
                async move { reconcile::evaluate_rule(warehouse.as_ref(), &rule, today, &policy).await }
            })
            .collect();

        let outcomes: Vec<_> = self
            .fan_out(futures)
            .await
            .into_iter()
            .zip(&self.topology.rules)
            .map(|(result, rule)| {
                result.unwrap_or_else(|e| {
                    vec![reconcile::query_failed(&rule.name, &WarehouseError::Query(e))]
                })
            })
            .collect();

        ConsistencyReport {
            status: reconcile::consistency_status(
                &outcomes,
                self.settings.reconcile.failed_rules_error_threshold,
            ),
            checks: outcomes.into_iter().flatten().collect(),
        }
    }

    async fn e2e_checks(&self, today: NaiveDate) -> E2EOutcome {
        let topology = &self.topology;

        let source_futures = topology
            .sources
            .iter()
            .cloned()
            .map(|source| {
                let warehouse = self.warehouse.clone();
                async move {
                    let started = Instant::now();
                    let stats = warehouse.table_stats(&source.binding).await;
                    let elapsed = started.elapsed().as_millis() as u64;
                    e2e::source_check(&source, &stats, elapsed, today)
                }
            })
            .collect();

        let endpoint_futures = topology
            .e2e
            .endpoints
            .iter()
            .cloned()
            .map(|contract| {
                let probe = self.probe.clone();
                async move {
                    let result = probe.fetch(&contract.path).await;
                    e2e::classify_endpoint(&contract, &result)
                }
            })
            .collect();

        let integration_futures = topology
            .e2e
            .integrations
            .iter()
            .cloned()
            .map(|check| {
                let probe = self.probe.clone();
                async move {
                    let mut probes = Vec::with_capacity(check.steps.len());
                    for step in &check.steps {
                        probes.push(probe.fetch(&step.path).await);
                    }
                    e2e::classify_integration(&check, &probes)
                }
            })
            .collect();

        let (sources, endpoints, integrations) = tokio::join!(
            self.fan_out(source_futures),
            self.fan_out(endpoint_futures),
            self.fan_out(integration_futures),
        );

        let aborted = |name: &str, layer, reason: String| E2ECheck {
            name: name.to_string(),
            layer,
            status: Status::Error,
            message: format!("Check aborted: {}", reason),
            response_time: None,
            record_count: None,
            errors: Some(vec![reason]),
        };

        let mut checks = Vec::new();
        for (result, source) in sources.into_iter().zip(&topology.sources) {
            checks.push(result.unwrap_or_else(|e| {
                aborted(&source.name, E2ELayer::Source, e)
            }));
        }

        let mut api_statuses = HashMap::new();
        for (result, contract) in endpoints.into_iter().zip(&topology.e2e.endpoints) {
            let check = result.unwrap_or_else(|e| {
                aborted(&contract.name, E2ELayer::Api, e)
            });
            let entry = api_statuses
                .entry(contract.path.clone())
                .or_insert(Status::Healthy);
            *entry = entry.join(check.status);
            checks.push(check);
        }

        for (result, check) in integrations.into_iter().zip(&topology.e2e.integrations) {
            checks.push(result.unwrap_or_else(|e| {
                aborted(&check.name, E2ELayer::Integration, e)
            }));
        }

        E2EOutcome {
            checks,
            api_statuses,
        }
    }

    async fn revenue_7d(&self, today: NaiveDate) -> f64 {
        let window = DateWindow::trailing(today, REVENUE_WINDOW_DAYS);
        match self.warehouse.windowed_sum(&self.topology.revenue, window).await {
            Ok(total) => total,
            Err(e) => {
                warn!(error = %e, "Revenue query failed; recording 0");
                0.0
            }
        }
    }

    /// Pipeline-check report: sources, master tables and reconciliation.
    pub async fn pipeline_check(&self, now: DateTime<Utc>) -> PipelineReport {
        let today = now.date_naive();
        let (tables, consistency) = tokio::join!(self.probe_tables(today), self.consistency(today));
        report::pipeline_report(now, &tables, consistency)
    }

    /// Flow-graph report. API and dashboard nodes stay idle: no live probes.
    pub async fn flow_graph(&self, now: DateTime<Utc>) -> FlowGraphReport {
        let tables = self.probe_tables(now.date_naive()).await;
        let nodes = graph::build_nodes(&self.topology, &tables, None);
        let edges = graph::build_edges(&nodes, &tables);
        report::flow_report(now, nodes, edges, self.topology.stages())
    }

    pub async fn e2e(&self, now: DateTime<Utc>) -> E2EReport {
        let outcome = self.e2e_checks(now.date_naive()).await;
        report::e2e_report(now, outcome.checks)
    }

    /// Full run: every read fans out at once, then one history append. The
    /// report is returned even when the append fails.
    pub async fn run(&self, now: DateTime<Utc>) -> RunReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let today = now.date_naive();
        info!(run_id = %run_id, "Starting diagnostics run");

        let (tables, consistency, outcome, revenue_7d) = tokio::join!(
            self.probe_tables(today),
            self.consistency(today),
            self.e2e_checks(today),
            self.revenue_7d(today),
        );

        let nodes = graph::build_nodes(&self.topology, &tables, Some(&outcome.api_statuses));
        let edges = graph::build_edges(&nodes, &tables);
        let flow = report::flow_report(now, nodes, edges, self.topology.stages());
        let pipeline = report::pipeline_report(now, &tables, consistency);
        let e2e = report::e2e_report(now, outcome.checks);
        let overall_status = pipeline.overall_status.join(e2e.overall_status);

        let entry = report::history_entry(
            &run_id,
            now,
            overall_status,
            &pipeline,
            &flow,
            &e2e,
            revenue_7d,
        );
        let history_error = match self.history.append(&entry).await {
            Ok(()) => None,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Run could not be recorded to history");
                Some(e.to_string())
            }
        };

        let health_score = history::health_score(&entry);
        info!(
            run_id = %run_id,
            status = %overall_status,
            health_score,
            "Diagnostics run finished"
        );

        RunReport {
            run_id,
            timestamp: now,
            overall_status,
            health_score,
            pipeline,
            flow,
            e2e,
            history_error,
        }
    }

    /// The most recent `limit` runs (default from settings), newest first.
    pub async fn history(&self, limit: Option<usize>) -> Result<HistoryReport, HistoryError> {
        let limit = limit.unwrap_or(self.settings.history_limit);
        let entries = self.history.recent(limit).await?;
        Ok(history::report(entries))
    }
}
