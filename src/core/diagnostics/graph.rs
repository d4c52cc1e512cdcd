//! Graph builder: turns the topology into measured nodes and derived edges.

use chrono::NaiveDate;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use super::gaps::{self, GapPolicy};
use super::health;
use crate::core::model::{
    DataSourceCheck, DateGapReport, DateRange, EdgeStatus, NodeMetadata, NodeType, PipelineEdge,
    PipelineNode, Status,
};
use crate::core::topology::{DateSpec, MetricColumns, SumSpec, TableBinding, TableNode, Topology};
use crate::core::warehouse::{DateWindow, TableStats, Warehouse, WarehouseError};

/// Window over which per-table metric totals are reported.
pub const METRIC_WINDOW_DAYS: u32 = 7;

/// Owned copy of a table-backed node, so probes can move onto worker tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct TableTarget {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,
    pub category: Option<String>,
    pub binding: TableBinding,
    pub metrics: MetricColumns,
    pub freshness_threshold_days: i64,
    pub dependencies: Vec<String>,
}

impl From<&TableNode<'_>> for TableTarget {
    fn from(node: &TableNode<'_>) -> Self {
        Self {
            id: node.id.to_string(),
            name: node.name.to_string(),
            node_type: node.node_type,
            category: node.category.map(str::to_string),
            binding: node.binding.clone(),
            metrics: node.metrics.cloned().unwrap_or_default(),
            freshness_threshold_days: node.freshness_threshold_days,
            dependencies: node.dependencies.to_vec(),
        }
    }
}

/// Everything measured about one table during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TableHealth {
    pub target: TableTarget,
    pub status: Status,
    /// `None` when the stats query itself failed.
    pub stats: Option<TableStats>,
    pub days_since_update: Option<i64>,
    pub freshness_label: String,
    pub issues: Vec<String>,
    pub gaps: Option<DateGapReport>,
    pub metrics: BTreeMap<String, Value>,
}

impl TableHealth {
    /// A node whose measurement never completed.
    pub fn failed(target: TableTarget, err: &WarehouseError) -> Self {
        Self {
            target,
            status: Status::Error,
            stats: None,
            days_since_update: None,
            freshness_label: health::freshness_label(None),
            issues: vec![health::query_failure_issue(err)],
            gaps: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn query_failed(&self) -> bool {
        self.stats.is_none()
    }

    pub fn to_source_check(&self) -> DataSourceCheck {
        let stats = self.stats.unwrap_or_default();
        DataSourceCheck {
            name: self.target.name.clone(),
            status: self.status,
            last_sync: stats.latest,
            row_count: stats.row_count,
            date_range: DateRange {
                earliest: stats.earliest,
                latest: stats.latest,
            },
            issues: self.issues.clone(),
            metrics: if self.metrics.is_empty() {
                None
            } else {
                Some(self.metrics.clone())
            },
            date_gaps: self.gaps.clone(),
        }
    }

    pub fn to_node(&self) -> PipelineNode {
        PipelineNode {
            id: self.target.id.clone(),
            name: self.target.name.clone(),
            node_type: self.target.node_type,
            status: self.status,
            metadata: NodeMetadata {
                last_update: self.stats.and_then(|s| s.latest),
                record_count: self.stats.map(|s| s.row_count),
                freshness_label: self.freshness_label.clone(),
                days_since_update: self.days_since_update,
                issues: self.issues.clone(),
                metrics: self.metrics.clone(),
                date_gaps: self.gaps.clone(),
            },
            dependencies: self.target.dependencies.clone(),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Measure one table: stats, date completeness and trailing metric totals.
///
/// Never fails; a failed query marks this node `error` and nothing else.
pub async fn probe_table(
    warehouse: &dyn Warehouse,
    target: TableTarget,
    today: NaiveDate,
    gap_policy: &GapPolicy,
) -> TableHealth {
    let stats = warehouse.table_stats(&target.binding).await;
    if let Err(e) = &stats {
        warn!(node = %target.id, error = %e, "Table stats query failed");
    }

    let eval = health::evaluate(&stats, target.freshness_threshold_days, today);
    let mut status = eval.status;
    let mut issues = eval.issues;
    let mut gap_report = None;
    let mut metrics = BTreeMap::new();

    let stats = stats.ok();
    if stats.is_some_and(|s| s.row_count > 0) {
        let date_spec = DateSpec {
            table: target.binding.table.clone(),
            date_column: target.binding.date_column.clone(),
        };
        let window = DateWindow::trailing(today, gap_policy.window_days);
        match warehouse.distinct_dates(&date_spec, window).await {
            Ok(present) => {
                let report = gaps::detect(window, &present, gap_policy.recent_days);
                status = gaps::apply(&report, window.len(), gap_policy, status, &mut issues);
                metrics.insert("missingDates".to_string(), json!(report.total_missing));
                metrics.insert("recentMissingDates".to_string(), json!(report.recent_missing));
                gap_report = Some(report);
            }
            Err(e) => {
                warn!(node = %target.id, error = %e, "Date completeness query failed");
                status = status.join(Status::Error);
                issues.push(health::query_failure_issue(&e));
            }
        }

        let metric_window = DateWindow::trailing(today, METRIC_WINDOW_DAYS);
        for (metric, column) in target.metrics.declared() {
            let spec = SumSpec {
                table: target.binding.table.clone(),
                column: column.to_string(),
                date_column: target.binding.date_column.clone(),
            };
            match warehouse.windowed_sum(&spec, metric_window).await {
                Ok(total) => {
                    metrics.insert(format!("{}7d", metric), json!(round2(total)));
                }
                Err(e) => {
                    warn!(node = %target.id, metric, error = %e, "Metric query failed");
                    status = status.join(Status::Error);
                    issues.push(health::query_failure_issue(&e));
                }
            }
        }
    }

    TableHealth {
        target,
        status,
        stats,
        days_since_update: eval.days_since_update,
        freshness_label: eval.freshness_label,
        issues,
        gaps: gap_report,
        metrics,
    }
}

/// Edge label by destination stage.
pub fn edge_label(to: NodeType) -> &'static str {
    match to {
        NodeType::Source => "feed",
        NodeType::Scheduler => "sync",
        NodeType::RawTable => "load",
        NodeType::MasterTable => "aggregate",
        NodeType::Api => "query",
        NodeType::Dashboard => "render",
    }
}

fn unmeasured_node(
    id: &str,
    name: &str,
    node_type: NodeType,
    status: Status,
    metrics: BTreeMap<String, Value>,
    dependencies: &[String],
) -> PipelineNode {
    PipelineNode {
        id: id.to_string(),
        name: name.to_string(),
        node_type,
        status,
        metadata: NodeMetadata {
            freshness_label: health::freshness_label(None),
            metrics,
            ..Default::default()
        },
        dependencies: dependencies.to_vec(),
    }
}

/// Assemble every node of the topology in stage order.
///
/// Table-backed nodes come from `tables`. Schedulers are always idle. APIs
/// stay idle unless `api_statuses` (keyed by endpoint path) supplies a probe
/// result, and dashboards join the statuses of their probed APIs.
pub fn build_nodes(
    topology: &Topology,
    tables: &[TableHealth],
    api_statuses: Option<&HashMap<String, Status>>,
) -> Vec<PipelineNode> {
    let by_id: HashMap<&str, &TableHealth> =
        tables.iter().map(|t| (t.target.id.as_str(), t)).collect();
    let table_node = |id: &str| by_id.get(id).map(|t| t.to_node());

    let mut nodes = Vec::new();
    nodes.extend(topology.sources.iter().filter_map(|s| table_node(s.id.as_str())));

    for s in &topology.schedulers {
        let metrics = BTreeMap::from([("cadence".to_string(), json!(s.cadence))]);
        nodes.push(unmeasured_node(
            &s.id,
            &s.name,
            NodeType::Scheduler,
            Status::Idle,
            metrics,
            &s.dependencies,
        ));
    }

    nodes.extend(topology.raw_tables.iter().filter_map(|r| table_node(r.id.as_str())));
    nodes.extend(topology.master_tables.iter().filter_map(|m| table_node(m.id.as_str())));

    let mut api_by_id = HashMap::new();
    for a in &topology.apis {
        let status = api_statuses
            .and_then(|m| m.get(&a.endpoint))
            .copied()
            .unwrap_or(Status::Idle);
        api_by_id.insert(a.id.as_str(), status);
        let metrics = BTreeMap::from([("endpoint".to_string(), json!(a.endpoint))]);
        nodes.push(unmeasured_node(
            &a.id,
            &a.name,
            NodeType::Api,
            status,
            metrics,
            &a.dependencies,
        ));
    }

    for d in &topology.dashboards {
        let probed: Vec<Status> = d
            .apis
            .iter()
            .filter_map(|id| api_by_id.get(id.as_str()).copied())
            .filter(|s| *s != Status::Idle)
            .collect();
        let status = if probed.is_empty() {
            Status::Idle
        } else {
            Status::worst(probed)
        };
        nodes.push(unmeasured_node(
            &d.id,
            &d.name,
            NodeType::Dashboard,
            status,
            BTreeMap::new(),
            &d.apis,
        ));
    }

    nodes
}

/// Materialize one edge per declared dependency.
///
/// An edge is graded by the destination's freshness. Destinations without a
/// table (scheduler, api, dashboard) inherit the stalest freshness among
/// their own upstream nodes, so the grade falls back to the origin side.
/// Any edge touching a failed query, or with no freshness at all, is broken.
pub fn build_edges(nodes: &[PipelineNode], tables: &[TableHealth]) -> Vec<PipelineEdge> {
    let failed: HashMap<&str, bool> = tables
        .iter()
        .map(|t| (t.target.id.as_str(), t.query_failed()))
        .collect();

    let mut effective: HashMap<&str, Option<i64>> = HashMap::new();
    for node in nodes {
        let days = if failed.contains_key(node.id.as_str()) {
            node.metadata.days_since_update
        } else {
            let upstream: Option<Vec<i64>> = node
                .dependencies
                .iter()
                .map(|dep| effective.get(dep.as_str()).copied().flatten())
                .collect();
            upstream.and_then(|days| days.into_iter().max())
        };
        effective.insert(node.id.as_str(), days);
    }

    let mut edges = Vec::new();
    for node in nodes {
        for dep in &node.dependencies {
            let touches_failure = failed.get(dep.as_str()).copied().unwrap_or(false)
                || failed.get(node.id.as_str()).copied().unwrap_or(false);
            // table nodes are graded by their own freshness, others by the origin's
            let graded_by = if failed.contains_key(node.id.as_str()) {
                node.id.as_str()
            } else {
                dep.as_str()
            };
            let days = effective.get(graded_by).copied().flatten();
            let status = match days {
                Some(d) if !touches_failure => EdgeStatus::from_days(d),
                _ => EdgeStatus::Broken,
            };
            edges.push(PipelineEdge {
                from: dep.clone(),
                to: node.id.clone(),
                label: edge_label(node.node_type).to_string(),
                status,
            });
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn health_for(
        topology: &Topology,
        id: &str,
        stats: Result<TableStats, WarehouseError>,
        today: NaiveDate,
    ) -> TableHealth {
        let node = topology
            .table_nodes()
            .into_iter()
            .find(|n| n.id == id)
            .unwrap();
        let target = TableTarget::from(&node);
        let eval = health::evaluate(&stats, target.freshness_threshold_days, today);
        TableHealth {
            target,
            status: eval.status,
            stats: stats.ok(),
            days_since_update: eval.days_since_update,
            freshness_label: eval.freshness_label,
            issues: eval.issues,
            gaps: None,
            metrics: BTreeMap::new(),
        }
    }

    fn fresh(latest: &str) -> Result<TableStats, WarehouseError> {
        Ok(TableStats {
            row_count: 10,
            earliest: Some(d("2026-01-01")),
            latest: Some(d(latest)),
        })
    }

    fn all_tables(topology: &Topology, latest: &str, today: NaiveDate) -> Vec<TableHealth> {
        topology
            .table_nodes()
            .iter()
            .map(|n| health_for(topology, n.id, fresh(latest), today))
            .collect()
    }

    #[test]
    fn nodes_follow_stage_order_and_default_to_idle() {
        let topology = Topology::builtin().unwrap();
        let today = d("2026-03-10");
        let tables = all_tables(&topology, "2026-03-10", today);
        let nodes = build_nodes(&topology, &tables, None);

        let expected = topology.sources.len()
            + topology.schedulers.len()
            + topology.raw_tables.len()
            + topology.master_tables.len()
            + topology.apis.len()
            + topology.dashboards.len();
        assert_eq!(nodes.len(), expected);
        assert_eq!(nodes[0].node_type, NodeType::Source);
        assert_eq!(nodes.last().unwrap().node_type, NodeType::Dashboard);

        for node in &nodes {
            match node.node_type {
                NodeType::Scheduler | NodeType::Api | NodeType::Dashboard => {
                    assert_eq!(node.status, Status::Idle, "{}", node.id)
                }
                _ => assert_eq!(node.status, Status::Healthy, "{}", node.id),
            }
        }
        let scheduler = nodes.iter().find(|n| n.id == "daily_sync").unwrap();
        assert!(scheduler.metadata.metrics.contains_key("cadence"));
    }

    #[test]
    fn probed_api_status_flows_into_dashboards() {
        let topology = Topology::builtin().unwrap();
        let today = d("2026-03-10");
        let tables = all_tables(&topology, "2026-03-10", today);
        let statuses = HashMap::from([
            ("/api/ads/performance".to_string(), Status::Healthy),
            ("/api/marketing/roas".to_string(), Status::Warning),
        ]);
        let nodes = build_nodes(&topology, &tables, Some(&statuses));

        let status_of = |id: &str| nodes.iter().find(|n| n.id == id).unwrap().status;
        assert_eq!(status_of("ads_api"), Status::Healthy);
        assert_eq!(status_of("sales_api"), Status::Idle);
        assert_eq!(status_of("marketing_dashboard"), Status::Warning);
        assert_eq!(status_of("sales_dashboard"), Status::Idle);
    }

    #[test]
    fn edge_status_tracks_destination_freshness() {
        let topology = Topology::builtin().unwrap();
        let today = d("2026-03-10");
        let mut tables = all_tables(&topology, "2026-03-10", today);
        for t in tables.iter_mut() {
            if t.target.id == "master_ads" {
                *t = health_for(&topology, "master_ads", fresh("2026-03-05"), today);
            }
            if t.target.id == "master_traffic" {
                *t = health_for(&topology, "master_traffic", fresh("2026-02-01"), today);
            }
        }
        let nodes = build_nodes(&topology, &tables, None);
        let edges = build_edges(&nodes, &tables);

        let edge = |to: &str| edges.iter().find(|e| e.to == to).unwrap();
        assert_eq!(edge("master_sales").status, EdgeStatus::Active);
        assert_eq!(edge("master_ads").status, EdgeStatus::Stale);
        assert_eq!(edge("master_traffic").status, EdgeStatus::Broken);
        assert_eq!(edge("master_sales").label, "aggregate");
        assert_eq!(edge("daily_sync").label, "sync");
    }

    #[test]
    fn failed_query_breaks_touching_edges_only() {
        let topology = Topology::builtin().unwrap();
        let today = d("2026-03-10");
        let mut tables = all_tables(&topology, "2026-03-10", today);
        for t in tables.iter_mut() {
            if t.target.id == "wholesale_sheet" {
                *t = health_for(
                    &topology,
                    "wholesale_sheet",
                    Err(WarehouseError::MissingTable("wholesale_sheet".to_string())),
                    today,
                );
            }
        }
        let nodes = build_nodes(&topology, &tables, None);
        let edges = build_edges(&nodes, &tables);

        let failed = edges
            .iter()
            .find(|e| e.from == "wholesale_sheet")
            .unwrap();
        assert_eq!(failed.status, EdgeStatus::Broken);

        let sibling = edges.iter().find(|e| e.from == "shopify_orders").unwrap();
        assert_eq!(sibling.status, EdgeStatus::Active);

        let node = nodes.iter().find(|n| n.id == "wholesale_sheet").unwrap();
        assert_eq!(node.status, Status::Error);
        assert!(node.metadata.issues[0].contains("wholesale_sheet"));
    }

    #[test]
    fn every_declared_dependency_has_an_edge() {
        let topology = Topology::builtin().unwrap();
        let today = d("2026-03-10");
        let tables = all_tables(&topology, "2026-03-09", today);
        let nodes = build_nodes(&topology, &tables, None);
        let edges = build_edges(&nodes, &tables);
        let declared: usize = nodes.iter().map(|n| n.dependencies.len()).sum();
        assert_eq!(edges.len(), declared);
        assert!(edges.iter().all(|e| e.status == EdgeStatus::Active));
    }
}
