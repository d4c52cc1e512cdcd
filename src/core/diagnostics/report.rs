//! Report assembly. The severity join is applied once per boundary:
//! per-category, then sources, then sources + master tables + consistency.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::e2e;
use super::graph::TableHealth;
use crate::core::model::{
    ConsistencyReport, E2ECheck, E2EReport, FlowGraphReport, HistoricalLogEntry, NodeType,
    PipelineEdge, PipelineNode, PipelineReport, Status, StatusCounts,
};

/// Category under which raw tables are reported alongside sources.
pub const RAW_CATEGORY: &str = "raw";

/// Issue fragments kept in a history row.
const MAX_SUMMARY_ISSUES: usize = 20;

fn category_of(table: &TableHealth) -> Option<&str> {
    match table.target.node_type {
        NodeType::Source => table.target.category.as_deref(),
        NodeType::RawTable => Some(RAW_CATEGORY),
        _ => None,
    }
}

pub fn source_categories(tables: &[TableHealth]) -> BTreeMap<String, Status> {
    let mut categories: BTreeMap<String, Status> = BTreeMap::new();
    for table in tables {
        if let Some(category) = category_of(table) {
            let entry = categories
                .entry(category.to_string())
                .or_insert(Status::Healthy);
            *entry = entry.join(table.status);
        }
    }
    categories
}

pub fn pipeline_report(
    timestamp: DateTime<Utc>,
    tables: &[TableHealth],
    consistency: ConsistencyReport,
) -> PipelineReport {
    let mut sources = BTreeMap::new();
    let mut master_tables = BTreeMap::new();
    for table in tables {
        let check = table.to_source_check();
        match table.target.node_type {
            NodeType::MasterTable => {
                master_tables.insert(table.target.id.clone(), check);
            }
            _ => {
                sources.insert(table.target.id.clone(), check);
            }
        }
    }

    let source_categories = source_categories(tables);
    let sources_overall = Status::worst(source_categories.values().copied());
    let masters_overall = Status::worst(master_tables.values().map(|m| m.status));
    let overall_status = Status::worst([sources_overall, masters_overall, consistency.status]);

    PipelineReport {
        timestamp,
        overall_status,
        sources,
        source_categories,
        master_tables,
        consistency,
    }
}

pub fn flow_report(
    timestamp: DateTime<Utc>,
    nodes: Vec<PipelineNode>,
    edges: Vec<PipelineEdge>,
    stages: BTreeMap<String, Vec<String>>,
) -> FlowGraphReport {
    FlowGraphReport {
        timestamp,
        nodes,
        edges,
        stages,
    }
}

pub fn e2e_report(timestamp: DateTime<Utc>, checks: Vec<E2ECheck>) -> E2EReport {
    E2EReport {
        timestamp,
        overall_status: Status::worst(checks.iter().map(|c| c.status)),
        summary: e2e::summarize(&checks),
        checks,
    }
}

fn issue_summary(pipeline: &PipelineReport, e2e: &E2EReport) -> String {
    let mut parts = Vec::new();
    for check in pipeline.sources.values().chain(pipeline.master_tables.values()) {
        for issue in &check.issues {
            parts.push(format!("{}: {}", check.name, issue));
        }
    }
    for check in pipeline.consistency.checks.iter().filter(|c| !c.passed) {
        parts.push(format!("{}: {}", check.name, check.message));
    }
    for check in e2e.checks.iter().filter(|c| c.status > Status::Healthy) {
        parts.push(format!("{}: {}", check.name, check.message));
    }

    let extra = parts.len().saturating_sub(MAX_SUMMARY_ISSUES);
    parts.truncate(MAX_SUMMARY_ISSUES);
    if extra > 0 {
        parts.push(format!("(+{} more)", extra));
    }
    parts.join("; ")
}

/// The single history row for one full run.
pub fn history_entry(
    run_id: &str,
    timestamp: DateTime<Utc>,
    overall_status: Status,
    pipeline: &PipelineReport,
    flow: &FlowGraphReport,
    e2e: &E2EReport,
    revenue_7d: f64,
) -> HistoricalLogEntry {
    HistoricalLogEntry {
        run_id: run_id.to_string(),
        timestamp,
        overall_status,
        sources: StatusCounts::tally(pipeline.sources.values().map(|s| s.status)),
        nodes: StatusCounts::tally(flow.nodes.iter().map(|n| n.status)),
        edges: StatusCounts::tally(flow.edges.iter().map(|e| e.status.as_status())),
        e2e_total: e2e.summary.total,
        e2e_passed: e2e.summary.healthy,
        revenue_7d,
        issues: issue_summary(pipeline, e2e),
    }
}
