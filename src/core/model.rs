//! Shared data model for diagnostics runs and the reports they produce.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health of a node or check.
///
/// Variants are declared in ascending severity so the derived `Ord` is the
/// severity order: `idle < healthy < warning < error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Idle,
    Healthy,
    Warning,
    Error,
}

impl Status {
    /// Severity join: the more severe of the two.
    pub fn join(self, other: Status) -> Status {
        self.max(other)
    }

    /// Severity join over a composite. An empty composite is healthy, and
    /// idle members never lower or raise the result above healthy.
    pub fn worst<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
        statuses.into_iter().fold(Status::Healthy, Status::join)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Healthy => "healthy",
            Status::Warning => "warning",
            Status::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Status> {
        match value {
            "idle" => Some(Status::Idle),
            "healthy" => Some(Status::Healthy),
            "warning" => Some(Status::Warning),
            "error" => Some(Status::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Source,
    Scheduler,
    RawTable,
    MasterTable,
    Api,
    Dashboard,
}

impl NodeType {
    pub const STAGES: [NodeType; 6] = [
        NodeType::Source,
        NodeType::Scheduler,
        NodeType::RawTable,
        NodeType::MasterTable,
        NodeType::Api,
        NodeType::Dashboard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Source => "source",
            NodeType::Scheduler => "scheduler",
            NodeType::RawTable => "raw_table",
            NodeType::MasterTable => "master_table",
            NodeType::Api => "api",
            NodeType::Dashboard => "dashboard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    Active,
    Stale,
    Broken,
}

impl EdgeStatus {
    pub fn from_days(days: i64) -> EdgeStatus {
        if days <= 1 {
            EdgeStatus::Active
        } else if days <= 7 {
            EdgeStatus::Stale
        } else {
            EdgeStatus::Broken
        }
    }

    /// Edge health expressed on the node status scale, used for history counts.
    pub fn as_status(&self) -> Status {
        match self {
            EdgeStatus::Active => Status::Healthy,
            EdgeStatus::Stale => Status::Warning,
            EdgeStatus::Broken => Status::Error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    pub last_update: Option<NaiveDate>,
    pub record_count: Option<i64>,
    pub freshness_label: String,
    pub days_since_update: Option<i64>,
    pub issues: Vec<String>,
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_gaps: Option<DateGapReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub status: Status,
    pub metadata: NodeMetadata,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    pub label: String,
    pub status: EdgeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceCheck {
    pub name: String,
    pub status: Status,
    pub last_sync: Option<NaiveDate>,
    pub row_count: i64,
    pub date_range: DateRange,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, serde_json::Value>>,
    /// Missing calendar dates over the gap window; absent for empty or
    /// unreadable tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_gaps: Option<DateGapReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyCheckResult {
    pub name: String,
    pub passed: bool,
    /// Severity the check contributes when it fails. Plain rule failures are
    /// warnings; double-counting anomalies are errors.
    pub severity: Status,
    pub message: String,
    pub expected: serde_json::Value,
    pub actual: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateGapReport {
    pub total_missing: usize,
    pub recent_missing: usize,
    pub all_missing_dates: Vec<NaiveDate>,
    pub recent_missing_dates: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum E2ELayer {
    Source,
    Api,
    Integration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2ECheck {
    pub name: String,
    pub layer: E2ELayer,
    pub status: Status,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub healthy: u32,
    pub warning: u32,
    pub error: u32,
}

impl StatusCounts {
    /// Tally statuses; idle members are not counted.
    pub fn tally<I: IntoIterator<Item = Status>>(statuses: I) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for status in statuses {
            match status {
                Status::Healthy => counts.healthy += 1,
                Status::Warning => counts.warning += 1,
                Status::Error => counts.error += 1,
                Status::Idle => {}
            }
        }
        counts
    }

    pub fn total(&self) -> u32 {
        self.healthy + self.warning + self.error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalLogEntry {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub overall_status: Status,
    pub sources: StatusCounts,
    pub nodes: StatusCounts,
    pub edges: StatusCounts,
    pub e2e_total: u32,
    pub e2e_passed: u32,
    pub revenue_7d: f64,
    pub issues: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub status: Status,
    pub checks: Vec<ConsistencyCheckResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub timestamp: DateTime<Utc>,
    pub overall_status: Status,
    pub sources: BTreeMap<String, DataSourceCheck>,
    pub source_categories: BTreeMap<String, Status>,
    pub master_tables: BTreeMap<String, DataSourceCheck>,
    pub consistency: ConsistencyReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowGraphReport {
    pub timestamp: DateTime<Utc>,
    pub nodes: Vec<PipelineNode>,
    pub edges: Vec<PipelineEdge>,
    pub stages: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2ESummary {
    pub total: u32,
    pub healthy: u32,
    pub warning: u32,
    pub error: u32,
    pub avg_response_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2EReport {
    pub timestamp: DateTime<Utc>,
    pub overall_status: Status,
    pub checks: Vec<E2ECheck>,
    pub summary: E2ESummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryLogView {
    #[serde(flatten)]
    pub entry: HistoricalLogEntry,
    pub health_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummary {
    pub total_runs: usize,
    pub health_percentage: f64,
    pub avg_revenue_7d: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReport {
    pub logs: Vec<HistoryLogView>,
    pub summary: HistorySummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub overall_status: Status,
    pub health_score: f64,
    pub pipeline: PipelineReport,
    pub flow: FlowGraphReport,
    pub e2e: E2EReport,
    /// Set when the run could not be recorded to history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_error: Option<String>,
}
