//! Declarative pipeline topology.
//!
//! The registry describes every stage of the pipeline (sources, schedulers,
//! raw tables, master tables, APIs and dashboards), the reconciliation rules
//! run against the warehouse and the API contracts probed end-to-end. It is
//! loaded once at startup; adding a pipeline stage is a data change.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::core::model::NodeType;

const TOPOLOGY_JSON: &str = include_str!("topology.json");

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Invalid topology document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Could not read topology file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Rule '{rule}' references table '{table}' which no node declares")]
    UnknownTable { rule: String, table: String },

    #[error("Topology declares no sources")]
    Empty,
}

/// Physical table backing a node, and the column carrying its calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBinding {
    pub table: String,
    pub date_column: String,
}

/// Metric columns a table exposes. Which columns exist is declared per
/// source, never inferred from the table name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricColumns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revenue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<String>,
}

impl MetricColumns {
    /// `(metric name, column)` pairs in a stable order.
    pub fn declared(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if let Some(col) = &self.revenue {
            out.push(("revenue", col.as_str()));
        }
        if let Some(col) = &self.spend {
            out.push(("spend", col.as_str()));
        }
        if let Some(col) = &self.sessions {
            out.push(("sessions", col.as_str()));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub name: String,
    pub category: String,
    #[serde(flatten)]
    pub binding: TableBinding,
    #[serde(default)]
    pub metrics: MetricColumns,
    pub freshness_threshold_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerDescriptor {
    pub id: String,
    pub name: String,
    pub cadence: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTableDescriptor {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub binding: TableBinding,
    pub freshness_threshold_days: i64,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterDescriptor {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub binding: TableBinding,
    #[serde(default)]
    pub metrics: MetricColumns,
    pub freshness_threshold_days: i64,
    #[serde(default)]
    pub upstream: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDescriptor {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub apis: Vec<String>,
}

/// `SUM(column)` over a table's rows inside the evaluation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumSpec {
    pub table: String,
    pub column: String,
    pub date_column: String,
}

/// A table's date column, used for `MAX(date)` and distinct-date queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateSpec {
    pub table: String,
    pub date_column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub absolute_epsilon: f64,
    /// Allowed discrepancy in percent of the source total.
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCheck {
    AggregateEquality {
        master: SumSpec,
        sources: Vec<SumSpec>,
        tolerance: Tolerance,
    },
    DerivedFreshness {
        derived: DateSpec,
        upstream: Vec<DateSpec>,
    },
    DateAlignment {
        left: DateSpec,
        right: DateSpec,
    },
    Duplicates {
        table: String,
        date_column: String,
        key_columns: Vec<String>,
    },
    DerivedRatio {
        numerator: SumSpec,
        denominator: SumSpec,
    },
}

impl RuleCheck {
    fn tables(&self) -> Vec<&str> {
        match self {
            RuleCheck::AggregateEquality { master, sources, .. } => std::iter::once(master)
                .chain(sources.iter())
                .map(|s| s.table.as_str())
                .collect(),
            RuleCheck::DerivedFreshness { derived, upstream } => std::iter::once(derived)
                .chain(upstream.iter())
                .map(|s| s.table.as_str())
                .collect(),
            RuleCheck::DateAlignment { left, right } => {
                vec![left.table.as_str(), right.table.as_str()]
            }
            RuleCheck::Duplicates { table, .. } => vec![table.as_str()],
            RuleCheck::DerivedRatio {
                numerator,
                denominator,
            } => vec![numerator.table.as_str(), denominator.table.as_str()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(flatten)]
    pub check: RuleCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointContract {
    pub name: String,
    pub path: String,
    /// JSON pointer (RFC 6901) to the record collection in the response body.
    pub data_pointer: String,
    #[serde(default)]
    pub min_records: usize,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationPolicy {
    /// Every step must return data; anything less is an error.
    RequireAll,
    /// Partial data is a warning; only a fully empty flow is an error.
    DegradeToWarning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationStep {
    pub path: String,
    pub data_pointer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationCheck {
    pub name: String,
    pub policy: IntegrationPolicy,
    pub steps: Vec<IntegrationStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct E2ESpec {
    #[serde(default)]
    pub endpoints: Vec<EndpointContract>,
    #[serde(default)]
    pub integrations: Vec<IntegrationCheck>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub sources: Vec<SourceDescriptor>,
    #[serde(default)]
    pub schedulers: Vec<SchedulerDescriptor>,
    #[serde(default)]
    pub raw_tables: Vec<RawTableDescriptor>,
    #[serde(default)]
    pub master_tables: Vec<MasterDescriptor>,
    #[serde(default)]
    pub apis: Vec<ApiDescriptor>,
    #[serde(default)]
    pub dashboards: Vec<DashboardDescriptor>,
    pub revenue: SumSpec,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub e2e: E2ESpec,
}

/// A node whose health is measured from its backing table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableNode<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub node_type: NodeType,
    pub category: Option<&'a str>,
    pub binding: &'a TableBinding,
    pub metrics: Option<&'a MetricColumns>,
    pub freshness_threshold_days: i64,
    pub dependencies: &'a [String],
}

impl Topology {
    /// The topology compiled into the binary.
    pub fn builtin() -> Result<Self, TopologyError> {
        Self::from_json(TOPOLOGY_JSON)
    }

    pub fn from_json(text: &str) -> Result<Self, TopologyError> {
        let topology: Topology = serde_json::from_str(text)?;
        topology.validate()?;
        Ok(topology)
    }

    pub fn from_path(path: &Path) -> Result<Self, TopologyError> {
        let text = std::fs::read_to_string(path).map_err(|source| TopologyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Built-in topology unless an override path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, TopologyError> {
        match path {
            Some(p) => Self::from_path(p),
            None => Self::builtin(),
        }
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.sources.is_empty() {
            return Err(TopologyError::Empty);
        }

        let mut ids = HashSet::new();
        for (id, _) in self.node_entries() {
            if !ids.insert(id) {
                return Err(TopologyError::DuplicateNode(id.to_string()));
            }
        }

        for (id, deps) in self.node_entries() {
            for dep in deps {
                if !ids.contains(dep.as_str()) {
                    return Err(TopologyError::UnknownDependency {
                        node: id.to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let tables: HashSet<&str> = self
            .table_nodes()
            .iter()
            .map(|n| n.binding.table.as_str())
            .collect();
        for rule in &self.rules {
            for table in rule.check.tables() {
                if !tables.contains(table) {
                    return Err(TopologyError::UnknownTable {
                        rule: rule.name.clone(),
                        table: table.to_string(),
                    });
                }
            }
        }
        if !tables.contains(self.revenue.table.as_str()) {
            return Err(TopologyError::UnknownTable {
                rule: "revenue".to_string(),
                table: self.revenue.table.clone(),
            });
        }

        Ok(())
    }

    /// `(id, dependencies)` for every node in stage order.
    fn node_entries(&self) -> Vec<(&str, &[String])> {
        let mut out: Vec<(&str, &[String])> = Vec::new();
        out.extend(self.sources.iter().map(|s| (s.id.as_str(), &[][..])));
        out.extend(
            self.schedulers
                .iter()
                .map(|s| (s.id.as_str(), s.dependencies.as_slice())),
        );
        out.extend(
            self.raw_tables
                .iter()
                .map(|r| (r.id.as_str(), r.dependencies.as_slice())),
        );
        out.extend(
            self.master_tables
                .iter()
                .map(|m| (m.id.as_str(), m.upstream.as_slice())),
        );
        out.extend(
            self.apis
                .iter()
                .map(|a| (a.id.as_str(), a.dependencies.as_slice())),
        );
        out.extend(
            self.dashboards
                .iter()
                .map(|d| (d.id.as_str(), d.apis.as_slice())),
        );
        out
    }

    /// Sources, raw tables and master tables, in that order.
    pub fn table_nodes(&self) -> Vec<TableNode<'_>> {
        let mut out = Vec::new();
        for s in &self.sources {
            out.push(TableNode {
                id: &s.id,
                name: &s.name,
                node_type: NodeType::Source,
                category: Some(&s.category),
                binding: &s.binding,
                metrics: Some(&s.metrics),
                freshness_threshold_days: s.freshness_threshold_days,
                dependencies: &[],
            });
        }
        for r in &self.raw_tables {
            out.push(TableNode {
                id: &r.id,
                name: &r.name,
                node_type: NodeType::RawTable,
                category: None,
                binding: &r.binding,
                metrics: None,
                freshness_threshold_days: r.freshness_threshold_days,
                dependencies: &r.dependencies,
            });
        }
        for m in &self.master_tables {
            out.push(TableNode {
                id: &m.id,
                name: &m.name,
                node_type: NodeType::MasterTable,
                category: None,
                binding: &m.binding,
                metrics: Some(&m.metrics),
                freshness_threshold_days: m.freshness_threshold_days,
                dependencies: &m.upstream,
            });
        }
        out
    }

    /// Node ids grouped by stage name, in declaration order.
    pub fn stages(&self) -> BTreeMap<String, Vec<String>> {
        let mut stages = BTreeMap::new();
        let mut put = |stage: NodeType, ids: Vec<String>| {
            stages.insert(stage.as_str().to_string(), ids);
        };
        put(NodeType::Source, self.sources.iter().map(|s| s.id.clone()).collect());
        put(NodeType::Scheduler, self.schedulers.iter().map(|s| s.id.clone()).collect());
        put(NodeType::RawTable, self.raw_tables.iter().map(|r| r.id.clone()).collect());
        put(
            NodeType::MasterTable,
            self.master_tables.iter().map(|m| m.id.clone()).collect(),
        );
        put(NodeType::Api, self.apis.iter().map(|a| a.id.clone()).collect());
        put(NodeType::Dashboard, self.dashboards.iter().map(|d| d.id.clone()).collect());
        stages
    }
}
