//! Reconciliation rules: cross-checks between master tables and the sources
//! they are built from.
//!
//! Every rule is a [`RuleSpec`] from the topology. Querying is done by
//! [`evaluate_rule`]; the comparisons themselves are plain functions over the
//! queried values so they can be tested without a warehouse.

use chrono::NaiveDate;
use serde_json::json;
use std::collections::BTreeSet;
use tracing::info;

use super::health::truncate_reason;
use crate::core::model::{ConsistencyCheckResult, Status};
use crate::core::topology::{DateSpec, RuleCheck, RuleSpec, Tolerance};
use crate::core::warehouse::{DateWindow, Warehouse, WarehouseError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilePolicy {
    pub window_days: u32,
    /// Percent difference above which a master total is flagged as double counted.
    pub double_count_threshold_pct: f64,
    pub derived_lag_days: i64,
    /// More failed rules than this turns the consistency status into an error.
    pub failed_rules_error_threshold: usize,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            window_days: 7,
            double_count_threshold_pct: 50.0,
            derived_lag_days: 1,
            failed_rules_error_threshold: 2,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn fmt_date(d: Option<NaiveDate>) -> serde_json::Value {
    match d {
        Some(d) => json!(d.format("%Y-%m-%d").to_string()),
        None => serde_json::Value::Null,
    }
}

/// `|master - source| / source` in percent.
///
/// With a zero source the ratio is undefined: equal totals count as 0% and a
/// non-zero master as a full 100% discrepancy.
pub fn percent_diff(master: f64, source: f64) -> f64 {
    if source == 0.0 {
        if master == 0.0 { 0.0 } else { 100.0 }
    } else {
        ((master - source).abs() / source.abs()) * 100.0
    }
}

pub fn query_failed(name: &str, err: &WarehouseError) -> ConsistencyCheckResult {
    ConsistencyCheckResult {
        name: name.to_string(),
        passed: false,
        severity: Status::Error,
        message: format!("Query failed: {}", truncate_reason(&err.to_string())),
        expected: serde_json::Value::Null,
        actual: serde_json::Value::Null,
    }
}

/// Aggregate equality plus the independent double-counting finding.
pub fn compare_aggregates(
    name: &str,
    master: f64,
    source: f64,
    tolerance: Tolerance,
    double_count_threshold_pct: f64,
) -> Vec<ConsistencyCheckResult> {
    let diff = master - source;
    let pct = percent_diff(master, source);
    let passed = diff.abs() < tolerance.absolute_epsilon || pct < tolerance.percent;

    let message = if passed {
        format!("Totals match within tolerance (diff {:.2}%)", pct)
    } else {
        format!(
            "Master total differs from sources by {:.2} ({:.2}%, tolerance {}%)",
            diff, pct, tolerance.percent
        )
    };

    let mut results = vec![ConsistencyCheckResult {
        name: name.to_string(),
        passed,
        severity: Status::Warning,
        message,
        expected: json!(round2(source)),
        actual: json!(round2(master)),
    }];

    if source > 0.0 && pct > double_count_threshold_pct {
        let ratio = master / source;
        results.push(ConsistencyCheckResult {
            name: format!("{} - double counting", name),
            passed: false,
            severity: Status::Error,
            message: format!(
                "Possible double counting: master total is {:.1}x the source total",
                ratio
            ),
            expected: json!("1.0x"),
            actual: json!(format!("{:.1}x", ratio)),
        });
    }

    results
}

pub fn compare_freshness(
    name: &str,
    derived: Option<NaiveDate>,
    upstream: Option<NaiveDate>,
    max_lag_days: i64,
) -> ConsistencyCheckResult {
    let (passed, message) = match (derived, upstream) {
        (Some(d), Some(u)) => {
            let lag = (u - d).num_days();
            if lag <= max_lag_days {
                (true, format!("Derived table lags sources by {} day(s)", lag.max(0)))
            } else {
                (
                    false,
                    format!(
                        "Derived table is {} days behind its sources (max {})",
                        lag, max_lag_days
                    ),
                )
            }
        }
        (None, Some(_)) => (false, "Derived table has no dated rows".to_string()),
        (_, None) => (false, "Upstream sources have no dated rows".to_string()),
    };

    ConsistencyCheckResult {
        name: name.to_string(),
        passed,
        severity: Status::Warning,
        message,
        expected: fmt_date(upstream),
        actual: fmt_date(derived),
    }
}

pub fn compare_alignment(
    name: &str,
    window: DateWindow,
    left: (&str, &BTreeSet<NaiveDate>),
    right: (&str, &BTreeSet<NaiveDate>),
) -> ConsistencyCheckResult {
    let missing = |present: &BTreeSet<NaiveDate>| -> Vec<String> {
        window
            .dates()
            .filter(|d| !present.contains(d))
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect()
    };
    let left_missing = missing(left.1);
    let right_missing = missing(right.1);
    let passed = left_missing.is_empty() && right_missing.is_empty();

    let message = if passed {
        format!("{} and {} cover every date in the window", left.0, right.0)
    } else {
        format!(
            "{} is missing {} date(s), {} is missing {} date(s)",
            left.0,
            left_missing.len(),
            right.0,
            right_missing.len()
        )
    };

    ConsistencyCheckResult {
        name: name.to_string(),
        passed,
        severity: Status::Warning,
        message,
        expected: json!(window.len()),
        actual: {
            let mut per_table = serde_json::Map::new();
            per_table.insert(left.0.to_string(), json!(left_missing));
            per_table.insert(right.0.to_string(), json!(right_missing));
            serde_json::Value::Object(per_table)
        },
    }
}

pub fn duplicates_result(name: &str, table: &str, groups: u64) -> ConsistencyCheckResult {
    ConsistencyCheckResult {
        name: name.to_string(),
        passed: groups == 0,
        severity: Status::Warning,
        message: if groups == 0 {
            format!("No duplicate rows in {}", table)
        } else {
            format!("{} duplicate key group(s) in {}", groups, table)
        },
        expected: json!(0),
        actual: json!(groups),
    }
}

pub fn ratio_result(name: &str, numerator: f64, denominator: f64) -> ConsistencyCheckResult {
    let ratio = if denominator == 0.0 {
        None
    } else {
        Some(numerator / denominator)
    };
    let passed = matches!(ratio, Some(r) if r.is_finite() && r > 0.0);

    ConsistencyCheckResult {
        name: name.to_string(),
        passed,
        severity: Status::Warning,
        message: match ratio {
            Some(r) if passed => format!("Ratio is {:.2}", r),
            Some(r) => format!("Ratio {:.2} is not a positive finite value", r),
            None => "Denominator is zero; ratio undefined".to_string(),
        },
        expected: json!("> 0"),
        actual: ratio
            .filter(|r| r.is_finite())
            .map(|r| json!(round2(r)))
            .unwrap_or(serde_json::Value::Null),
    }
}

/// Consistency status over all rule outcomes.
///
/// Counts failed rules against a fixed threshold: none is healthy, up to
/// `error_threshold` is warning, more is error. The worst severity of any
/// failed finding is then joined in. The two rules disagree for a lone
/// error-severity finding (a double-counting anomaly or a failed query): the
/// count says warning, the finding says error, and error wins.
pub fn consistency_status(outcomes: &[Vec<ConsistencyCheckResult>], error_threshold: usize) -> Status {
    let failed_rules = outcomes
        .iter()
        .filter(|results| results.iter().any(|r| !r.passed))
        .count();

    let by_count = if failed_rules > error_threshold {
        Status::Error
    } else if failed_rules > 0 {
        Status::Warning
    } else {
        Status::Healthy
    };

    let by_severity = Status::worst(
        outcomes
            .iter()
            .flatten()
            .filter(|r| !r.passed)
            .map(|r| r.severity),
    );

    by_count.join(by_severity)
}

async fn latest_of(
    warehouse: &dyn Warehouse,
    specs: &[DateSpec],
) -> Result<Option<NaiveDate>, WarehouseError> {
    let mut latest = None;
    for spec in specs {
        latest = latest.max(warehouse.max_date(spec).await?);
    }
    Ok(latest)
}

/// Query and evaluate one rule. Query failures become a failed result for
/// this rule only.
pub async fn evaluate_rule(
    warehouse: &dyn Warehouse,
    rule: &RuleSpec,
    today: NaiveDate,
    policy: &ReconcilePolicy,
) -> Vec<ConsistencyCheckResult> {
    let window = DateWindow::trailing(today, policy.window_days);
    let name = rule.name.as_str();

    let outcome: Result<Vec<ConsistencyCheckResult>, WarehouseError> = async {
        match &rule.check {
            RuleCheck::AggregateEquality {
                master,
                sources,
                tolerance,
            } => {
                let master_total = warehouse.windowed_sum(master, window).await?;
                let mut source_total = 0.0;
                for source in sources {
                    source_total += warehouse.windowed_sum(source, window).await?;
                }
                Ok(compare_aggregates(
                    name,
                    master_total,
                    source_total,
                    *tolerance,
                    policy.double_count_threshold_pct,
                ))
            }
            RuleCheck::DerivedFreshness { derived, upstream } => {
                let derived_max = warehouse.max_date(derived).await?;
                let upstream_max = latest_of(warehouse, upstream).await?;
                Ok(vec![compare_freshness(
                    name,
                    derived_max,
                    upstream_max,
                    policy.derived_lag_days,
                )])
            }
            RuleCheck::DateAlignment { left, right } => {
                let left_dates = warehouse.distinct_dates(left, window).await?;
                let right_dates = warehouse.distinct_dates(right, window).await?;
                Ok(vec![compare_alignment(
                    name,
                    window,
                    (left.table.as_str(), &left_dates),
                    (right.table.as_str(), &right_dates),
                )])
            }
            RuleCheck::Duplicates {
                table,
                date_column,
                key_columns,
            } => {
                let spec = DateSpec {
                    table: table.clone(),
                    date_column: date_column.clone(),
                };
                let groups = warehouse.duplicate_groups(&spec, key_columns, window).await?;
                Ok(vec![duplicates_result(name, table, groups)])
            }
            RuleCheck::DerivedRatio {
                numerator,
                denominator,
            } => {
                let num = warehouse.windowed_sum(numerator, window).await?;
                let den = warehouse.windowed_sum(denominator, window).await?;
                Ok(vec![ratio_result(name, num, den)])
            }
        }
    }
    .await;

    let results = match outcome {
        Ok(results) => results,
        Err(err) => vec![query_failed(name, &err)],
    };

    if results.iter().any(|r| !r.passed) {
        info!(rule = name, "Reconciliation rule failed");
    }
    results
}
