//! Per-node health from row count and freshness.

use chrono::NaiveDate;

use crate::core::model::Status;
use crate::core::warehouse::{TableStats, WarehouseError};

/// Longest failure reason carried into an issue message.
pub const MAX_REASON_LEN: usize = 120;

pub const NO_DATA_ISSUE: &str = "No data found in table";

#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvaluation {
    pub status: Status,
    pub days_since_update: Option<i64>,
    pub freshness_label: String,
    pub issues: Vec<String>,
}

/// Whole days between the latest recorded date and today. Dates in the
/// future count as today.
pub fn days_since(latest: Option<NaiveDate>, today: NaiveDate) -> Option<i64> {
    latest.map(|d| (today - d).num_days().max(0))
}

pub fn freshness_label(days: Option<i64>) -> String {
    match days {
        None => "Unknown".to_string(),
        Some(0) => "Today".to_string(),
        Some(1) => "Yesterday".to_string(),
        Some(n) => format!("{} days ago", n),
    }
}

pub fn truncate_reason(reason: &str) -> String {
    if reason.chars().count() <= MAX_REASON_LEN {
        return reason.to_string();
    }
    let cut: String = reason.chars().take(MAX_REASON_LEN).collect();
    format!("{}...", cut)
}

pub fn query_failure_issue(err: &WarehouseError) -> String {
    format!("Failed to query table: {}", truncate_reason(&err.to_string()))
}

/// Classify one table-backed node.
///
/// `error` when the query failed or the table is empty, `warning` when the
/// newest row is older than the node's own threshold, `healthy` otherwise.
pub fn evaluate(
    stats: &Result<TableStats, WarehouseError>,
    threshold_days: i64,
    today: NaiveDate,
) -> NodeEvaluation {
    let stats = match stats {
        Ok(stats) => stats,
        Err(err) => {
            return NodeEvaluation {
                status: Status::Error,
                days_since_update: None,
                freshness_label: freshness_label(None),
                issues: vec![query_failure_issue(err)],
            };
        }
    };

    let days = days_since(stats.latest, today);
    let label = freshness_label(days);

    if stats.row_count == 0 {
        return NodeEvaluation {
            status: Status::Error,
            days_since_update: days,
            freshness_label: label,
            issues: vec![NO_DATA_ISSUE.to_string()],
        };
    }

    match days {
        Some(d) if d > threshold_days => NodeEvaluation {
            status: Status::Warning,
            days_since_update: days,
            freshness_label: label,
            issues: vec![format!(
                "Data last updated {} days ago (threshold: {} days)",
                d, threshold_days
            )],
        },
        Some(_) => NodeEvaluation {
            status: Status::Healthy,
            days_since_update: days,
            freshness_label: label,
            issues: Vec::new(),
        },
        None => NodeEvaluation {
            status: Status::Warning,
            days_since_update: None,
            freshness_label: label,
            issues: vec!["Rows present but no valid dates recorded".to_string()],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn stats(rows: i64, latest: Option<&str>) -> Result<TableStats, WarehouseError> {
        Ok(TableStats {
            row_count: rows,
            earliest: latest.map(d),
            latest: latest.map(d),
        })
    }

    #[test]
    fn empty_table_is_error() {
        let eval = evaluate(&stats(0, None), 2, d("2026-03-10"));
        assert_eq!(eval.status, Status::Error);
        assert_eq!(eval.issues, vec!["No data found in table".to_string()]);
    }

    #[test]
    fn stale_beyond_threshold_is_warning() {
        let eval = evaluate(&stats(50, Some("2026-03-07")), 2, d("2026-03-10"));
        assert_eq!(eval.status, Status::Warning);
        assert_eq!(eval.days_since_update, Some(3));
        assert!(eval.issues[0].contains("3 days ago"));
        assert!(eval.issues[0].contains("threshold: 2 days"));
    }

    #[test]
    fn within_threshold_is_healthy() {
        let eval = evaluate(&stats(50, Some("2026-03-08")), 2, d("2026-03-10"));
        assert_eq!(eval.status, Status::Healthy);
        assert!(eval.issues.is_empty());
        assert_eq!(eval.freshness_label, "2 days ago");
    }

    #[test]
    fn query_failure_carries_reason() {
        let err = Err(WarehouseError::MissingTable("shopify_orders".to_string()));
        let eval = evaluate(&err, 2, d("2026-03-10"));
        assert_eq!(eval.status, Status::Error);
        assert!(eval.issues[0].contains("shopify_orders"));
        assert_ne!(eval.issues[0], NO_DATA_ISSUE);
    }

    #[test]
    fn long_reasons_are_truncated() {
        let reason = "x".repeat(500);
        let err = Err(WarehouseError::Query(reason));
        let eval = evaluate(&err, 2, d("2026-03-10"));
        assert!(eval.issues[0].len() < 200);
        assert!(eval.issues[0].ends_with("..."));
    }

    #[test]
    fn evaluation_is_reproducible() {
        let s = stats(10, Some("2026-03-01"));
        let today = d("2026-03-10");
        assert_eq!(evaluate(&s, 5, today), evaluate(&s, 5, today));
    }

    #[test]
    fn labels() {
        assert_eq!(freshness_label(Some(0)), "Today");
        assert_eq!(freshness_label(Some(1)), "Yesterday");
        assert_eq!(freshness_label(Some(9)), "9 days ago");
        assert_eq!(freshness_label(None), "Unknown");
        assert_eq!(days_since(Some(d("2026-03-12")), d("2026-03-10")), Some(0));
    }
}
