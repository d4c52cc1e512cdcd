//! Missing-date detection over a trailing calendar window.

use chrono::NaiveDate;
use std::collections::BTreeSet;

use crate::core::model::{DateGapReport, Status};
use crate::core::warehouse::DateWindow;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapPolicy {
    pub window_days: u32,
    pub recent_days: u32,
    /// Share of the window that may be missing before the gap is critical.
    pub critical_ratio: f64,
    /// Most recent missing dates listed verbatim in an issue.
    pub max_listed: usize,
}

impl Default for GapPolicy {
    fn default() -> Self {
        Self {
            window_days: 30,
            recent_days: 7,
            critical_ratio: 0.30,
            max_listed: 5,
        }
    }
}

/// Diff the full calendar of `window` against the dates actually present.
pub fn detect(window: DateWindow, present: &BTreeSet<NaiveDate>, recent_days: u32) -> DateGapReport {
    let recent = DateWindow::trailing(window.end, recent_days);

    let all_missing: Vec<NaiveDate> = window.dates().filter(|d| !present.contains(d)).collect();
    let recent_missing: Vec<NaiveDate> = all_missing
        .iter()
        .copied()
        .filter(|d| recent.contains(*d))
        .collect();

    DateGapReport {
        total_missing: all_missing.len(),
        recent_missing: recent_missing.len(),
        all_missing_dates: all_missing,
        recent_missing_dates: recent_missing,
    }
}

fn list_dates(dates: &[NaiveDate], max: usize) -> String {
    let shown: Vec<String> = dates
        .iter()
        .take(max)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect();
    let rest = dates.len().saturating_sub(max);
    if rest > 0 {
        format!("{} (+{} more)", shown.join(", "), rest)
    } else {
        shown.join(", ")
    }
}

/// Fold a gap report into a node's status and issues.
///
/// Gaps raise a node to `warning` at most; they never produce `error` alone.
pub fn apply(
    report: &DateGapReport,
    window_len: usize,
    policy: &GapPolicy,
    status: Status,
    issues: &mut Vec<String>,
) -> Status {
    let mut status = status;

    if report.recent_missing > 0 {
        status = status.join(Status::Warning);
        issues.push(format!(
            "Missing data for {} of the last {} days: {}",
            report.recent_missing,
            policy.recent_days,
            list_dates(&report.recent_missing_dates, policy.max_listed)
        ));
    } else if report.total_missing > 0 {
        issues.push(format!(
            "{} older missing date(s) in the last {} days",
            report.total_missing, window_len
        ));
    }

    if window_len > 0 {
        let ratio = report.total_missing as f64 / window_len as f64;
        if ratio > policy.critical_ratio {
            status = status.join(Status::Warning);
            issues.push(format!(
                "Critical: {:.0}% of the last {} days have no data",
                ratio * 100.0,
                window_len
            ));
        }
    }

    status
}
