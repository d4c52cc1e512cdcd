//! Append-only run log and the rolling statistics computed over it.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::model::{
    HistoricalLogEntry, HistoryLogView, HistoryReport, HistorySummary, Status, StatusCounts,
};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("History store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Could not prepare history directory {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Corrupt history row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pipeline_health_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL UNIQUE,
        timestamp TEXT NOT NULL,
        overall_status TEXT NOT NULL,
        sources_healthy INTEGER NOT NULL,
        sources_warning INTEGER NOT NULL,
        sources_error INTEGER NOT NULL,
        nodes_healthy INTEGER NOT NULL,
        nodes_warning INTEGER NOT NULL,
        nodes_error INTEGER NOT NULL,
        edges_healthy INTEGER NOT NULL,
        edges_warning INTEGER NOT NULL,
        edges_error INTEGER NOT NULL,
        e2e_total INTEGER NOT NULL,
        e2e_passed INTEGER NOT NULL,
        revenue_7d REAL NOT NULL,
        issues TEXT NOT NULL
    );
    CREATE TRIGGER IF NOT EXISTS pipeline_health_log_no_update
    BEFORE UPDATE ON pipeline_health_log
    BEGIN
        SELECT RAISE(ABORT, 'pipeline_health_log is append-only');
    END;
    CREATE TRIGGER IF NOT EXISTS pipeline_health_log_no_delete
    BEFORE DELETE ON pipeline_health_log
    BEGIN
        SELECT RAISE(ABORT, 'pipeline_health_log is append-only');
    END;
";

/// SQLite-backed run log. Rows can be inserted and read; the table's triggers
/// reject every update and delete.
#[derive(Clone)]
pub struct HistoryStore {
    db: Arc<Mutex<Connection>>,
}

impl HistoryStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| HistoryError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }
        Self::init(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn append(&self, entry: &HistoricalLogEntry) -> Result<(), HistoryError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO pipeline_health_log (
                run_id, timestamp, overall_status,
                sources_healthy, sources_warning, sources_error,
                nodes_healthy, nodes_warning, nodes_error,
                edges_healthy, edges_warning, edges_error,
                e2e_total, e2e_passed, revenue_7d, issues
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                entry.run_id,
                entry.timestamp.to_rfc3339(),
                entry.overall_status.as_str(),
                entry.sources.healthy,
                entry.sources.warning,
                entry.sources.error,
                entry.nodes.healthy,
                entry.nodes.warning,
                entry.nodes.error,
                entry.edges.healthy,
                entry.edges.warning,
                entry.edges.error,
                entry.e2e_total,
                entry.e2e_passed,
                entry.revenue_7d,
                entry.issues,
            ],
        )?;
        info!(run_id = %entry.run_id, status = %entry.overall_status, "Appended history row");
        Ok(())
    }

    /// Most recent `limit` rows, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<HistoricalLogEntry>, HistoryError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, run_id, timestamp, overall_status,
                    sources_healthy, sources_warning, sources_error,
                    nodes_healthy, nodes_warning, nodes_error,
                    edges_healthy, edges_warning, edges_error,
                    e2e_total, e2e_passed, revenue_7d, issues
             FROM pipeline_health_log
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RawRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                timestamp: row.get(2)?,
                overall_status: row.get(3)?,
                counts: [
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                    row.get(12)?,
                ],
                e2e_total: row.get(13)?,
                e2e_passed: row.get(14)?,
                revenue_7d: row.get(15)?,
                issues: row.get(16)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }
}

struct RawRow {
    id: i64,
    run_id: String,
    timestamp: String,
    overall_status: String,
    counts: [u32; 9],
    e2e_total: u32,
    e2e_passed: u32,
    revenue_7d: f64,
    issues: String,
}

impl RawRow {
    fn into_entry(self) -> Result<HistoricalLogEntry, HistoryError> {
        let id = self.id;
        let overall_status =
            Status::parse(&self.overall_status).ok_or_else(|| HistoryError::Corrupt {
                id,
                reason: format!("unknown status '{}'", self.overall_status),
            })?;
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| HistoryError::Corrupt {
                id,
                reason: format!("bad timestamp: {}", e),
            })?
            .with_timezone(&Utc);
        let c = self.counts;
        let counts = |i: usize| StatusCounts {
            healthy: c[i],
            warning: c[i + 1],
            error: c[i + 2],
        };

        Ok(HistoricalLogEntry {
            run_id: self.run_id,
            timestamp,
            overall_status,
            sources: counts(0),
            nodes: counts(3),
            edges: counts(6),
            e2e_total: self.e2e_total,
            e2e_passed: self.e2e_passed,
            revenue_7d: self.revenue_7d,
            issues: self.issues,
        })
    }
}

fn ratio_pct(part: u32, whole: u32) -> f64 {
    100.0 * f64::from(part) / f64::from(whole.max(1))
}

/// Unweighted mean of the healthy-source, E2E-passed and healthy-node
/// percentages, rounded to one decimal.
pub fn health_score(entry: &HistoricalLogEntry) -> f64 {
    let score = (ratio_pct(entry.sources.healthy, entry.sources.total())
        + ratio_pct(entry.e2e_passed, entry.e2e_total)
        + ratio_pct(entry.nodes.healthy, entry.nodes.total()))
        / 3.0;
    (score * 10.0).round() / 10.0
}

pub fn summarize(entries: &[HistoricalLogEntry]) -> HistorySummary {
    if entries.is_empty() {
        return HistorySummary::default();
    }
    let total = entries.len();
    let healthy = entries
        .iter()
        .filter(|e| e.overall_status == Status::Healthy)
        .count();
    let revenue: f64 = entries.iter().map(|e| e.revenue_7d).sum();

    HistorySummary {
        total_runs: total,
        health_percentage: 100.0 * healthy as f64 / total as f64,
        avg_revenue_7d: revenue / total as f64,
    }
}

pub fn report(entries: Vec<HistoricalLogEntry>) -> HistoryReport {
    let summary = summarize(&entries);
    let logs = entries
        .into_iter()
        .map(|entry| HistoryLogView {
            health_score: health_score(&entry),
            entry,
        })
        .collect();
    HistoryReport { logs, summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(n: u32, status: Status) -> HistoricalLogEntry {
        HistoricalLogEntry {
            run_id: format!("run-{}", n),
            timestamp: Utc.with_ymd_and_hms(2026, 3, n, 6, 0, 0).unwrap(),
            overall_status: status,
            sources: StatusCounts {
                healthy: 5,
                warning: 1,
                error: 0,
            },
            nodes: StatusCounts {
                healthy: 9,
                warning: 1,
                error: 0,
            },
            edges: StatusCounts {
                healthy: 12,
                warning: 2,
                error: 1,
            },
            e2e_total: 12,
            e2e_passed: 9,
            revenue_7d: 1000.0 * f64::from(n),
            issues: "Meta Ads: stale".to_string(),
        }
    }

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let store = HistoryStore::open_in_memory().unwrap();
        for n in 1..=5 {
            store.append(&entry(n, Status::Healthy)).await.unwrap();
        }
        let rows = store.recent(3).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].run_id, "run-5");
        assert_eq!(rows[2].run_id, "run-3");
        assert_eq!(rows[0], entry(5, Status::Healthy));
    }

    #[tokio::test]
    async fn rows_cannot_be_updated_or_deleted() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.append(&entry(1, Status::Warning)).await.unwrap();

        let db = store.db.lock().await;
        let update = db.execute(
            "UPDATE pipeline_health_log SET overall_status = 'healthy'",
            [],
        );
        assert!(update.is_err());
        let delete = db.execute("DELETE FROM pipeline_health_log", []);
        assert!(delete.is_err());
        drop(db);

        let rows = store.recent(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].overall_status, Status::Warning);
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        let store = HistoryStore::open(&path).await.unwrap();
        store.append(&entry(2, Status::Error)).await.unwrap();
        drop(store);

        let reopened = HistoryStore::open(&path).await.unwrap();
        assert_eq!(reopened.recent(30).await.unwrap().len(), 1);
    }

    #[test]
    fn health_percentage_counts_healthy_runs() {
        let entries: Vec<_> = (1..=10)
            .map(|n| {
                let status = if n <= 7 { Status::Healthy } else { Status::Warning };
                entry(n, status)
            })
            .collect();
        let summary = summarize(&entries);
        assert_eq!(summary.total_runs, 10);
        assert_eq!(summary.health_percentage, 70.0);
        assert_eq!(summary.avg_revenue_7d, 5500.0);
    }

    #[test]
    fn empty_history_summary_is_zeroed() {
        assert_eq!(summarize(&[]), HistorySummary::default());
    }

    #[test]
    fn health_score_averages_three_ratios() {
        // sources 5/6, e2e 9/12, nodes 9/10
        let score = health_score(&entry(1, Status::Healthy));
        assert_eq!(score, 82.8);
    }

    #[test]
    fn health_score_guards_empty_denominators() {
        let mut e = entry(1, Status::Healthy);
        e.e2e_total = 0;
        e.e2e_passed = 0;
        let score = health_score(&e);
        assert!(score.is_finite());
    }
}
