use super::*;
use crate::core::model::Status;

#[tokio::test]
async fn run_appends_exactly_one_history_row() {
    let base = MockApi::default().spawn().await;
    let diagnostics = engine(seeded(), &base);

    let run = diagnostics.run(now()).await;
    assert_eq!(run.overall_status, Status::Healthy);
    assert_eq!(run.health_score, 100.0);
    assert!(run.history_error.is_none());

    let history = diagnostics.history(None).await.unwrap();
    assert_eq!(history.logs.len(), 1);
    let row = &history.logs[0];
    assert_eq!(row.entry.run_id, run.run_id);
    assert_eq!(row.entry.timestamp, now());
    assert_eq!(row.entry.revenue_7d, 1190.0);
    assert_eq!(row.entry.e2e_total, run.e2e.summary.total);
    assert_eq!(row.health_score, run.health_score);
    assert_eq!(history.summary.health_percentage, 100.0);
}

#[tokio::test]
async fn run_feeds_probe_results_into_api_nodes() {
    let api = MockApi {
        fail_ads: true,
        ..MockApi::default()
    };
    let base = api.spawn().await;
    let run = engine(seeded(), &base).run(now()).await;

    let status_of = |id: &str| run.flow.nodes.iter().find(|n| n.id == id).unwrap().status;
    assert_eq!(status_of("sales_api"), Status::Healthy);
    assert_eq!(status_of("ads_api"), Status::Error);
    assert_eq!(status_of("marketing_dashboard"), Status::Error);
    assert_eq!(status_of("sales_dashboard"), Status::Healthy);

    assert_eq!(run.pipeline.overall_status, Status::Healthy);
    assert_eq!(run.overall_status, Status::Error);
}

#[tokio::test]
async fn run_still_records_when_everything_downstream_fails() {
    let conn = seeded();
    conn.execute("DROP TABLE master_daily_sales", []).unwrap();
    let diagnostics = engine(conn, DEAD_API);

    let run = diagnostics.run(now()).await;
    assert_eq!(run.overall_status, Status::Error);
    assert!(run.health_score < 100.0);

    let history = diagnostics.history(Some(10)).await.unwrap();
    assert_eq!(history.logs.len(), 1);
    let entry = &history.logs[0].entry;
    assert_eq!(entry.revenue_7d, 0.0);
    assert_eq!(entry.e2e_passed, 6);
    assert!(entry.issues.contains("Master Daily Sales"));
    assert_eq!(history.summary.health_percentage, 0.0);
}

#[tokio::test]
async fn history_lists_newest_run_first() {
    let diagnostics = engine(seeded(), DEAD_API);
    let first = diagnostics.run(now()).await;
    let later = now() + chrono::Duration::hours(1);
    let second = diagnostics.run(later).await;

    let history = diagnostics.history(None).await.unwrap();
    assert_eq!(history.summary.total_runs, 2);
    assert_eq!(history.logs[0].entry.run_id, second.run_id);
    assert_eq!(history.logs[1].entry.run_id, first.run_id);

    let limited = diagnostics.history(Some(1)).await.unwrap();
    assert_eq!(limited.logs.len(), 1);
}

#[tokio::test]
async fn failed_history_append_keeps_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");
    let store = HistoryStore::open(&path).await.unwrap();
    Connection::open(&path)
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER reject_insert BEFORE INSERT ON pipeline_health_log
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

    let warehouse = Arc::new(SqliteWarehouse::from_connection(seeded()));
    let diagnostics = engine_with_history(warehouse, DEAD_API, store);
    let run = diagnostics.run(now()).await;

    assert!(run.history_error.as_deref().unwrap().contains("disk full"));
    assert_eq!(run.pipeline.sources.len(), 7);
    assert_eq!(run.pipeline.overall_status, Status::Healthy);
    assert!(!run.flow.nodes.is_empty());
    assert!(!run.e2e.checks.is_empty());

    let history = diagnostics.history(None).await.unwrap();
    assert!(history.logs.is_empty());
}
