
use e2e_harness::{MockReportingApi, ServeHarness, TestResult, is_bind_denied};
use reqwest::Method;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn served_reports_cover_a_healthy_pipeline() -> TestResult<()> {
    let api = match MockReportingApi::start(false).await {
        Ok(api) => api,
        Err(err) if is_bind_denied(err.as_ref()) => {
            eprintln!("Skipping serve test: socket bind not permitted");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let serve = ServeHarness::spawn(&api.base_url(), &[]).await?;

    let (status, check) = serve.request_json(Method::GET, "/api/pipeline/check").await?;
    assert_eq!(status, 200);
    assert_eq!(check["overallStatus"], "healthy", "{check}");
    assert_eq!(check["sources"]["shopify_orders"]["rowCount"], 30);

    let (_, flow) = serve.request_json(Method::GET, "/api/pipeline/flow").await?;
    assert!(
        flow["edges"]
            .as_array()
            .unwrap()
            .iter()
            .all(|e| e["status"] == "active")
    );

    let (_, e2e) = serve.request_json(Method::GET, "/api/pipeline/e2e").await?;
    assert_eq!(e2e["overallStatus"], "healthy", "{e2e}");
    assert_eq!(e2e["summary"]["error"], 0);

    let (status, run) = serve.request_json(Method::POST, "/api/pipeline/run").await?;
    assert_eq!(status, 200);
    assert_eq!(run["healthScore"], 100.0);

    let (_, history) = serve
        .request_json(Method::GET, "/api/pipeline/history?limit=10")
        .await?;
    assert_eq!(history["logs"].as_array().unwrap().len(), 1);
    assert_eq!(history["logs"][0]["revenue7d"], 1190.0);
    assert!(serve.data_dir().join("state").join("history.db").exists());

    drop(serve);
    api.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn served_reports_surface_empty_tables_and_failing_endpoints() -> TestResult<()> {
    let api = match MockReportingApi::start(true).await {
        Ok(api) => api,
        Err(err) if is_bind_denied(err.as_ref()) => {
            eprintln!("Skipping serve test: socket bind not permitted");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let serve = ServeHarness::spawn(&api.base_url(), &["amazon_sales"]).await?;

    let (_, check) = serve.request_json(Method::GET, "/api/pipeline/check").await?;
    assert_eq!(check["overallStatus"], "error");
    assert_eq!(check["sources"]["amazon_sales"]["status"], "error");
    assert_eq!(check["sources"]["amazon_sales"]["rowCount"], 0);

    let (_, e2e) = serve.request_json(Method::GET, "/api/pipeline/e2e").await?;
    let ads = e2e["checks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "Ads performance")
        .cloned()
        .unwrap();
    assert_eq!(ads["status"], "error");
    assert_eq!(ads["message"], "HTTP 500");
    assert!(ads.get("recordCount").is_none_or(|v| v.is_null()));

    let (status, run) = serve.request_json(Method::POST, "/api/pipeline/run").await?;
    assert_eq!(status, 200);
    assert_eq!(run["overallStatus"], "error");

    let (_, history) = serve.request_json(Method::GET, "/api/pipeline/history").await?;
    assert_eq!(history["summary"]["totalRuns"], 1);
    assert_eq!(history["logs"][0]["overallStatus"], "error");

    drop(serve);
    api.shutdown().await;
    Ok(())
}
