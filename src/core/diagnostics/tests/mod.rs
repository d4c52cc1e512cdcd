mod run;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rusqlite::{Connection, params};
use serde_json::{Value, json};
use std::sync::Arc;

use super::e2e::ProbeClient;
use super::history::HistoryStore;
use super::{Diagnostics, EngineSettings};
use crate::core::topology::Topology;
use crate::core::warehouse::{SqliteWarehouse, Warehouse};

/// Nothing listens here; probes fail fast with a transport error.
pub const DEAD_API: &str = "http://127.0.0.1:9";

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
}

pub fn today() -> NaiveDate {
    now().date_naive()
}

pub fn day(offset: i64) -> String {
    (today() - Duration::days(offset))
        .format("%Y-%m-%d")
        .to_string()
}

const SCHEMA: &str = "
    CREATE TABLE shopify_orders (
        order_date TEXT, total_price REAL,
        product_id TEXT DEFAULT 'p1', variant_id TEXT DEFAULT 'v1'
    );
    CREATE TABLE amazon_sales (sale_date TEXT, revenue REAL);
    CREATE TABLE wholesale_sheet (order_date TEXT, amount REAL);
    CREATE TABLE raw_wholesale_orders (order_date TEXT, amount REAL);
    CREATE TABLE google_ads_daily (date TEXT, cost REAL);
    CREATE TABLE meta_ads_daily (date TEXT, spend REAL);
    CREATE TABLE ga4_sessions (date TEXT, sessions REAL);
    CREATE TABLE master_daily_sales (date TEXT, revenue REAL);
    CREATE TABLE master_daily_ads (date TEXT, spend REAL);
    CREATE TABLE master_daily_traffic (date TEXT, sessions REAL);
";

/// One row per day for the last 30 days, with every master table equal to
/// the sum of its sources.
const DAILY: &[(&str, &str, &str, f64)] = &[
    ("shopify_orders", "order_date", "total_price", 100.0),
    ("amazon_sales", "sale_date", "revenue", 50.0),
    ("wholesale_sheet", "order_date", "amount", 20.0),
    ("raw_wholesale_orders", "order_date", "amount", 20.0),
    ("google_ads_daily", "date", "cost", 30.0),
    ("meta_ads_daily", "date", "spend", 20.0),
    ("ga4_sessions", "date", "sessions", 400.0),
    ("master_daily_sales", "date", "revenue", 170.0),
    ("master_daily_ads", "date", "spend", 50.0),
    ("master_daily_traffic", "date", "sessions", 400.0),
];

pub fn fill(
    conn: &Connection,
    table: &str,
    date_col: &str,
    value_col: &str,
    value: f64,
    offsets: std::ops::RangeInclusive<i64>,
) {
    let sql = format!("INSERT INTO {table} ({date_col}, {value_col}) VALUES (?1, ?2)");
    for offset in offsets {
        conn.execute(&sql, params![day(offset), value]).unwrap();
    }
}

pub fn seeded() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(SCHEMA).unwrap();
    for (table, date_col, value_col, value) in DAILY {
        fill(&conn, table, date_col, value_col, *value, 0..=29);
    }
    conn
}

pub fn engine_with(warehouse: Arc<dyn Warehouse>, base_url: &str) -> Diagnostics {
    engine_with_history(warehouse, base_url, HistoryStore::open_in_memory().unwrap())
}

pub fn engine_with_history(
    warehouse: Arc<dyn Warehouse>,
    base_url: &str,
    history: HistoryStore,
) -> Diagnostics {
    Diagnostics::new(
        Arc::new(Topology::builtin().unwrap()),
        warehouse,
        ProbeClient::new(base_url, std::time::Duration::from_secs(2)).unwrap(),
        history,
        EngineSettings::default(),
    )
}

pub fn engine(conn: Connection, base_url: &str) -> Diagnostics {
    engine_with(Arc::new(SqliteWarehouse::from_connection(conn)), base_url)
}

fn dated(n: usize, fields: impl Fn(usize) -> Value) -> Vec<Value> {
    (0..n as i64)
        .map(|i| {
            let mut record = fields(i as usize);
            record["date"] = json!(day(i));
            record
        })
        .collect()
}

/// Downstream API stand-in. Record counts per endpoint are adjustable and
/// any endpoint can be made to fail with a 500.
#[derive(Clone)]
pub struct MockApi {
    pub sales_rows: usize,
    pub ads_rows: usize,
    pub fail_ads: bool,
}

impl Default for MockApi {
    fn default() -> Self {
        Self {
            sales_rows: 7,
            ads_rows: 14,
            fail_ads: false,
        }
    }
}

impl MockApi {
    pub fn router(&self) -> Router {
        let sales_rows = self.sales_rows;
        let ads_rows = self.ads_rows;
        let fail_ads = self.fail_ads;

        Router::new()
            .route(
                "/api/sales/summary",
                get(move || async move {
                    Json(json!({ "data": dated(sales_rows, |_| json!({ "revenue": 170.0 })) }))
                }),
            )
            .route(
                "/api/ads/performance",
                get(move || async move {
                    if fail_ads {
                        return Err(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    let rows = dated(ads_rows, |i| {
                        let platform = if i % 2 == 0 { "google" } else { "meta" };
                        json!({ "platform": platform, "spend": 25.0 })
                    });
                    Ok(Json(json!({ "data": { "rows": rows } })))
                }),
            )
            .route(
                "/api/traffic/overview",
                get(|| async { Json(json!({ "data": dated(7, |_| json!({ "sessions": 400 })) })) }),
            )
            .route(
                "/api/marketing/roas",
                get(|| async { Json(json!({ "data": dated(7, |_| json!({ "roas": 3.4 })) })) }),
            )
    }

    pub async fn spawn(&self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }
}
