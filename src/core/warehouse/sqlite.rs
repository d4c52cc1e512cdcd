use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags, params};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{DateWindow, TableStats, Warehouse, WarehouseError};
use crate::core::topology::{DateSpec, SumSpec, TableBinding};

const DATE_FMT: &str = "%Y-%m-%d";

/// Warehouse backed by a SQLite database opened read-only.
///
/// Dates are compared through SQLite's `date()` so text dates and full
/// timestamps in the date column are both accepted.
#[derive(Clone)]
pub struct SqliteWarehouse {
    db: Arc<Mutex<Connection>>,
}

impl SqliteWarehouse {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WarehouseError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| WarehouseError::Unreachable(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` against the connection on the blocking pool. If the returned
    /// future is dropped before the query finishes, the statement is
    /// interrupted so the connection frees up promptly.
    async fn query<T, F>(&self, table: &str, f: F) -> Result<T, WarehouseError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.db.clone().lock_owned().await;
        let mut interrupt = InterruptOnDrop(Some(conn.get_interrupt_handle()));

        let joined = tokio::task::spawn_blocking(move || {
            let result = f(&*conn);
            // keep the lock until the caller has seen the result
            (conn, result)
        })
        .await;
        interrupt.disarm();

        match joined {
            Ok((_conn, result)) => result.map_err(|e| classify(table, e)),
            Err(e) => Err(WarehouseError::Query(format!("query task failed: {}", e))),
        }
    }
}

struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.interrupt();
        }
    }
}

/// Quote an identifier for interpolation. Identifiers cannot be bound as
/// parameters, so anything that could escape the quotes is rejected.
fn quote_ident(name: &str) -> Result<String, WarehouseError> {
    if name.is_empty() || name.contains('"') || name.contains('\0') {
        return Err(WarehouseError::Query(format!(
            "invalid identifier '{}'",
            name
        )));
    }
    Ok(format!("\"{}\"", name))
}

fn classify(table: &str, err: rusqlite::Error) -> WarehouseError {
    let text = err.to_string();
    if text.contains("no such table") {
        return WarehouseError::MissingTable(table.to_string());
    }
    match err.sqlite_error_code() {
        Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) => {
            WarehouseError::Unreachable(text)
        }
        Some(ErrorCode::OperationInterrupted) => WarehouseError::Query("query interrupted".to_string()),
        Some(ErrorCode::PermissionDenied)
        | Some(ErrorCode::AuthorizationForStatementDenied)
        | Some(ErrorCode::ReadOnly) => WarehouseError::PermissionDenied(text),
        _ => WarehouseError::Query(text),
    }
}

fn parse_date(raw: Option<String>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(&s, DATE_FMT).ok())
}

fn window_params(window: DateWindow) -> (String, String) {
    (
        window.start.format(DATE_FMT).to_string(),
        window.end.format(DATE_FMT).to_string(),
    )
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn table_stats(&self, binding: &TableBinding) -> Result<TableStats, WarehouseError> {
        let sql = format!(
            "SELECT COUNT(*), MIN(date({col})), MAX(date({col})) FROM {table}",
            col = quote_ident(&binding.date_column)?,
            table = quote_ident(&binding.table)?,
        );
        let (row_count, earliest, latest) = self
            .query(&binding.table, move |db| {
                db.query_row(&sql, [], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })
            })
            .await?;

        Ok(TableStats {
            row_count,
            earliest: parse_date(earliest),
            latest: parse_date(latest),
        })
    }

    async fn distinct_dates(
        &self,
        spec: &DateSpec,
        window: DateWindow,
    ) -> Result<BTreeSet<NaiveDate>, WarehouseError> {
        let sql = format!(
            "SELECT DISTINCT date({col}) FROM {table} WHERE date({col}) BETWEEN ?1 AND ?2",
            col = quote_ident(&spec.date_column)?,
            table = quote_ident(&spec.table)?,
        );
        let (start, end) = window_params(window);
        let raw = self
            .query(&spec.table, move |db| {
                let mut stmt = db.prepare(&sql)?;
                let rows = stmt.query_map(params![start, end], |row| {
                    row.get::<_, Option<String>>(0)
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        Ok(raw.into_iter().filter_map(parse_date).collect())
    }

    async fn windowed_sum(
        &self,
        spec: &SumSpec,
        window: DateWindow,
    ) -> Result<f64, WarehouseError> {
        let sql = format!(
            "SELECT TOTAL({col}) FROM {table} WHERE date({date}) BETWEEN ?1 AND ?2",
            col = quote_ident(&spec.column)?,
            date = quote_ident(&spec.date_column)?,
            table = quote_ident(&spec.table)?,
        );
        let (start, end) = window_params(window);
        self.query(&spec.table, move |db| {
            db.query_row(&sql, params![start, end], |row| row.get::<_, f64>(0))
        })
        .await
    }

    async fn max_date(&self, spec: &DateSpec) -> Result<Option<NaiveDate>, WarehouseError> {
        let sql = format!(
            "SELECT MAX(date({col})) FROM {table}",
            col = quote_ident(&spec.date_column)?,
            table = quote_ident(&spec.table)?,
        );
        let raw = self
            .query(&spec.table, move |db| {
                db.query_row(&sql, [], |row| row.get::<_, Option<String>>(0))
            })
            .await?;
        Ok(parse_date(raw))
    }

    async fn duplicate_groups(
        &self,
        spec: &DateSpec,
        key_columns: &[String],
        window: DateWindow,
    ) -> Result<u64, WarehouseError> {
        let date_col = quote_ident(&spec.date_column)?;
        let mut group_by = vec![format!("date({})", date_col)];
        for key in key_columns {
            group_by.push(quote_ident(key)?);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM (
                SELECT 1 FROM {table}
                WHERE date({date_col}) BETWEEN ?1 AND ?2
                GROUP BY {keys}
                HAVING COUNT(*) > 1
            )",
            table = quote_ident(&spec.table)?,
            keys = group_by.join(", "),
        );
        let (start, end) = window_params(window);
        let count = self
            .query(&spec.table, move |db| {
                db.query_row(&sql, params![start, end], |row| row.get::<_, i64>(0))
            })
            .await?;
        Ok(count.max(0) as u64)
    }
}
