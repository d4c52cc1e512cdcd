//! Read interface to the analytical store.
//!
//! Diagnostics only ever need a handful of aggregate primitives, so any store
//! able to answer them can stand behind [`Warehouse`].

mod sqlite;

pub use sqlite::SqliteWarehouse;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use crate::core::topology::{DateSpec, SumSpec, TableBinding};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WarehouseError {
    #[error("Warehouse unreachable: {0}")]
    Unreachable(String),

    #[error("Table not found: {0}")]
    MissingTable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Query timed out after {0}ms")]
    Timeout(u64),
}

/// Inclusive calendar-date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// The `days` calendar dates ending at `end`, both ends included.
    pub fn trailing(end: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            start: end - Duration::days(span),
            end,
        }
    }

    pub fn len(&self) -> usize {
        ((self.end - self.start).num_days() + 1).max(0) as usize
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }
}

/// Row count and date extent of one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub row_count: i64,
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// `COUNT(*)`, `MIN(date)`, `MAX(date)` over the whole table.
    async fn table_stats(&self, binding: &TableBinding) -> Result<TableStats, WarehouseError>;

    /// Distinct dates present in the window.
    async fn distinct_dates(
        &self,
        spec: &DateSpec,
        window: DateWindow,
    ) -> Result<BTreeSet<NaiveDate>, WarehouseError>;

    /// `SUM(column)` over rows dated inside the window; zero when none match.
    async fn windowed_sum(&self, spec: &SumSpec, window: DateWindow)
    -> Result<f64, WarehouseError>;

    /// `MAX(date)` over the whole table.
    async fn max_date(&self, spec: &DateSpec) -> Result<Option<NaiveDate>, WarehouseError>;

    /// Number of `(date, keys...)` groups inside the window with more than one row.
    async fn duplicate_groups(
        &self,
        spec: &DateSpec,
        key_columns: &[String],
        window: DateWindow,
    ) -> Result<u64, WarehouseError>;
}

/// Wraps another warehouse and bounds every call by `limit`. An expired call
/// is dropped; adapters cancel the underlying query when that happens.
#[derive(Clone)]
pub struct TimedWarehouse {
    inner: Arc<dyn Warehouse>,
    limit: std::time::Duration,
}

impl TimedWarehouse {
    pub fn new(inner: Arc<dyn Warehouse>, limit: std::time::Duration) -> Self {
        Self { inner, limit }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, WarehouseError>> + Send,
    ) -> Result<T, WarehouseError> {
        match tokio::time::timeout(self.limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(WarehouseError::Timeout(self.limit.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl Warehouse for TimedWarehouse {
    async fn table_stats(&self, binding: &TableBinding) -> Result<TableStats, WarehouseError> {
        self.bounded(self.inner.table_stats(binding)).await
    }

    async fn distinct_dates(
        &self,
        spec: &DateSpec,
        window: DateWindow,
    ) -> Result<BTreeSet<NaiveDate>, WarehouseError> {
        self.bounded(self.inner.distinct_dates(spec, window)).await
    }

    async fn windowed_sum(&self, spec: &SumSpec, window: DateWindow)
    -> Result<f64, WarehouseError> {
        self.bounded(self.inner.windowed_sum(spec, window)).await
    }

    async fn max_date(&self, spec: &DateSpec) -> Result<Option<NaiveDate>, WarehouseError> {
        self.bounded(self.inner.max_date(spec)).await
    }

    async fn duplicate_groups(
        &self,
        spec: &DateSpec,
        key_columns: &[String],
        window: DateWindow,
    ) -> Result<u64, WarehouseError> {
        self.bounded(self.inner.duplicate_groups(spec, key_columns, window))
            .await
    }
}
