//! Storage seam between the pipeline and the SQL database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tori_core::{ColumnBinding, ReportRow, SchemaChange, TableSchema};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Rejected(String),
}

/// Implementations apply each call atomically: a failed call leaves no partial effect.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Current columns of `table` in ordinal order, or `None` when it does not exist.
    async fn table_columns(&self, table: &str) -> Result<Option<TableSchema>, StoreError>;

    async fn apply_changes(&self, changes: &[SchemaChange]) -> Result<(), StoreError>;

    /// Insert every row stamped with `processed_at`; headers absent from a row become NULL.
    async fn insert_rows(
        &self,
        table: &str,
        bindings: &[ColumnBinding],
        rows: &[ReportRow],
        processed_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
