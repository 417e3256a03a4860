//! Postgres-backed [`ReportStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tori_core::schema::quote_identifier;
use tori_core::{ColumnBinding, ReportRow, SchemaChange, TableSchema, PROCESSED_AT_COLUMN};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::store::{ReportStore, StoreError};

/// Postgres caps a single statement at this many bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// No connection is opened until the first query.
    pub fn connect_lazy(config: &DatabaseConfig) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password)
            .ssl_mode(config.ssl_mode)
            .application_name("tori-ingest");
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(config.timeout)
            .connect_lazy_with(options);
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn table_columns(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if columns.is_empty() {
            return Ok(None);
        }
        Ok(Some(TableSchema::new(columns)))
    }

    async fn apply_changes(&self, changes: &[SchemaChange]) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for change in changes {
            let sql = change.to_sql();
            debug!(%sql, "applying schema change");
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!(changes = changes.len(), "schema changes committed");
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &str,
        bindings: &[ColumnBinding],
        rows: &[ReportRow],
        processed_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let column_list = std::iter::once(PROCESSED_AT_COLUMN)
            .chain(bindings.iter().map(|b| b.column.as_str()))
            .map(quote_identifier)
            .collect::<Vec<_>>()
            .join(", ");
        let rows_per_statement = (MAX_BIND_PARAMS / (bindings.len() + 1)).max(1);

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(rows_per_statement) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({column_list}) ",
                quote_identifier(table)
            ));
            builder.push_values(chunk, |mut values, row| {
                values.push_bind(processed_at);
                for binding in bindings {
                    values.push_bind(row.get(&binding.header).map(str::to_owned));
                }
            });
            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
            debug!(statement_rows = chunk.len(), "inserted chunk");
        }
        tx.commit().await?;
        Ok(inserted)
    }
}
