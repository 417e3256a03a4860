//! In-process [`ReportStore`] used by tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tori_core::{ColumnBinding, ReportRow, SchemaChange, TableSchema};

use crate::store::{ReportStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: i64,
    pub processed_at: DateTime<Utc>,
    pub values: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTable {
    pub schema: TableSchema,
    pub rows: Vec<StoredRow>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    next_id: i64,
    ddl_log: Vec<String>,
    reject_inserts: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pre-existing table, as if created by an earlier run.
    pub async fn with_table(self, table: &str, schema: TableSchema) -> Self {
        self.state.lock().await.tables.insert(
            table.to_string(),
            MemoryTable {
                schema,
                rows: Vec::new(),
            },
        );
        self
    }

    pub async fn table(&self, table: &str) -> Option<MemoryTable> {
        self.state.lock().await.tables.get(table).cloned()
    }

    /// Every DDL statement applied so far, in order.
    pub async fn ddl_log(&self) -> Vec<String> {
        self.state.lock().await.ddl_log.clone()
    }

    pub async fn reject_inserts(&self, reject: bool) {
        self.state.lock().await.reject_inserts = reject;
    }
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn table_columns(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.schema.clone()))
    }

    async fn apply_changes(&self, changes: &[SchemaChange]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut staged = state.tables.clone();
        for change in changes {
            let table = match change {
                SchemaChange::CreateTable { table, .. } | SchemaChange::AddColumn { table, .. } => {
                    table
                }
            };
            let existing = staged.remove(table);
            if matches!(change, SchemaChange::AddColumn { .. }) && existing.is_none() {
                return Err(StoreError::Rejected(format!("relation {table:?} does not exist")));
            }
            let rows = existing.as_ref().map(|t| t.rows.clone()).unwrap_or_default();
            let schema = change.apply_to(existing.map(|t| t.schema));
            staged.insert(table.clone(), MemoryTable { schema, rows });
        }
        state.tables = staged;
        state
            .ddl_log
            .extend(changes.iter().map(SchemaChange::to_sql));
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &str,
        bindings: &[ColumnBinding],
        rows: &[ReportRow],
        processed_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        if state.reject_inserts {
            return Err(StoreError::Rejected("insert rejected by store".to_string()));
        }
        let first_id = state.next_id;
        let Some(target) = state.tables.get_mut(table) else {
            return Err(StoreError::Rejected(format!("relation {table:?} does not exist")));
        };
        if let Some(missing) = bindings
            .iter()
            .find(|b| !target.schema.contains(&b.column))
        {
            return Err(StoreError::Rejected(format!(
                "column {:?} of relation {table:?} does not exist",
                missing.column
            )));
        }

        let mut next_id = first_id;
        for row in rows {
            next_id += 1;
            let values = bindings
                .iter()
                .map(|b| (b.column.clone(), row.get(&b.header).map(str::to_owned)))
                .collect();
            target.rows.push(StoredRow {
                id: next_id,
                processed_at,
                values,
            });
        }
        state.next_id = next_id;
        Ok(rows.len() as u64)
    }
}
