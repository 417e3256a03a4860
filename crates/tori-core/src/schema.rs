//! Header-driven table schema: identifier sanitization, additive planning, DDL text.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TableSchema;

pub const ID_COLUMN: &str = "id";
pub const PROCESSED_AT_COLUMN: &str = "processed_at";

/// Postgres truncates identifiers longer than this many bytes.
const MAX_IDENTIFIER_BYTES: usize = 63;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("headers {first:?} and {second:?} both map to column {column:?}")]
    Collision {
        first: String,
        second: String,
        column: String,
    },
    #[error("header {header:?} maps to reserved column {column:?}")]
    Reserved { header: String, column: String },
    #[error("header {header:?} has no usable characters for a column name")]
    EmptyIdentifier { header: String },
    #[error("invalid table name {table:?}: expected 1-63 characters of [A-Za-z0-9_]")]
    InvalidTableName { table: String },
    #[error("schema migration on {table} failed")]
    Store {
        table: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Raw CSV header name paired with the column it is stored in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnBinding {
    pub header: String,
    pub column: String,
}

impl ColumnBinding {
    /// Bind every header to its sanitized column, rejecting collisions within the header.
    pub fn bind_all(header: &TableSchema) -> Result<Vec<ColumnBinding>, SchemaError> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        let mut bindings = Vec::with_capacity(header.len());

        for raw in header.columns() {
            let column = sanitize_identifier(raw);
            if column.is_empty() {
                return Err(SchemaError::EmptyIdentifier {
                    header: raw.clone(),
                });
            }
            if column == ID_COLUMN || column == PROCESSED_AT_COLUMN {
                return Err(SchemaError::Reserved {
                    header: raw.clone(),
                    column,
                });
            }
            if let Some(first) = seen.insert(column.clone(), raw.as_str()) {
                return Err(SchemaError::Collision {
                    first: first.to_string(),
                    second: raw.clone(),
                    column,
                });
            }
            bindings.push(ColumnBinding {
                header: raw.clone(),
                column,
            });
        }

        Ok(bindings)
    }
}

/// Deterministic and idempotent: `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(MAX_IDENTIFIER_BYTES);
    out
}

pub fn validate_table_name(table: &str) -> Result<(), SchemaError> {
    let valid = !table.is_empty()
        && table.len() <= MAX_IDENTIFIER_BYTES
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidTableName {
            table: table.to_string(),
        })
    }
}

pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateTable { table: String, columns: Vec<String> },
    AddColumn { table: String, column: String },
}

impl SchemaChange {
    /// Postgres DDL for this change. Re-running it against an already-migrated table is a no-op.
    pub fn to_sql(&self) -> String {
        match self {
            SchemaChange::CreateTable { table, columns } => {
                let mut defs = vec![
                    format!("{} BIGSERIAL PRIMARY KEY", quote_identifier(ID_COLUMN)),
                    format!(
                        "{} TIMESTAMPTZ NOT NULL DEFAULT now()",
                        quote_identifier(PROCESSED_AT_COLUMN)
                    ),
                ];
                defs.extend(
                    columns
                        .iter()
                        .map(|c| format!("{} TEXT", quote_identifier(c))),
                );
                format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    quote_identifier(table),
                    defs.join(", ")
                )
            }
            SchemaChange::AddColumn { table, column } => format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} TEXT",
                quote_identifier(table),
                quote_identifier(column)
            ),
        }
    }

    /// Column list a table has after this change, starting from `current`.
    pub fn apply_to(&self, current: Option<TableSchema>) -> TableSchema {
        match self {
            SchemaChange::CreateTable { columns, .. } => current.unwrap_or_else(|| {
                let mut schema = TableSchema::new([ID_COLUMN, PROCESSED_AT_COLUMN]);
                for c in columns {
                    schema.push(c.clone());
                }
                schema
            }),
            SchemaChange::AddColumn { column, .. } => {
                let mut schema = current.unwrap_or_default();
                if !schema.contains(column) {
                    schema.push(column.clone());
                }
                schema
            }
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

/// Additive-only plan: create the table when it is missing, otherwise add each absent column.
pub fn reconcile_plan(
    table: &str,
    current: Option<&TableSchema>,
    incoming: &[ColumnBinding],
) -> Vec<SchemaChange> {
    match current {
        None => vec![SchemaChange::CreateTable {
            table: table.to_string(),
            columns: incoming.iter().map(|b| b.column.clone()).collect(),
        }],
        Some(existing) => incoming
            .iter()
            .filter(|b| !existing.contains(&b.column))
            .map(|b| SchemaChange::AddColumn {
                table: table.to_string(),
                column: b.column.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(header: &[&str]) -> Vec<ColumnBinding> {
        ColumnBinding::bind_all(&TableSchema::new(header.iter().copied())).unwrap()
    }

    #[test]
    fn sanitization_is_idempotent() {
        for raw in ["Vessel Name", "ETA (UTC)", "count", "déjà-vu", "  padded "] {
            let once = sanitize_identifier(raw);
            assert_eq!(sanitize_identifier(&once), once, "{raw}");
        }
        assert_eq!(sanitize_identifier("Vessel Name"), "vessel_name");
        assert_eq!(sanitize_identifier("ETA (UTC)"), "eta__utc_");
    }

    #[test]
    fn long_headers_are_truncated_to_identifier_limit() {
        let raw = "x".repeat(100);
        assert_eq!(sanitize_identifier(&raw).len(), 63);
    }

    #[test]
    fn colliding_headers_are_rejected() {
        let header = TableSchema::new(["Port Code", "port-code"]);
        let err = ColumnBinding::bind_all(&header).unwrap_err();
        match err {
            SchemaError::Collision {
                first,
                second,
                column,
            } => {
                assert_eq!(first, "Port Code");
                assert_eq!(second, "port-code");
                assert_eq!(column, "port_code");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reserved_and_empty_headers_are_rejected() {
        let reserved = ColumnBinding::bind_all(&TableSchema::new(["ID", "value"]));
        assert!(matches!(reserved, Err(SchemaError::Reserved { .. })));

        let processed = ColumnBinding::bind_all(&TableSchema::new(["Processed At"]));
        assert!(matches!(processed, Err(SchemaError::Reserved { .. })));

        let empty = ColumnBinding::bind_all(&TableSchema::new(["", "value"]));
        assert!(matches!(empty, Err(SchemaError::EmptyIdentifier { .. })));
    }

    #[test]
    fn table_names_are_validated() {
        assert!(validate_table_name("ToriReports").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("reports; DROP TABLE x").is_err());
        assert!(validate_table_name(&"t".repeat(64)).is_err());
    }

    #[test]
    fn missing_table_plans_a_single_create() {
        let plan = reconcile_plan("ToriReports", None, &bindings(&["date", "count"]));
        assert_eq!(
            plan,
            vec![SchemaChange::CreateTable {
                table: "ToriReports".into(),
                columns: vec!["date".into(), "count".into()],
            }]
        );
        assert_eq!(
            plan[0].to_sql(),
            "CREATE TABLE IF NOT EXISTS \"ToriReports\" (\"id\" BIGSERIAL PRIMARY KEY, \
             \"processed_at\" TIMESTAMPTZ NOT NULL DEFAULT now(), \"date\" TEXT, \"count\" TEXT)"
        );
    }

    #[test]
    fn existing_table_only_gains_missing_columns() {
        let current = TableSchema::new(["id", "processed_at", "a", "b"]);
        let plan = reconcile_plan("t", Some(&current), &bindings(&["a", "b", "c"]));
        assert_eq!(
            plan,
            vec![SchemaChange::AddColumn {
                table: "t".into(),
                column: "c".into(),
            }]
        );
        assert_eq!(
            plan[0].to_sql(),
            "ALTER TABLE \"t\" ADD COLUMN IF NOT EXISTS \"c\" TEXT"
        );

        let next = plan[0].apply_to(Some(current));
        assert_eq!(next.columns(), ["id", "processed_at", "a", "b", "c"]);
    }

    #[test]
    fn up_to_date_table_plans_nothing() {
        let current = TableSchema::new(["id", "processed_at", "a", "b", "extra"]);
        assert!(reconcile_plan("t", Some(&current), &bindings(&["b", "a"])).is_empty());
    }

    #[test]
    fn create_change_yields_system_columns_first() {
        let change = SchemaChange::CreateTable {
            table: "t".into(),
            columns: vec!["date".into(), "count".into()],
        };
        assert_eq!(
            change.apply_to(None).columns(),
            ["id", "processed_at", "date", "count"]
        );
    }
}
