//! Ingest run orchestration: token, window, fetch, parse, reconcile, load.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tori_core::{
    reconcile_plan, ColumnBinding, InvalidWindowError, ReportRow, RunMode, SchemaChange,
    SchemaError, TableSchema, TimeWindow,
};
use tori_csv::{CsvNormalizer, ParseError};
use tori_http::{build_client, AuthError, FetchError, ReportFetcher, TokenProvider};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod memory;
pub mod postgres;
pub mod store;

pub use config::{ConfigError, DatabaseConfig, IngestConfig, DEFAULT_TABLE_NAME};
pub use memory::MemoryStore;
pub use postgres::PgReportStore;
pub use store::{ReportStore, StoreError};

#[derive(Debug, Error)]
#[error("loading {attempted} rows into {table} failed ({committed} committed)")]
pub struct LoadError {
    pub table: String,
    pub attempted: usize,
    /// Always 0 for the bundled stores, which load the whole batch in one transaction.
    pub committed: u64,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error")]
    Config(#[from] ConfigError),
    #[error("http client setup failed")]
    Client(#[source] reqwest::Error),
    #[error("access token acquisition failed")]
    Auth(#[from] AuthError),
    #[error("invalid report window")]
    Window(#[from] InvalidWindowError),
    #[error("report fetch failed")]
    Fetch(#[from] FetchError),
    #[error("report csv is malformed")]
    Parse(#[from] ParseError),
    #[error("schema reconciliation failed")]
    Schema(#[from] SchemaError),
    #[error("batch load failed")]
    Load(#[from] LoadError),
}

impl IngestError {
    pub fn exit_code(&self) -> u8 {
        match self {
            IngestError::Config(_) | IngestError::Client(_) => 2,
            IngestError::Auth(_) => 3,
            IngestError::Window(_) => 4,
            IngestError::Fetch(_) => 5,
            IngestError::Parse(_) => 6,
            IngestError::Schema(_) => 7,
            IngestError::Load(_) => 8,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Config(_) | IngestError::Client(_) => "config",
            IngestError::Auth(_) => "auth",
            IngestError::Window(_) => "window",
            IngestError::Fetch(_) => "fetch",
            IngestError::Parse(_) => "parse",
            IngestError::Schema(_) => "schema",
            IngestError::Load(_) => "load",
        }
    }
}

/// Outcome of reconciling a table against one CSV header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub bindings: Vec<ColumnBinding>,
    pub changes: Vec<SchemaChange>,
    pub effective: TableSchema,
}

impl Reconciliation {
    pub fn table_created(&self) -> bool {
        self.changes
            .iter()
            .any(|c| matches!(c, SchemaChange::CreateTable { .. }))
    }

    pub fn columns_added(&self) -> Vec<String> {
        match self.changes.as_slice() {
            [SchemaChange::CreateTable { .. }] => Vec::new(),
            changes => changes
                .iter()
                .filter_map(|c| match c {
                    SchemaChange::AddColumn { column, .. } => Some(column.clone()),
                    SchemaChange::CreateTable { .. } => None,
                })
                .collect(),
        }
    }
}

/// Creates the table or adds missing columns. Never drops or renames.
pub struct SchemaReconciler<'a> {
    store: &'a dyn ReportStore,
}

impl<'a> SchemaReconciler<'a> {
    pub fn new(store: &'a dyn ReportStore) -> Self {
        Self { store }
    }

    /// Compute the changes `reconcile` would apply, without applying them.
    pub async fn plan(
        &self,
        table: &str,
        header: &TableSchema,
    ) -> Result<Reconciliation, SchemaError> {
        tori_core::validate_table_name(table)?;
        let bindings = ColumnBinding::bind_all(header)?;
        let current = self
            .store
            .table_columns(table)
            .await
            .map_err(|source| store_failure(table, source))?;
        let changes = reconcile_plan(table, current.as_ref(), &bindings);
        let effective = changes
            .iter()
            .fold(current, |schema, change| Some(change.apply_to(schema)))
            .unwrap_or_default();
        Ok(Reconciliation {
            bindings,
            changes,
            effective,
        })
    }

    pub async fn reconcile(
        &self,
        table: &str,
        header: &TableSchema,
    ) -> Result<Reconciliation, SchemaError> {
        let mut outcome = self.plan(table, header).await?;
        if outcome.changes.is_empty() {
            info!(table, "table schema already up to date");
            return Ok(outcome);
        }

        for change in &outcome.changes {
            info!(table, change = %change, "planned schema change");
        }
        self.store
            .apply_changes(&outcome.changes)
            .await
            .map_err(|source| store_failure(table, source))?;

        outcome.effective = self
            .store
            .table_columns(table)
            .await
            .map_err(|source| store_failure(table, source))?
            .ok_or_else(|| {
                store_failure(
                    table,
                    StoreError::Rejected("table missing after schema changes".to_string()),
                )
            })?;
        Ok(outcome)
    }
}

fn store_failure(table: &str, source: StoreError) -> SchemaError {
    SchemaError::Store {
        table: table.to_string(),
        source: Box::new(source),
    }
}

/// Inserts a parsed batch, all-or-nothing.
pub struct BatchLoader<'a> {
    store: &'a dyn ReportStore,
}

impl<'a> BatchLoader<'a> {
    pub fn new(store: &'a dyn ReportStore) -> Self {
        Self { store }
    }

    pub async fn load(
        &self,
        table: &str,
        bindings: &[ColumnBinding],
        rows: &[ReportRow],
        processed_at: DateTime<Utc>,
    ) -> Result<u64, LoadError> {
        if rows.is_empty() {
            warn!(table, "no rows to load");
            return Ok(0);
        }
        let inserted = self
            .store
            .insert_rows(table, bindings, rows, processed_at)
            .await
            .map_err(|source| LoadError {
                table: table.to_string(),
                attempted: rows.len(),
                committed: 0,
                source,
            })?;
        info!(table, rows = inserted, "batch committed");
        Ok(inserted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: &'static str,
    pub window: TimeWindow,
    pub processed_at: DateTime<Utc>,
    pub report_bytes: usize,
    pub report_sha256: String,
    pub header: TableSchema,
    pub rows_parsed: usize,
    pub table: String,
    pub table_created: bool,
    pub columns_added: Vec<String>,
    pub rows_inserted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub run_id: Uuid,
    pub window: TimeWindow,
    pub rows_parsed: usize,
    pub table: String,
    pub reconciliation: Reconciliation,
}

struct FetchedBatch {
    window: TimeWindow,
    report_bytes: usize,
    report_sha256: String,
    header: TableSchema,
    rows: Vec<ReportRow>,
}

pub struct IngestPipeline {
    config: IngestConfig,
    tokens: TokenProvider,
    reports: ReportFetcher,
    normalizer: CsvNormalizer,
    store: Arc<dyn ReportStore>,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig, store: Arc<dyn ReportStore>) -> Result<Self, IngestError> {
        let client = build_client(&config.http).map_err(IngestError::Client)?;
        let tokens = TokenProvider::new(client.clone(), config.http.token_timeout);
        let reports = ReportFetcher::new(
            client,
            config.reports_endpoint.clone(),
            config.http.report_timeout,
        );
        Ok(Self {
            config,
            tokens,
            reports,
            normalizer: CsvNormalizer::default(),
            store,
        })
    }

    pub async fn run_once(&self, mode: RunMode) -> Result<RunSummary, IngestError> {
        self.run_at(mode, Utc::now()).await
    }

    /// `now` bounds a scheduled window and stamps every inserted row.
    pub async fn run_at(
        &self,
        mode: RunMode,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "ingest_run",
            %run_id,
            mode = mode.label(),
            table = %self.config.table_name
        );

        async move {
            info!("starting ingest run");
            let result = self.execute(run_id, mode, now).await;
            match &result {
                Ok(summary) => info!(
                    window = %summary.window,
                    rows_parsed = summary.rows_parsed,
                    rows_inserted = summary.rows_inserted,
                    table_created = summary.table_created,
                    columns_added = summary.columns_added.len(),
                    report_sha256 = %summary.report_sha256,
                    "ingest run completed"
                ),
                Err(err) => error!(
                    kind = err.kind(),
                    error = %error_chain(err),
                    reports_endpoint = %self.config.reports_endpoint,
                    "ingest run failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Fetch and parse like a run, then report the schema changes without writing.
    pub async fn plan_at(
        &self,
        mode: RunMode,
        now: DateTime<Utc>,
    ) -> Result<PlanSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_plan", %run_id, mode = mode.label());
        async move {
            let batch = self.fetch_batch(mode, now).await?;
            let reconciliation = SchemaReconciler::new(self.store.as_ref())
                .plan(&self.config.table_name, &batch.header)
                .await?;
            Ok(PlanSummary {
                run_id,
                window: batch.window,
                rows_parsed: batch.rows.len(),
                table: self.config.table_name.clone(),
                reconciliation,
            })
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        mode: RunMode,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, IngestError> {
        let batch = self.fetch_batch(mode, now).await?;
        let table = self.config.table_name.as_str();

        let reconciliation = SchemaReconciler::new(self.store.as_ref())
            .reconcile(table, &batch.header)
            .await?;
        let rows_inserted = BatchLoader::new(self.store.as_ref())
            .load(table, &reconciliation.bindings, &batch.rows, now)
            .await?;

        Ok(RunSummary {
            run_id,
            mode: mode.label(),
            window: batch.window,
            processed_at: now,
            report_bytes: batch.report_bytes,
            report_sha256: batch.report_sha256,
            rows_parsed: batch.rows.len(),
            header: batch.header,
            table: table.to_string(),
            table_created: reconciliation.table_created(),
            columns_added: reconciliation.columns_added(),
            rows_inserted,
        })
    }

    async fn fetch_batch(
        &self,
        mode: RunMode,
        now: DateTime<Utc>,
    ) -> Result<FetchedBatch, IngestError> {
        let window = TimeWindow::compute(&mode, now, self.config.period)?;
        info!(%window, "computed report window");

        let token = self.tokens.acquire(&self.config.credentials).await?;
        let report = self.reports.fetch(&token, &window).await?;
        let report_sha256 = report.sha256_hex();

        let parsed = self.normalizer.parse(&report)?;
        info!(
            bytes = report.len(),
            columns = ?parsed.header.columns(),
            rows = parsed.rows.len(),
            "parsed report"
        );

        Ok(FetchedBatch {
            window,
            report_bytes: report.len(),
            report_sha256,
            header: parsed.header,
            rows: parsed.rows,
        })
    }
}

/// `outer: inner: innermost`, for one-line logs.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

pub async fn run_once_from_env(mode: RunMode) -> Result<RunSummary, IngestError> {
    let config = IngestConfig::from_env()?;
    let store = Arc::new(PgReportStore::connect_lazy(&config.database));
    IngestPipeline::new(config, store)?.run_once(mode).await
}

pub async fn plan_once_from_env(mode: RunMode) -> Result<PlanSummary, IngestError> {
    let config = IngestConfig::from_env()?;
    let store = Arc::new(PgReportStore::connect_lazy(&config.database));
    IngestPipeline::new(config, store)?
        .plan_at(mode, Utc::now())
        .await
}
