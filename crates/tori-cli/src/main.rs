use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tori_core::{parse_timestamp, RunMode};
use tori_sync::{error_chain, IngestError, PlanSummary, RunSummary};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tori")]
#[command(about = "Pull TORI reports for a time window and load them into SQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, parse and load one window (default)
    Run(WindowArgs),
    /// Fetch and parse, then print the schema changes a run would apply
    Plan(WindowArgs),
}

#[derive(Debug, Default, Args)]
struct WindowArgs {
    /// Window start, RFC 3339 or YYYY-MM-DDTHH:MM:SS (UTC); needs --end
    #[arg(long, requires = "end", value_parser = parse_timestamp)]
    start: Option<DateTime<Utc>>,

    /// Window end, exclusive; needs --start
    #[arg(long, requires = "start", value_parser = parse_timestamp)]
    end: Option<DateTime<Utc>>,

    /// Print the summary as JSON on stdout
    #[arg(long, default_value = "false")]
    json: bool,
}

impl WindowArgs {
    fn mode(&self) -> RunMode {
        match (self.start, self.end) {
            (Some(start), Some(end)) => RunMode::Manual { start, end },
            _ => RunMode::Scheduled,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TORI_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let outcome = match cli.command.unwrap_or(Commands::Run(WindowArgs::default())) {
        Commands::Run(args) => tori_sync::run_once_from_env(args.mode())
            .await
            .map(|summary| print_run(&summary, args.json)),
        Commands::Plan(args) => tori_sync::plan_once_from_env(args.mode())
            .await
            .map(|plan| print_plan(&plan, args.json)),
    };

    match outcome {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            error!(error = %format!("{err:#}"), "writing summary failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
        Err(err) => fail(&err),
    }
}

fn fail(err: &IngestError) -> ExitCode {
    error!(
        kind = err.kind(),
        exit_code = err.exit_code(),
        error = %error_chain(err),
        "ingest run failed"
    );
    eprintln!("tori {} failed: {}", err.kind(), error_chain(err));
    ExitCode::from(err.exit_code())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing summary")?;
    println!("{text}");
    Ok(())
}

fn print_run(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        return print_json(summary);
    }
    println!(
        "ingest complete: run_id={} mode={} window={} rows_parsed={} rows_inserted={} table={} created={} columns_added=[{}] sha256={}",
        summary.run_id,
        summary.mode,
        summary.window,
        summary.rows_parsed,
        summary.rows_inserted,
        summary.table,
        summary.table_created,
        summary.columns_added.join(", "),
        summary.report_sha256,
    );
    Ok(())
}

fn print_plan(plan: &PlanSummary, json: bool) -> Result<()> {
    if json {
        return print_json(plan);
    }
    println!(
        "plan: run_id={} window={} rows_parsed={} table={}",
        plan.run_id, plan.window, plan.rows_parsed, plan.table
    );
    if plan.reconciliation.changes.is_empty() {
        println!("no schema changes");
    }
    for change in &plan.reconciliation.changes {
        println!("{change};");
    }
    Ok(())
}
