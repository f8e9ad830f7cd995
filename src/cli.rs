use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::models::{BatchProgress, BatchRequest, ColumnMappingInput};
use crate::sync::ImportEngine;

/// Post import service
#[derive(Parser, Debug)]
#[command(name = "post-import-service")]
#[command(about = "Resumable CSV post import service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// The chosen subcommand; serving is the default.
    pub fn command(self) -> Command {
        self.command.unwrap_or(Command::Serve)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the GraphQL server
    Serve,
    /// Create MongoDB indexes
    Migrate,
    /// Import a CSV file in-process
    Import(ImportArgs),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ImportArgs {
    /// CSV file to import
    pub path: PathBuf,
    /// Column assignments: `Header=type` or `Header=custom-field:meta_key`
    #[arg(required = true, value_parser = parse_column)]
    pub columns: Vec<ColumnMappingInput>,
    /// Skip rows whose slug already exists
    #[arg(long)]
    pub skip_duplicates: bool,
    /// Retry failed rows once at the end
    #[arg(long)]
    pub retry: bool,
}

fn parse_column(spec: &str) -> std::result::Result<ColumnMappingInput, String> {
    let invalid = || format!("invalid mapping '{}', expected Header=type[:meta_key]", spec);
    let (header, target) = spec.rsplit_once('=').ok_or_else(invalid)?;
    let (field_type, meta_key) = match target.split_once(':') {
        Some((t, k)) => (t, Some(k.to_string())),
        None => (target, None),
    };
    if header.is_empty() || field_type.is_empty() {
        return Err(invalid());
    }
    Ok(ColumnMappingInput {
        header: header.to_string(),
        field_type: field_type.to_string(),
        meta_key,
    })
}

/// Import a local CSV to completion, one batch per call, then optionally
/// retry the rows that failed.
pub async fn run_import(engine: &ImportEngine, args: ImportArgs) -> Result<BatchProgress> {
    let prepared = engine
        .prepare(&args.path, args.path.file_name().and_then(|n| n.to_str()))
        .await?;
    tracing::info!(token = %prepared.token, headers = ?prepared.headers, "Importing CSV from command line");

    let request = BatchRequest { columns: args.columns, skip_duplicates: args.skip_duplicates };
    let mut progress = engine.process_batch(&prepared.token, Some(&request)).await?;
    while !progress.done && progress.cursor < progress.total {
        progress = engine.process_batch(&prepared.token, None).await?;
        println!("{}/{} rows: {} imported, {} skipped, {} failed", progress.cursor, progress.total, progress.imported, progress.skipped, progress.failed);
    }

    if args.retry && progress.retryable {
        progress = engine.retry_failed(&prepared.token).await?;
        println!("retry: {} imported, {} skipped, {} failed", progress.imported, progress.skipped, progress.failed);
    }
    Ok(progress)
}
