use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use table_mailer::config;
use table_mailer::db::{self, SqlxSource};
use table_mailer::export;
use table_mailer::model::ExportRequest;

#[derive(Debug, Parser)]
#[command(about = "Export one table or view to a local xlsx file using the configured database")]
struct Args {
    /// Path to YAML or JSON config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Table or view to export
    #[arg(long)]
    table: String,

    /// Output file (defaults to <table>.xlsx)
    #[arg(long)]
    out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::connect(&cfg.db).await?;
    let source = SqlxSource::new(pool.clone());

    let result = export::export(&source, &ExportRequest::new(args.table.as_str())).await;
    pool.close().await;
    let doc = result?;

    let out = args
        .out
        .unwrap_or_else(|| PathBuf::from(format!("{}.xlsx", args.table)));
    let bytes = doc.to_xlsx()?;
    tokio::fs::write(&out, &bytes)
        .await
        .with_context(|| format!("failed to write {}", out.display()))?;
    info!(
        path = %out.display(),
        columns = doc.header().len(),
        rows = doc.data_rows().len(),
        "export written"
    );
    Ok(())
}
