use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_sync::{run_fetch_only, run_sync_once, HarvestConfig, HarvestRunSummary};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Harvest open BOAMP tenders into a keyed store")]
struct Cli {
    /// Optional YAML settings file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    rows: Option<usize>,
    #[arg(long, global = true)]
    max_pages: Option<usize>,
    /// Print the run summary as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Fetch open notices and upsert them.
    Sync,
    /// Fetch open notices and report counts without writing.
    Fetch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = HarvestConfig::load(cli.config.as_deref())
        .await
        .context("loading harvest configuration")?;
    if let Some(rows) = cli.rows {
        config.rows = rows;
    }
    if let Some(max_pages) = cli.max_pages {
        config.max_pages = max_pages;
    }

    let (summary, table) = match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => (
            run_sync_once(&config).await.context("harvest sync failed")?,
            Some(config.table.as_str()),
        ),
        Commands::Fetch => (
            run_fetch_only(&config).await.context("harvest fetch failed")?,
            None,
        ),
    };
    for line in summary_lines(&summary, table) {
        println!("{line}");
    }
    if cli.json {
        print_json(&summary)?;
    }

    Ok(())
}

// `table` is set when the run wrote to storage.
fn summary_lines(summary: &HarvestRunSummary, table: Option<&str>) -> Vec<String> {
    let mut lines = vec![format!(
        "open tenders fetched: {} (run_id={} pages={} stop={})",
        summary.documents_fetched, summary.run_id, summary.pages_fetched, summary.stop_reason
    )];
    if summary.documents_fetched == 0 {
        lines.push("no open tenders found from Opendatasoft; nothing written".to_string());
        return lines;
    }
    let Some(table) = table else {
        return lines;
    };

    let dropped = summary
        .ingest
        .map(|report| report.dropped_without_id)
        .unwrap_or(0);
    if dropped > 0 {
        lines.push(format!("skipped {dropped} records without recordid"));
    }
    match summary.written() {
        0 => lines.push(format!(
            "all {} fetched records lacked a recordid; nothing written to {table}",
            summary.documents_fetched
        )),
        written => lines.push(format!("upserted {written} open tenders into {table}")),
    }
    lines
}

fn print_json(summary: &HarvestRunSummary) -> Result<()> {
    let text = serde_json::to_string_pretty(summary).context("serializing run summary")?;
    println!("{text}");
    Ok(())
}
