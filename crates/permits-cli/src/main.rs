use anyhow::Result;
use chrono::{Local, NaiveDate};
use clap::Parser;
use permits_core::DateWindow;
use permits_sync::{SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "permits-cli")]
#[command(about = "Scrape the Capitol Grounds permit calendar into the local store")]
struct Cli {
    /// Start of the calendar window (defaults to today).
    #[arg(long)]
    date_begin: Option<NaiveDate>,
    /// End of the calendar window (defaults to two months after the start
    /// when no explicit start is given, open-ended otherwise).
    #[arg(long)]
    date_end: Option<NaiveDate>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let today = Local::now().date_naive();
    let window = match (cli.date_begin, cli.date_end) {
        (None, None) => DateWindow::rolling_two_months(today),
        (begin, end) => DateWindow::new(begin.unwrap_or(today), end),
    };

    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    let summary = pipeline.run_once(window).await?;

    println!(
        "sync complete: run_id={} window={} listed={} enriched={} failures={} updated={} inserted={} total={} store={}",
        summary.run_id,
        summary.window,
        summary.listed,
        summary.enriched,
        summary.enrich_failures,
        summary.updated,
        summary.inserted,
        summary.total,
        summary.store_path
    );

    Ok(())
}
