use anyhow::{Result, bail};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crypto_beta::config::Config;
use crypto_beta::fetch::{FetchWindow, HistoricalFetcher, HttpTransport, TokioClock};
use crypto_beta::pipeline::{self, ApiSource, BetaResult, PriceSource, SheetSource};
use crypto_beta::sheet::{CsvWorkbook, acquire_lock};
use crypto_beta::{BetaArgs, HistoryArgs};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Beta(BetaArgs),
    History(HistoryArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Some(Command::Beta(beta_args)) => {
            let mut cfg = Config::from_env();
            cfg.apply_beta_args(&beta_args);
            run_beta(&cfg).await?;
        }
        Some(Command::History(history_args)) => {
            let mut cfg = Config::from_env();
            cfg.apply_history_args(&history_args);
            run_history(&cfg).await?;
        }
        None => {
            // Default behavior: score the coins sheet with defaults
            println!("Running beta with default arguments...");
            run_beta(&Config::from_env()).await?;
        }
    }
    Ok(())
}

async fn run_beta(cfg: &Config) -> Result<()> {
    let _lock_guard = cfg.lock_file.as_deref().map(acquire_lock).transpose()?;
    let sink = CsvWorkbook::new(&cfg.workbook_dir);

    let source: Box<dyn PriceSource + '_> = match cfg.source.provider() {
        Some(provider) => {
            let fetcher = HistoricalFetcher::new(HttpTransport::new()?, TokioClock, cfg.fetch.clone());
            let window = FetchWindow::trailing_days(cfg.days, Utc::now());
            Box::new(ApiSource::new(fetcher, provider, window))
        }
        // PriceSourceKind::Sheet
        None => Box::new(SheetSource::new(&sink, cfg.history_spreadsheet.clone())),
    };

    let results = pipeline::run_beta(cfg, source.as_ref(), &sink, Local::now().naive_local()).await?;
    print_report(&results);
    Ok(())
}

async fn run_history(cfg: &Config) -> Result<()> {
    if cfg.assets.is_empty() {
        bail!("no symbols given (use --symbols)");
    }
    let _lock_guard = cfg.lock_file.as_deref().map(acquire_lock).transpose()?;
    let sink = CsvWorkbook::new(&cfg.workbook_dir);
    let fetcher = HistoricalFetcher::new(HttpTransport::new()?, TokioClock, cfg.fetch.clone());
    let now = Utc::now();
    let window = FetchWindow::trailing_days(cfg.history_days, now);

    let results = pipeline::run_history(
        &fetcher,
        cfg.history_provider,
        &cfg.assets,
        &window,
        &sink,
        &cfg.history_spreadsheet,
        now.date_naive(),
    )
    .await;

    for r in &results {
        match &r.outcome {
            Ok(n) => println!("{:<12} {:>6} days -> {}", r.symbol, n, r.sheet),
            Err(e) => println!("{:<12} FAILED: {}", r.symbol, e),
        }
    }
    let failed = results.iter().filter(|r| r.outcome.is_err()).count();
    info!("history export complete ({} ok, {} failed)", results.len() - failed, failed);
    Ok(())
}

fn print_report(results: &[BetaResult]) {
    for r in results {
        println!("{:<24} {}", r.asset, r.outcome);
    }
    let ok = results.iter().filter(|r| r.beta().is_some()).count();
    info!("beta run complete ({} ok, {} failed)", ok, results.len() - ok);
}
