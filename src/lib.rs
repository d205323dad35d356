pub mod beta;
pub mod config;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod pipeline;
pub mod provider;
pub mod sheet;

use clap::Parser;
use std::path::PathBuf;

use crate::config::PriceSourceKind;
use crate::provider::Provider;

/// Computes beta vs a benchmark for a list of coins and writes the table to a workbook.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct BetaArgs {
    /// Workbook root directory (one folder per spreadsheet)
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Spreadsheet holding the coin list and the beta table
    #[arg(long)]
    pub spreadsheet: Option<String>,

    /// Sub-sheet whose first column lists the coins (row 1 is a header)
    #[arg(long)]
    pub coins_sheet: Option<String>,

    /// Sub-sheet the beta table is written to
    #[arg(long)]
    pub beta_sheet: Option<String>,

    /// A1 range for the beta table, e.g. F4:G
    #[arg(long)]
    pub range: Option<String>,

    /// Coins to score instead of reading the coins sheet
    #[arg(long, num_args=1..)]
    pub assets: Option<Vec<String>>,

    /// Where prices come from
    #[arg(long, value_enum)]
    pub source: Option<PriceSourceKind>,

    /// Benchmark CoinGecko id (e.g. bitcoin)
    #[arg(long)]
    pub benchmark_id: Option<String>,

    /// Benchmark exchange symbol (e.g. BTC)
    #[arg(long)]
    pub benchmark_symbol: Option<String>,

    /// Lookback window in days
    #[arg(long)]
    pub days: Option<u32>,

    /// Attempts per API call before giving up on an asset (at least 1)
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    pub retries: Option<usize>,

    /// Assets fetched concurrently (be mindful of API rate limits)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Delay (ms) between chunked requests to avoid bursts
    #[arg(long)]
    pub request_delay_ms: Option<u64>,

    /// Optional lock file path to prevent concurrent runs
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}

/// Exports full daily OHLCV history per symbol into `{SYMBOL}USDT` sub-sheets.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct HistoryArgs {
    /// Workbook root directory (one folder per spreadsheet)
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Spreadsheet receiving the history sub-sheets
    #[arg(long)]
    pub spreadsheet: Option<String>,

    /// Symbols to export (e.g. SOL ETH)
    #[arg(long, num_args=1..)]
    pub symbols: Option<Vec<String>>,

    /// Exchange to pull candles from
    #[arg(long, value_enum)]
    pub provider: Option<Provider>,

    /// Days of history to request
    #[arg(long)]
    pub days: Option<u32>,

    /// Attempts per API call before giving up on a symbol (at least 1)
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    pub retries: Option<usize>,

    #[arg(long)]
    pub request_delay_ms: Option<u64>,

    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}
