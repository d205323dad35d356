use std::{env, path::PathBuf, time::Duration};

use crate::provider::{BINANCE_MAX_LIMIT, COINBASE_MAX_LIMIT, Provider};
use crate::{BetaArgs, HistoryArgs};

/// Where beta prices come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PriceSourceKind {
    #[value(name = "coingecko")]
    CoinGecko,
    Binance,
    Coinbase,
    /// Close prices previously stored by `history`.
    Sheet,
}

impl PriceSourceKind {
    pub fn provider(self) -> Option<Provider> {
        match self {
            PriceSourceKind::CoinGecko => Some(Provider::CoinGecko),
            PriceSourceKind::Binance => Some(Provider::Binance),
            PriceSourceKind::Coinbase => Some(Provider::Coinbase),
            PriceSourceKind::Sheet => None,
        }
    }
}

/// Benchmark asset, named both ways: CoinGecko id and exchange symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Benchmark {
    pub id: String,
    pub symbol: String,
}

impl Benchmark {
    pub fn asset_for(&self, source: PriceSourceKind) -> &str {
        match source {
            PriceSourceKind::CoinGecko => &self.id,
            _ => &self.symbol,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiKeys {
    pub coingecko: Option<String>,
    pub binance: Option<String>,
}

impl ApiKeys {
    /// Reads `COINGECKO_API_KEY` and `BINANCE_API_KEY`; empty values count as unset.
    pub fn from_env() -> Self {
        let read = |name: &str| env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            coingecko: read("COINGECKO_API_KEY"),
            binance: read("BINANCE_API_KEY"),
        }
    }
}

/// Knobs of the historical fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchSettings {
    pub retries: usize,
    /// Pause between consecutive chunk calls.
    pub request_delay: Duration,
    pub keys: ApiKeys,
    pub binance_max_limit: i64,
    pub coinbase_max_limit: i64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            retries: 5,
            request_delay: Duration::from_millis(250),
            keys: ApiKeys::default(),
            binance_max_limit: BINANCE_MAX_LIMIT,
            coinbase_max_limit: COINBASE_MAX_LIMIT,
        }
    }
}

/// Run configuration. Every field has a documented default; CLI flags override.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Root directory holding one folder per spreadsheet. Default `./sheets`.
    pub workbook_dir: PathBuf,
    /// Spreadsheet with the coin list and the beta table. Default `Beta Scores First Test`.
    pub spreadsheet: String,
    /// Sub-sheet whose column A lists asset ids. Default `Coins`.
    pub coins_sheet: String,
    /// Sub-sheet the beta table is written to. Default `Beta Table`.
    pub beta_sheet: String,
    /// A1 range of the beta table. Default `F4:G`.
    pub beta_range: String,
    /// Spreadsheet holding per-symbol daily history. Default `historical_prices_daily`.
    pub history_spreadsheet: String,
    /// Default `bitcoin` / `BTC`.
    pub benchmark: Benchmark,
    /// Literal asset list; when empty the coins sheet is read.
    pub assets: Vec<String>,
    pub source: PriceSourceKind,
    /// Beta lookback window in days. Default 365.
    pub days: u32,
    /// History export window in days. Default 6000.
    pub history_days: u32,
    pub history_provider: Provider,
    /// Max assets fetched at once. Default 1 (sequential).
    pub concurrency: usize,
    pub fetch: FetchSettings,
    pub lock_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workbook_dir: PathBuf::from("./sheets"),
            spreadsheet: "Beta Scores First Test".to_string(),
            coins_sheet: "Coins".to_string(),
            beta_sheet: "Beta Table".to_string(),
            beta_range: "F4:G".to_string(),
            history_spreadsheet: "historical_prices_daily".to_string(),
            benchmark: Benchmark {
                id: "bitcoin".to_string(),
                symbol: "BTC".to_string(),
            },
            assets: Vec::new(),
            source: PriceSourceKind::CoinGecko,
            days: 365,
            history_days: 6000,
            history_provider: Provider::Binance,
            concurrency: 1,
            fetch: FetchSettings::default(),
            lock_file: None,
        }
    }
}

impl Config {
    /// Defaults plus API keys from the environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.fetch.keys = ApiKeys::from_env();
        cfg
    }

    pub fn apply_beta_args(&mut self, args: &BetaArgs) {
        if let Some(out) = &args.out {
            self.workbook_dir = out.clone();
        }
        if let Some(v) = &args.spreadsheet {
            self.spreadsheet = v.clone();
        }
        if let Some(v) = &args.coins_sheet {
            self.coins_sheet = v.clone();
        }
        if let Some(v) = &args.beta_sheet {
            self.beta_sheet = v.clone();
        }
        if let Some(v) = &args.range {
            self.beta_range = v.clone();
        }
        if let Some(v) = &args.assets {
            self.assets = v.iter().filter(|a| !a.trim().is_empty()).cloned().collect();
        }
        if let Some(v) = args.source {
            self.source = v;
        }
        if let Some(v) = &args.benchmark_id {
            self.benchmark.id = v.clone();
        }
        if let Some(v) = &args.benchmark_symbol {
            self.benchmark.symbol = v.clone();
        }
        if let Some(v) = args.days {
            self.days = v;
        }
        if let Some(v) = args.concurrency {
            self.concurrency = v.max(1);
        }
        self.apply_fetch_args(args.retries, args.request_delay_ms);
        if args.lock_file.is_some() {
            self.lock_file = args.lock_file.clone();
        }
    }

    pub fn apply_history_args(&mut self, args: &HistoryArgs) {
        if let Some(out) = &args.out {
            self.workbook_dir = out.clone();
        }
        if let Some(v) = &args.spreadsheet {
            self.history_spreadsheet = v.clone();
        }
        if let Some(v) = &args.symbols {
            self.assets = v.iter().filter(|a| !a.trim().is_empty()).cloned().collect();
        }
        if let Some(v) = args.provider {
            self.history_provider = v;
        }
        if let Some(v) = args.days {
            self.history_days = v;
        }
        self.apply_fetch_args(args.retries, args.request_delay_ms);
        if args.lock_file.is_some() {
            self.lock_file = args.lock_file.clone();
        }
    }

    fn apply_fetch_args(&mut self, retries: Option<usize>, delay_ms: Option<u64>) {
        if let Some(v) = retries {
            self.fetch.retries = v.max(1);
        }
        if let Some(v) = delay_ms {
            self.fetch.request_delay = Duration::from_millis(v);
        }
    }
}
