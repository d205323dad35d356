use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use futures::{StreamExt, stream};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{error, info, warn};

use crate::beta::compute_beta;
use crate::config::Config;
use crate::error::RegressionError;
use crate::fetch::{Clock, FetchWindow, HistoricalFetcher, Transport};
use crate::normalize::{Bar, OhlcRow, PricePoint, Series, closes};
use crate::provider::{Provider, history_sheet_name};
use crate::sheet::{SheetRow, SheetSink, SubSheet};

pub const OHLC_HEADER: [&str; 6] = ["Date", "Open", "High", "Low", "Close", "Volume (USDT)"];
pub const PRICE_HEADER: [&str; 2] = ["Date", "Price"];

/// Anything that can produce a daily close series for an asset.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// `None` when the asset could not be loaded.
    async fn closes(&self, asset: &str) -> Option<BTreeMap<NaiveDate, f64>>;
}

/// Prices pulled live from a provider API.
pub struct ApiSource<T, C> {
    fetcher: HistoricalFetcher<T, C>,
    provider: Provider,
    window: FetchWindow,
}

impl<T: Transport, C: Clock> ApiSource<T, C> {
    pub fn new(fetcher: HistoricalFetcher<T, C>, provider: Provider, window: FetchWindow) -> Self {
        Self {
            fetcher,
            provider,
            window,
        }
    }
}

#[async_trait]
impl<T: Transport, C: Clock> PriceSource for ApiSource<T, C> {
    async fn closes(&self, asset: &str) -> Option<BTreeMap<NaiveDate, f64>> {
        match self.fetcher.fetch(self.provider, asset, &self.window).await {
            Ok(raw) => Some(closes(&raw.normalize())),
            Err(e) => {
                error!("failed to fetch prices for {}: {}", asset, e);
                None
            }
        }
    }
}

/// Prices reloaded from history sub-sheets written by [`run_history`].
pub struct SheetSource<'a, S> {
    sink: &'a S,
    spreadsheet: String,
}

impl<'a, S: SheetSink> SheetSource<'a, S> {
    pub fn new(sink: &'a S, spreadsheet: impl Into<String>) -> Self {
        Self {
            sink,
            spreadsheet: spreadsheet.into(),
        }
    }
}

#[async_trait]
impl<'a, S: SheetSink> PriceSource for SheetSource<'a, S> {
    async fn closes(&self, asset: &str) -> Option<BTreeMap<NaiveDate, f64>> {
        match load_history(self.sink, &self.spreadsheet, asset) {
            Ok(series) if !series.is_empty() => Some(closes(&series)),
            Ok(_) => {
                warn!("no history rows for {} in {}", asset, self.spreadsheet);
                None
            }
            Err(e) => {
                warn!("could not load history for {}: {:#}", asset, e);
                None
            }
        }
    }
}

/// Per-asset result of a beta run.
#[derive(Debug, Clone, PartialEq)]
pub enum BetaOutcome {
    Beta(f64),
    /// Asset (or benchmark) prices could not be fetched.
    FetchFailed,
    /// Asset and benchmark share no dates.
    NoOverlap,
    Undefined(RegressionError),
}

impl fmt::Display for BetaOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetaOutcome::Beta(b) => write!(f, "{:.4}", b),
            BetaOutcome::FetchFailed => write!(f, "fetch failed"),
            BetaOutcome::NoOverlap => write!(f, "no common dates"),
            BetaOutcome::Undefined(e) => write!(f, "undefined: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BetaResult {
    pub asset: String,
    pub outcome: BetaOutcome,
}

impl BetaResult {
    pub fn beta(&self) -> Option<f64> {
        match self.outcome {
            BetaOutcome::Beta(b) => Some(b),
            _ => None,
        }
    }
}

/// Asset ids from column A of `coins_sheet`, header skipped, blanks dropped.
pub fn read_asset_list(sink: &dyn SheetSink, spreadsheet: &str, coins_sheet: &str) -> Result<Vec<String>> {
    let rows = sink
        .read(spreadsheet, Some(&SubSheet::from(coins_sheet)))
        .with_context(|| format!("read coin list from {spreadsheet}/{coins_sheet}"))?;
    Ok(rows
        .into_iter()
        .skip(1)
        .filter_map(|r| r.into_iter().next())
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect())
}

async fn beta_for_asset(
    source: &dyn PriceSource,
    benchmark: &BTreeMap<NaiveDate, f64>,
    asset: &str,
) -> BetaResult {
    info!("getting beta for {}...", asset);
    let outcome = match source.closes(asset).await {
        None => BetaOutcome::FetchFailed,
        Some(prices) => match compute_beta(benchmark, &prices) {
            Ok(Some(c)) => BetaOutcome::Beta(c.beta()),
            Ok(None) => {
                warn!("no common dates between benchmark and {}", asset);
                BetaOutcome::NoOverlap
            }
            Err(e) => {
                warn!("beta undefined for {}: {}", asset, e);
                BetaOutcome::Undefined(e)
            }
        },
    };
    BetaResult {
        asset: asset.to_string(),
        outcome,
    }
}

/// Beta of every asset against `benchmark`. One asset failing never stops the
/// others; at most `concurrency` assets are in flight, results keep input order.
pub async fn compute_betas(
    source: &dyn PriceSource,
    benchmark: &str,
    assets: &[String],
    concurrency: usize,
) -> Vec<BetaResult> {
    let Some(bench) = source.closes(benchmark).await else {
        error!("failed to fetch benchmark {}; no betas computed", benchmark);
        return assets
            .iter()
            .map(|a| BetaResult {
                asset: a.clone(),
                outcome: BetaOutcome::FetchFailed,
            })
            .collect();
    };
    let bench = &bench;
    stream::iter(assets.iter())
        .map(|asset| beta_for_asset(source, bench, asset))
        .buffered(concurrency.max(1))
        .collect()
        .await
}

/// Sheet block: timestamp row, column headers, one row per asset.
pub fn beta_table(results: &[BetaResult], benchmark_symbol: &str, updated: NaiveDateTime) -> Vec<SheetRow> {
    let mut rows = vec![
        vec!["Updated".to_string(), updated.format("%d-%m-%Y %H:%M:%S").to_string()],
        vec!["Coin".to_string(), format!("Beta/{benchmark_symbol} ")],
    ];
    rows.extend(
        results
            .iter()
            .map(|r| vec![r.asset.clone(), r.outcome.to_string()]),
    );
    rows
}

/// Full beta run: asset list, betas, table written to the beta sheet.
pub async fn run_beta(
    cfg: &Config,
    source: &dyn PriceSource,
    sink: &dyn SheetSink,
    updated: NaiveDateTime,
) -> Result<Vec<BetaResult>> {
    let assets = if cfg.assets.is_empty() {
        read_asset_list(sink, &cfg.spreadsheet, &cfg.coins_sheet)?
    } else {
        cfg.assets.clone()
    };
    info!("fetched coins: {:?}", assets);

    let benchmark = cfg.benchmark.asset_for(cfg.source);
    let results = compute_betas(source, benchmark, &assets, cfg.concurrency).await;

    let table = beta_table(&results, &cfg.benchmark.symbol, updated);
    sink.write(
        &cfg.spreadsheet,
        &table,
        Some(&SubSheet::Name(cfg.beta_sheet.clone())),
        Some(&cfg.beta_range),
    )
    .context("write beta table")?;
    info!("beta table written to {}/{}", cfg.spreadsheet, cfg.beta_sheet);
    Ok(results)
}

/// Header + one row per date; OHLCV layout when any candle is present.
pub fn history_table(series: &Series) -> Vec<SheetRow> {
    let candles = series.values().any(|b| matches!(b, Bar::Candle(_)));
    let header: Vec<String> = if candles {
        OHLC_HEADER.iter().map(|h| h.to_string()).collect()
    } else {
        PRICE_HEADER.iter().map(|h| h.to_string()).collect()
    };
    let mut rows = vec![header];
    for bar in series.values() {
        let date = bar.date().format("%Y-%m-%d").to_string();
        rows.push(match bar {
            Bar::Candle(c) => vec![
                date,
                c.open.to_string(),
                c.high.to_string(),
                c.low.to_string(),
                c.close.to_string(),
                c.volume.to_string(),
            ],
            Bar::Price(p) => vec![date, p.value.to_string()],
        });
    }
    rows
}

/// `A1:F{n}` style range for a block of `rows`.
fn block_range(rows: &[SheetRow]) -> String {
    let width = rows.iter().map(Vec::len).max().unwrap_or(1).clamp(1, 26);
    let last_col = char::from(b'A' + (width - 1) as u8);
    format!("A1:{}{}", last_col, rows.len())
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryResult {
    pub symbol: String,
    pub sheet: String,
    /// Rows written, or the failure that was recorded on the sheet instead.
    pub outcome: Result<usize, String>,
}

/// Fetch full daily history for each symbol and store it in `{SYMBOL}USDT`.
/// A failed symbol gets an error row appended and the run moves on.
pub async fn run_history<T: Transport, C: Clock>(
    fetcher: &HistoricalFetcher<T, C>,
    provider: Provider,
    symbols: &[String],
    window: &FetchWindow,
    sink: &dyn SheetSink,
    spreadsheet: &str,
    today: NaiveDate,
) -> Vec<HistoryResult> {
    let mut out = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let sheet = history_sheet_name(symbol);
        let subsheet = SubSheet::Name(sheet.clone());
        let written = match fetcher.fetch(provider, symbol, window).await {
            Ok(raw) => {
                let rows = history_table(&raw.normalize());
                let range = block_range(&rows);
                sink.write(spreadsheet, &rows, Some(&subsheet), Some(&range))
                    .map(|_| rows.len() - 1)
                    .map_err(|e| format!("{e:#}"))
            }
            Err(e) => Err(e.to_string()),
        };
        match &written {
            Ok(n) => info!("wrote {} days of {} to {}/{}", n, symbol, spreadsheet, sheet),
            Err(msg) => {
                error!("error fetching OHLC for {}: {}", symbol, msg);
                let error_date = today.pred_opt().unwrap_or(today).format("%Y-%m-%d").to_string();
                let mut row = vec![error_date, format!("Error: {msg}")];
                row.resize(OHLC_HEADER.len(), String::new());
                if let Err(e) = sink.write(spreadsheet, &[row], Some(&subsheet), None) {
                    error!("could not record error for {}: {:#}", symbol, e);
                }
            }
        }
        out.push(HistoryResult {
            symbol: symbol.clone(),
            sheet,
            outcome: written,
        });
    }
    out
}

fn parse_sheet_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%d/%m/%Y"))
        .ok()
}

/// Reload a history sub-sheet. Rows that do not parse (headers, error rows)
/// are skipped.
pub fn load_history(sink: &dyn SheetSink, spreadsheet: &str, symbol: &str) -> Result<Series> {
    let sheet = history_sheet_name(symbol);
    let rows = sink.read(spreadsheet, Some(&SubSheet::Name(sheet.clone())))?;
    if let Some(header) = rows.first()
        && header.first().is_some_and(|h| h == "Date")
        && header.len() != OHLC_HEADER.len()
        && header.len() != PRICE_HEADER.len()
    {
        warn!("columns in '{}' do not match expected format: {:?}", sheet, OHLC_HEADER);
    }

    let mut series = Series::new();
    let mut skipped = 0usize;
    for row in &rows {
        let Some(date) = row.first().and_then(|c| parse_sheet_date(c)) else {
            skipped += 1;
            continue;
        };
        let nums: Option<Vec<f64>> = row[1..]
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| c.trim().parse::<f64>().ok())
            .collect();
        let bar = match nums.as_deref() {
            Some([open, high, low, close, volume, ..]) => Bar::Candle(OhlcRow {
                date,
                open: *open,
                high: *high,
                low: *low,
                close: *close,
                volume: *volume,
            }),
            Some([value]) => Bar::Price(PricePoint { date, value: *value }),
            _ => {
                skipped += 1;
                continue;
            }
        };
        series.insert(date, bar);
    }
    info!("retrieved {} price entries for {} ({} rows skipped)", series.len(), symbol, skipped);
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchSettings;
    use crate::error::FetchError;
    use crate::provider::Request;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct MapSource(BTreeMap<String, BTreeMap<NaiveDate, f64>>);

    #[async_trait]
    impl PriceSource for MapSource {
        async fn closes(&self, asset: &str) -> Option<BTreeMap<NaiveDate, f64>> {
            self.0.get(asset).cloned()
        }
    }

    struct NoSleep;

    #[async_trait]
    impl Clock for NoSleep {
        async fn sleep(&self, _duration: Duration) {}
    }

    /// Routes by symbol query parameter; unknown symbols get a 400-style error.
    struct ByPair {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for ByPair {
        async fn get_json(&self, request: &Request) -> Result<Value, FetchError> {
            let symbol = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "symbol")
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            self.seen.lock().unwrap().push(symbol.clone());
            match symbol.as_str() {
                "ETHUSDT" => Ok(json!([
                    [1_704_067_200_000i64, "100", "110", "90", "105", "2", 0],
                    [1_704_153_600_000i64, "105", "120", "100", "115", "1", 0]
                ])),
                _ => Err(FetchError::transient("HTTP 400 Bad Request; body: invalid symbol")),
            }
        }
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn prices(p: &[f64]) -> BTreeMap<NaiveDate, f64> {
        p.iter()
            .enumerate()
            .map(|(i, v)| (d("2024-01-01") + chrono::Duration::days(i as i64), *v))
            .collect()
    }

    fn updated() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 6)
            .unwrap()
            .and_hms_opt(7, 8, 9)
            .unwrap()
    }

    #[tokio::test]
    async fn one_bad_asset_does_not_stop_the_batch() {
        let mut m = BTreeMap::new();
        m.insert("bitcoin".to_string(), prices(&[100.0, 104.0, 101.0, 107.0, 105.0]));
        m.insert("aave".to_string(), prices(&[50.0, 53.0, 50.5, 55.0, 53.9]));
        m.insert("dead".to_string(), prices(&[1.0, 0.0, 2.0, 3.0, 2.5]));
        m.insert("late".to_string(), {
            let mut p = BTreeMap::new();
            p.insert(d("2025-01-01"), 1.0);
            p
        });
        let source = MapSource(m);
        let assets: Vec<String> = ["missing", "aave", "dead", "late"].iter().map(|s| s.to_string()).collect();

        let results = compute_betas(&source, "bitcoin", &assets, 2).await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].outcome, BetaOutcome::FetchFailed);
        assert!((results[1].beta().unwrap() - 1.483_796_130_489_752_2).abs() < 1e-12);
        assert_eq!(results[2].outcome, BetaOutcome::Undefined(RegressionError::NonFinite));
        assert_eq!(results[2].beta(), None);
        assert_eq!(results[3].outcome, BetaOutcome::NoOverlap);
    }

    #[tokio::test]
    async fn missing_benchmark_fails_every_asset() {
        let source = MapSource(BTreeMap::new());
        let results = compute_betas(&source, "bitcoin", &["aave".to_string()], 1).await;
        assert_eq!(results[0].outcome, BetaOutcome::FetchFailed);
    }

    #[test]
    fn beta_table_layout() {
        let results = vec![
            BetaResult {
                asset: "aave".into(),
                outcome: BetaOutcome::Beta(1.234_567),
            },
            BetaResult {
                asset: "flat".into(),
                outcome: BetaOutcome::Undefined(RegressionError::ZeroVariance),
            },
        ];
        let rows = beta_table(&results, "BTC", updated());
        assert_eq!(rows[0], vec!["Updated", "06-05-2024 07:08:09"]);
        assert_eq!(rows[1], vec!["Coin", "Beta/BTC "]);
        assert_eq!(rows[2], vec!["aave", "1.2346"]);
        assert_eq!(rows[3][1], "undefined: benchmark returns have zero variance");
    }

    #[tokio::test]
    async fn run_beta_reads_coins_and_writes_table() {
        let dir = TempDir::new().unwrap();
        let sink = crate::sheet::CsvWorkbook::new(dir.path());
        let cfg = Config::default();
        let coins: Vec<SheetRow> = [vec!["Coin"], vec!["aave"], vec![""], vec!["ghost"]]
            .iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect();
        sink.write(&cfg.spreadsheet, &coins, Some(&SubSheet::from("Coins")), None)
            .unwrap();

        let mut m = BTreeMap::new();
        m.insert("bitcoin".to_string(), prices(&[100.0, 104.0, 101.0, 107.0, 105.0]));
        m.insert("aave".to_string(), prices(&[50.0, 53.0, 50.5, 55.0, 53.9]));

        let results = run_beta(&cfg, &MapSource(m), &sink, updated()).await.unwrap();
        assert_eq!(results.len(), 2);

        let grid = sink
            .read(&cfg.spreadsheet, Some(&SubSheet::from("Beta Table")))
            .unwrap();
        assert_eq!(grid[3][5..], ["Updated".to_string(), "06-05-2024 07:08:09".to_string()]);
        assert_eq!(grid[5][5..], ["aave".to_string(), "1.4838".to_string()]);
        assert_eq!(grid[6][5..], ["ghost".to_string(), "fetch failed".to_string()]);
    }

    #[tokio::test]
    async fn history_round_trips_through_the_sheet() {
        let dir = TempDir::new().unwrap();
        let sink = crate::sheet::CsvWorkbook::new(dir.path());
        let fetcher = HistoricalFetcher::new(
            ByPair {
                seen: Mutex::new(vec![]),
            },
            NoSleep,
            FetchSettings {
                retries: 2,
                request_delay: Duration::ZERO,
                ..FetchSettings::default()
            },
        );
        let window = FetchWindow::trailing_days(2, Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap());
        let symbols = vec!["eth".to_string(), "nope".to_string()];

        let results = run_history(
            &fetcher,
            Provider::Binance,
            &symbols,
            &window,
            &sink,
            "hist",
            d("2024-01-03"),
        )
        .await;

        assert_eq!(results[0].outcome, Ok(2));
        assert_eq!(results[0].sheet, "ETHUSDT");
        assert!(results[1].outcome.is_err());

        let eth = sink.read("hist", Some(&SubSheet::from("ETHUSDT"))).unwrap();
        assert_eq!(eth[0], OHLC_HEADER.map(String::from).to_vec());
        assert_eq!(eth[1], vec!["2024-01-01", "100", "110", "90", "105", "210"]);

        let nope = sink.read("hist", Some(&SubSheet::from("NOPEUSDT"))).unwrap();
        assert_eq!(nope[0][0], "2024-01-02");
        assert!(nope[0][1].starts_with("Error: "));

        let series = load_history(&sink, "hist", "ETH").unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[&d("2024-01-02")].close(), 115.0);
        assert!(load_history(&sink, "hist", "NOPE").unwrap().is_empty());
    }

    #[test]
    fn load_history_accepts_day_first_dates_and_price_sheets() {
        let dir = TempDir::new().unwrap();
        let sink = crate::sheet::CsvWorkbook::new(dir.path());
        let rows: Vec<SheetRow> = [
            vec!["Date", "Price"],
            vec!["01/02/2024", "42.5"],
            vec!["2024-02-02", "43"],
        ]
        .iter()
        .map(|r| r.iter().map(|c| c.to_string()).collect())
        .collect();
        sink.write("h", &rows, Some(&SubSheet::from("BTCUSDT")), Some("A1:B3"))
            .unwrap();

        let series = load_history(&sink, "h", "btc").unwrap();
        assert_eq!(series[&d("2024-02-01")], Bar::Price(PricePoint { date: d("2024-02-01"), value: 42.5 }));
        assert_eq!(series.len(), 2);
    }

    #[tokio::test]
    async fn sheet_source_feeds_beta() {
        let dir = TempDir::new().unwrap();
        let sink = crate::sheet::CsvWorkbook::new(dir.path());
        let mut series = Series::new();
        for (i, p) in [100.0, 104.0, 101.0, 107.0, 105.0].iter().enumerate() {
            let date = d("2024-01-01") + chrono::Duration::days(i as i64);
            series.insert(date, Bar::Price(PricePoint { date, value: *p }));
        }
        sink.write("h", &history_table(&series), Some(&SubSheet::from("BTCUSDT")), Some("A1"))
            .unwrap();

        let source = SheetSource::new(&sink, "h");
        let results = compute_betas(&source, "BTC", &["BTC".to_string(), "XYZ".to_string()], 1).await;
        assert!((results[0].beta().unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(results[1].outcome, BetaOutcome::FetchFailed);
    }
}
