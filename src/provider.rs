use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;

use crate::config::ApiKeys;
use crate::error::FetchError;

const COINGECKO_BASE: &str = "https://api.coingecko.com/api/v3/coins";
const BINANCE_KLINES: &str = "https://data-api.binance.vision/api/v3/klines";
const COINBASE_PRODUCTS: &str = "https://api.exchange.coinbase.com/products";

/// Upstream price API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Provider {
    #[value(name = "coingecko")]
    CoinGecko,
    Binance,
    Coinbase,
}

/// Canonical column a positional payload field maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Time,
    Price,
    Open,
    High,
    Low,
    Close,
    Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Millis,
    Seconds,
}

/// What the provider's volume column is denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeUnit {
    /// Base asset units, converted with `volume * close`.
    Base,
    /// Already quote currency, passed through.
    Quote,
}

/// Declarative description of one provider's daily-history payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderSchema {
    pub provider: Provider,
    /// Positional layout of each row; trailing extra columns are ignored.
    pub fields: &'static [Field],
    pub time_unit: TimeUnit,
    pub volume: VolumeUnit,
    /// Object key holding the rows, `None` when the payload is the array itself.
    pub payload_field: Option<&'static str>,
    /// Max daily points per call. `None` means a single `days` request.
    pub max_points_per_call: Option<i64>,
    /// Whether an empty row array is a retryable failure.
    pub require_non_empty: bool,
}

const COINGECKO_FIELDS: &[Field] = &[Field::Time, Field::Price];
const BINANCE_FIELDS: &[Field] = &[
    Field::Time,
    Field::Open,
    Field::High,
    Field::Low,
    Field::Close,
    Field::Volume,
];
const COINBASE_FIELDS: &[Field] = &[
    Field::Time,
    Field::Low,
    Field::High,
    Field::Open,
    Field::Close,
    Field::Volume,
];

pub const BINANCE_MAX_LIMIT: i64 = 1000;
pub const COINBASE_MAX_LIMIT: i64 = 300;

impl Provider {
    pub fn schema(self) -> ProviderSchema {
        match self {
            Provider::CoinGecko => ProviderSchema {
                provider: self,
                fields: COINGECKO_FIELDS,
                time_unit: TimeUnit::Millis,
                volume: VolumeUnit::Quote,
                payload_field: Some("prices"),
                max_points_per_call: None,
                require_non_empty: true,
            },
            Provider::Binance => ProviderSchema {
                provider: self,
                fields: BINANCE_FIELDS,
                time_unit: TimeUnit::Millis,
                volume: VolumeUnit::Base,
                payload_field: None,
                max_points_per_call: Some(BINANCE_MAX_LIMIT),
                require_non_empty: false,
            },
            Provider::Coinbase => ProviderSchema {
                provider: self,
                fields: COINBASE_FIELDS,
                time_unit: TimeUnit::Seconds,
                volume: VolumeUnit::Quote,
                payload_field: None,
                max_points_per_call: Some(COINBASE_MAX_LIMIT),
                require_non_empty: false,
            },
        }
    }

    /// Trading pair as the provider names it (`SOL` -> `SOLUSDT` / `SOL-USD`).
    pub fn market_symbol(self, asset: &str) -> String {
        let upper = asset.trim().to_uppercase();
        match self {
            Provider::CoinGecko => asset.trim().to_string(),
            Provider::Binance if upper.ends_with("USDT") => upper,
            Provider::Binance => format!("{upper}USDT"),
            Provider::Coinbase if upper.ends_with("USD") => upper,
            Provider::Coinbase => format!("{upper}-USD"),
        }
    }
}

/// Sub-sheet a symbol's daily history lives in, e.g. `ETH`, `ETH-USD` -> `ETHUSDT`.
pub fn history_sheet_name(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    let base = upper
        .strip_suffix("USDT")
        .or_else(|| upper.strip_suffix("-USD"))
        .or_else(|| upper.strip_suffix("USD"))
        .unwrap_or(&upper);
    format!("{base}USDT")
}

/// Inclusive time span of one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// A ready-to-send GET.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
}

impl ProviderSchema {
    pub fn index_of(&self, field: Field) -> Option<usize> {
        self.fields.iter().position(|f| *f == field)
    }

    pub fn is_candle(&self) -> bool {
        self.index_of(Field::Price).is_none()
    }

    /// Build the request for one chunk. `days` is only used by providers
    /// without a per-call limit.
    pub fn request(
        &self,
        asset: &str,
        chunk: Chunk,
        days: u32,
        keys: &ApiKeys,
    ) -> Result<Request, FetchError> {
        let symbol = self.provider.market_symbol(asset);
        let mut headers = vec![("accept", "application/json".to_string())];
        let url = match self.provider {
            Provider::CoinGecko => {
                if let Some(key) = &keys.coingecko {
                    headers.push(("x-cg-demo-api-key", key.clone()));
                }
                Url::parse_with_params(
                    &format!("{COINGECKO_BASE}/{symbol}/market_chart"),
                    &[
                        ("days", days.to_string()),
                        ("vs_currency", "usd".to_string()),
                        ("interval", "daily".to_string()),
                    ],
                )
            }
            Provider::Binance => {
                if let Some(key) = &keys.binance {
                    headers.push(("X-MBX-APIKEY", key.clone()));
                }
                let limit = self.max_points_per_call.unwrap_or(BINANCE_MAX_LIMIT);
                Url::parse_with_params(
                    BINANCE_KLINES,
                    &[
                        ("symbol", symbol.clone()),
                        ("interval", "1d".to_string()),
                        ("limit", limit.to_string()),
                        ("startTime", chunk.start_ms.to_string()),
                        ("endTime", chunk.end_ms.to_string()),
                    ],
                )
            }
            Provider::Coinbase => Url::parse_with_params(
                &format!("{COINBASE_PRODUCTS}/{symbol}/candles"),
                &[
                    ("granularity", "86400".to_string()),
                    ("start", rfc3339_ms(chunk.start_ms)),
                    ("end", rfc3339_ms(chunk.end_ms)),
                ],
            ),
        }
        .map_err(|e| FetchError::InvalidRequest(format!("{symbol}: {e}")))?;
        Ok(Request { url, headers })
    }
}

fn rfc3339_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}
