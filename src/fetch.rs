use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use reqwest::Client;
use serde_json::Value;
use std::{future::Future, time::Duration};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, info, warn};

use crate::config::FetchSettings;
use crate::error::FetchError;
use crate::normalize::{Series, normalize, value_as_f64};
use crate::provider::{Chunk, Field, Provider, ProviderSchema, Request};

const DAY_MS: i64 = 86_400_000;

/// Sends one GET and returns the decoded JSON body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_json(&self, request: &Request) -> Result<Value, FetchError>;
}

/// Blocking waits between attempts; swapped out in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent("crypto_beta/0.1 (rust)")
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_json(&self, request: &Request) -> Result<Value, FetchError> {
        let mut builder = self.client.get(request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| FetchError::transient(format!("request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::transient(format!("HTTP {status}; body: {body}")));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| FetchError::transient(format!("invalid JSON: {e}")))
    }
}

/// Delays between attempts: 1s, 2s, 4s, ... (`2^attempt` seconds).
pub fn backoff_delays() -> ExponentialBackoff {
    ExponentialBackoff::from_millis(2).factor(500)
}

/// Run `op` up to `retries` times (at least once), sleeping `2^attempt`
/// seconds after each failed attempt except the last.
pub async fn with_retry<T, F, Fut>(
    retries: usize,
    clock: &dyn Clock,
    label: &str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempts = retries.max(1);
    let mut delays = backoff_delays();
    let mut last = String::new();
    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e @ FetchError::InvalidRequest(_)) => return Err(e),
            Err(e) => {
                warn!("{} (attempt {}/{}): {}", label, attempt + 1, attempts, e);
                last = e.to_string();
                if attempt + 1 < attempts
                    && let Some(delay) = delays.next()
                {
                    info!("retrying {} in {}s", label, delay.as_secs());
                    clock.sleep(delay).await;
                }
            }
        }
    }
    error!("max retries reached for {}; skipping", label);
    Err(FetchError::Exhausted { attempts, last })
}

/// Requested history span, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub days: u32,
}

impl FetchWindow {
    /// The last `days` UTC calendar days up to and including `now`'s day:
    /// starts at a midnight, ends at the last millisecond of `now`'s day.
    /// `days` below one is treated as one.
    pub fn trailing_days(days: u32, now: DateTime<Utc>) -> Self {
        let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let end = midnight + chrono::Duration::days(1) - chrono::Duration::milliseconds(1);
        let days = days.max(1);
        let start = midnight - chrono::Duration::days(i64::from(days) - 1);
        Self { start, end, days }
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

/// Split `[start_ms, end_ms]` into consecutive spans of at most `max_days` days.
pub fn chunk_window(start_ms: i64, end_ms: i64, max_days: i64) -> Vec<Chunk> {
    let span = max_days.max(1) * DAY_MS;
    let mut out = vec![];
    let mut cur = start_ms;
    while cur <= end_ms {
        out.push(Chunk {
            start_ms: cur,
            end_ms: (cur + span - 1).min(end_ms),
        });
        cur += span;
    }
    out
}

/// Provider rows as received, sorted ascending by timestamp.
#[derive(Debug, Clone)]
pub struct RawSeries {
    pub schema: ProviderSchema,
    pub rows: Vec<Vec<Value>>,
}

impl RawSeries {
    pub fn normalize(&self) -> Series {
        normalize(&self.rows, &self.schema)
    }
}

impl ProviderSchema {
    /// Pull the row array out of a response body.
    pub fn extract_rows(&self, payload: Value) -> Result<Vec<Vec<Value>>, FetchError> {
        let rows = match self.payload_field {
            Some(field) => match payload {
                Value::Object(mut map) => map.remove(field),
                _ => None,
            },
            None => Some(payload),
        };
        let Some(Value::Array(items)) = rows else {
            return Err(FetchError::transient(format!(
                "missing or non-array {} payload",
                self.payload_field.unwrap_or("row")
            )));
        };
        if items.is_empty() && self.require_non_empty {
            return Err(FetchError::transient("no price data returned"));
        }
        Ok(items
            .into_iter()
            .filter_map(|r| match r {
                Value::Array(a) => Some(a),
                _ => None,
            })
            .collect())
    }
}

/// Pulls raw daily history from one provider with chunking and retry.
pub struct HistoricalFetcher<T, C> {
    transport: T,
    clock: C,
    settings: FetchSettings,
}

impl<T: Transport, C: Clock> HistoricalFetcher<T, C> {
    pub fn new(transport: T, clock: C, settings: FetchSettings) -> Self {
        Self {
            transport,
            clock,
            settings,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Provider schema with the configured per-call limits applied.
    pub fn schema_for(&self, provider: Provider) -> ProviderSchema {
        let mut schema = provider.schema();
        match provider {
            Provider::Binance => schema.max_points_per_call = Some(self.settings.binance_max_limit),
            Provider::Coinbase => {
                schema.max_points_per_call = Some(self.settings.coinbase_max_limit)
            }
            Provider::CoinGecko => {}
        }
        schema
    }

    /// Fetch `asset` over `window`, concatenating all chunks.
    ///
    /// # Errors
    /// Returns `FetchError::Exhausted` as soon as any chunk runs out of retries;
    /// rows from earlier chunks are discarded.
    pub async fn fetch(
        &self,
        provider: Provider,
        asset: &str,
        window: &FetchWindow,
    ) -> Result<RawSeries, FetchError> {
        let schema = self.schema_for(provider);
        let chunks = match schema.max_points_per_call {
            Some(limit) => chunk_window(window.start_ms(), window.end_ms(), limit),
            None => vec![Chunk {
                start_ms: window.start_ms(),
                end_ms: window.end_ms(),
            }],
        };
        let total = chunks.len();
        let mut rows = vec![];

        for (i, chunk) in chunks.into_iter().enumerate() {
            let request = schema.request(asset, chunk, window.days, &self.settings.keys)?;
            debug!("fetching chunk {}/{} for {}: {}", i + 1, total, asset, request.url);
            let label = format!("{asset} chunk {}/{}", i + 1, total);
            let (transport, req, sch) = (&self.transport, &request, &schema);
            let mut batch = with_retry(self.settings.retries, &self.clock, &label, || async move {
                let payload = transport.get_json(req).await?;
                sch.extract_rows(payload)
            })
            .await?;
            rows.append(&mut batch);

            if i + 1 < total && !self.settings.request_delay.is_zero() {
                self.clock.sleep(self.settings.request_delay).await;
            }
        }

        if let Some(t) = schema.index_of(Field::Time) {
            let ts = |r: &Vec<Value>| r.get(t).and_then(value_as_f64).unwrap_or(f64::NAN);
            rows.sort_by(|a, b| ts(a).total_cmp(&ts(b)));
        }
        info!("{}: {} rows from {:?} in {} call(s)", asset, rows.len(), provider, total);
        Ok(RawSeries { schema, rows })
    }
}
