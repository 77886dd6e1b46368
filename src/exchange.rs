use std::collections::HashMap;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::data_handler::{OhlcvRecord, TradeRecord};
use crate::errors::Error;

pub const SUPPORTED_EXCHANGES: [&str; 1] = ["binance"];

const BINANCE_BASE_URL: &str = "https://api.binance.com";
const FETCH_LIMIT: usize = 1000;

/// Market metadata for one tradable pair.
#[derive(Debug, Clone)]
pub struct Market {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub active: bool,
}

/// Closed set of supported exchanges behind one capability surface. The
/// configured exchange name maps to a variant at startup.
pub enum Exchange {
    Binance(Binance),
}

impl Exchange {
    pub fn new(name: &str) -> std::result::Result<Self, Error> {
        match name.to_lowercase().as_str() {
            "binance" => Ok(Self::Binance(Binance::new())),
            other => Err(Error::Configuration(format!(
                "exchange {other:?} is not supported, expected one of {SUPPORTED_EXCHANGES:?}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Binance(_) => "binance",
        }
    }

    pub async fn load_markets(&mut self) -> Result<()> {
        match self {
            Self::Binance(b) => b.load_markets().await,
        }
    }

    /// Known pairs, keyed `BASE/QUOTE`.
    pub fn markets(&self) -> &HashMap<String, Market> {
        match self {
            Self::Binance(b) => &b.markets,
        }
    }

    /// All pairs must be known to the exchange; reports every offender.
    pub fn validate_pairs(&self, pairs: &[String]) -> std::result::Result<(), Error> {
        let markets = self.markets();
        let unknown: Vec<String> = pairs
            .iter()
            .filter(|p| !markets.contains_key(*p))
            .cloned()
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::UnknownPairs(unknown))
        }
    }

    pub async fn fetch_ohlcv_since(
        &self,
        pair: &str,
        timeframe: &str,
        since_ms: i64,
    ) -> Result<Vec<OhlcvRecord>> {
        match self {
            Self::Binance(b) => b.fetch_ohlcv_since(pair, timeframe, since_ms).await,
        }
    }

    pub async fn fetch_trades_since(&self, pair: &str, since_ms: i64) -> Result<Vec<TradeRecord>> {
        match self {
            Self::Binance(b) => b.fetch_trades_since(pair, since_ms).await,
        }
    }
}

#[cfg(test)]
impl Exchange {
    /// Binance-backed exchange with a fixed market map, no network involved.
    pub(crate) fn with_markets(pairs: &[&str]) -> Self {
        let mut binance = Binance::new();
        binance.markets = pairs
            .iter()
            .map(|p| {
                let (base, quote) = p.split_once('/').unwrap();
                (
                    p.to_string(),
                    Market {
                        symbol: Binance::to_symbol(p),
                        base: base.to_string(),
                        quote: quote.to_string(),
                        active: true,
                    },
                )
            })
            .collect();
        Self::Binance(binance)
    }
}

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
struct SymbolInfo {
    symbol: String,
    status: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
}

#[derive(Deserialize)]
struct AggTrade {
    #[serde(rename = "a")]
    id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    qty: String,
    #[serde(rename = "T")]
    time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

pub struct Binance {
    client: Client,
    markets: HashMap<String, Market>,
}

impl Binance {
    fn new() -> Self {
        Self {
            client: Client::new(),
            markets: HashMap::new(),
        }
    }

    fn to_symbol(pair: &str) -> String {
        pair.replace('/', "")
    }

    async fn load_markets(&mut self) -> Result<()> {
        let info: ExchangeInfo = self
            .client
            .get(format!("{BINANCE_BASE_URL}/api/v3/exchangeInfo"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("could not parse exchange info")?;

        self.markets = info
            .symbols
            .into_iter()
            .map(|s| {
                let pair = format!("{}/{}", s.base_asset, s.quote_asset);
                let market = Market {
                    symbol: s.symbol,
                    base: s.base_asset,
                    quote: s.quote_asset,
                    active: s.status == "TRADING",
                };
                (pair, market)
            })
            .collect();
        debug!("Loaded {} markets", self.markets.len());
        Ok(())
    }

    async fn fetch_ohlcv_since(
        &self,
        pair: &str,
        timeframe: &str,
        since_ms: i64,
    ) -> Result<Vec<OhlcvRecord>> {
        let symbol = Self::to_symbol(pair);
        let limit = FETCH_LIMIT.to_string();
        let mut candles = Vec::new();
        let mut start = since_ms;
        loop {
            let start_time = start.to_string();
            let rows: Vec<Vec<Value>> = self
                .client
                .get(format!("{BINANCE_BASE_URL}/api/v3/klines"))
                .query(&[
                    ("symbol", symbol.as_str()),
                    ("interval", timeframe),
                    ("limit", limit.as_str()),
                    ("startTime", start_time.as_str()),
                ])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
                .with_context(|| format!("could not parse klines for {pair}"))?;

            let page_len = rows.len();
            for row in &rows {
                candles.push(parse_kline(row)?);
            }
            if page_len < FETCH_LIMIT {
                break;
            }
            // resume after the newest candle of this page
            start = candles.last().map(|c| c.date + 1).unwrap_or(start);
        }
        Ok(candles)
    }

    async fn fetch_trades_since(&self, pair: &str, since_ms: i64) -> Result<Vec<TradeRecord>> {
        let symbol = Self::to_symbol(pair);
        let limit = FETCH_LIMIT.to_string();
        let mut trades = Vec::new();
        let mut start = since_ms;
        loop {
            let start_time = start.to_string();
            let page: Vec<AggTrade> = self
                .client
                .get(format!("{BINANCE_BASE_URL}/api/v3/aggTrades"))
                .query(&[
                    ("symbol", symbol.as_str()),
                    ("limit", limit.as_str()),
                    ("startTime", start_time.as_str()),
                ])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
                .with_context(|| format!("could not parse trades for {pair}"))?;

            let page_len = page.len();
            for raw in &page {
                trades.push(convert_agg_trade(raw)?);
            }
            if page_len < FETCH_LIMIT {
                break;
            }
            start = trades
                .last()
                .map(|t| t.timestamp.timestamp_millis() + 1)
                .unwrap_or(start);
        }
        Ok(trades)
    }
}

fn parse_kline(row: &[Value]) -> Result<OhlcvRecord> {
    if row.len() < 6 {
        anyhow::bail!("kline row has {} columns, expected at least 6", row.len());
    }
    let date = row[0]
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("kline open time is not an integer: {}", row[0]))?;
    let field = |i: usize| -> Result<f64> {
        match &row[i] {
            Value::String(s) => Ok(s.parse::<f64>()?),
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| anyhow::anyhow!("not representable as f64: {n}")),
            other => anyhow::bail!("unexpected kline field: {other}"),
        }
    };
    Ok(OhlcvRecord {
        date,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
    })
}

/// Reshapes a Binance aggregate trade into the canonical 7-column row and
/// runs it through `TradeRecord::from_row`, which owns the validation.
fn convert_agg_trade(raw: &AggTrade) -> Result<TradeRecord> {
    let price: f64 = raw.price.parse()?;
    let amount: f64 = raw.qty.parse()?;
    let side = if raw.buyer_is_maker { "sell" } else { "buy" };
    let row = vec![
        json!(raw.time),
        json!(raw.id.to_string()),
        Value::Null,
        json!(side),
        json!(price),
        json!(amount),
        json!(price * amount),
    ];
    TradeRecord::from_row(&row)
}
