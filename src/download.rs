use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::data_handler::{CsvDataHandler, OhlcvRecord};
use crate::errors::Error;
use crate::exchange::Exchange;

/// Maps the configured trades data format to a handler. Only CSV is wired
/// up; anything else is a configuration mistake.
pub fn get_datahandler(config: &Config) -> std::result::Result<CsvDataHandler, Error> {
    match config.dataformat_trades.as_str() {
        "csv" => CsvDataHandler::new(&config.data_dir),
        other => Err(Error::Configuration(format!(
            "unsupported trades data format {other:?}, expected \"csv\""
        ))),
    }
}

fn default_since_ms(new_pairs_days: i64) -> i64 {
    (Utc::now() - Duration::days(new_pairs_days)).timestamp_millis()
}

/// Resume point for a pair's trades: one millisecond after the last stored
/// trade, or the `new_pairs_days` lookback when there is no stored data.
/// A corrupt trades file is purged here so the pair is redownloaded from
/// scratch.
fn trades_resume_point(
    handler: &CsvDataHandler,
    pair: &str,
    new_pairs_days: i64,
) -> Result<i64> {
    match handler.last_trade(pair) {
        Ok(Some(last)) => Ok(last.timestamp.timestamp_millis() + 1),
        Ok(None) => Ok(default_since_ms(new_pairs_days)),
        Err(Error::CorruptDataFile { path, reason }) => {
            warn!(
                "Trades file {path:?} is corrupt ({reason}), redownloading {pair} from scratch"
            );
            handler.trades_purge(pair)?;
            Ok(default_since_ms(new_pairs_days))
        }
        Err(e) => Err(e.into()),
    }
}

/// Incrementally downloads trades for each pair, resuming one millisecond
/// after the last stored trade. A corrupt trades file is not fatal: the file
/// is purged and the pair redownloaded from scratch.
///
/// Returns the pairs that were skipped because the exchange does not list
/// them.
pub async fn refresh_trades_data(
    exchange: &Exchange,
    pairs: &[String],
    handler: &CsvDataHandler,
    erase: bool,
    new_pairs_days: i64,
) -> Result<Vec<String>> {
    let mut pairs_not_available = Vec::new();
    for pair in pairs {
        if !exchange.markets().contains_key(pair) {
            warn!(
                "Skipping pair {pair}: not available on {}",
                exchange.name()
            );
            pairs_not_available.push(pair.clone());
            continue;
        }
        if erase && handler.trades_purge(pair)? {
            info!("Deleting existing trades data for pair {pair}");
        }
        let since_ms = trades_resume_point(handler, pair, new_pairs_days)?;

        info!("Downloading trades for pair {pair} since {since_ms}");
        let trades = exchange.fetch_trades_since(pair, since_ms).await?;
        info!("Downloaded {} new trades for pair {pair}", trades.len());
        handler.trades_append(pair, &trades)?;
    }
    Ok(pairs_not_available)
}

/// Incrementally downloads candles per pair and timeframe. New candles are
/// merged with the stored ones (newer wins on equal date) and the file is
/// rewritten in full, keeping the non-decreasing timestamp invariant.
pub async fn refresh_ohlcv_data(
    exchange: &Exchange,
    pairs: &[String],
    timeframes: &[String],
    handler: &CsvDataHandler,
    erase: bool,
    new_pairs_days: i64,
) -> Result<Vec<String>> {
    let mut pairs_not_available = Vec::new();
    for pair in pairs {
        if !exchange.markets().contains_key(pair) {
            warn!(
                "Skipping pair {pair}: not available on {}",
                exchange.name()
            );
            pairs_not_available.push(pair.clone());
            continue;
        }
        for timeframe in timeframes {
            if erase && handler.ohlcv_purge(pair, timeframe)? {
                info!("Deleting existing data for pair {pair}, interval {timeframe}");
            }
            let existing = handler.ohlcv_load(pair, timeframe)?;
            let since_ms = existing
                .last()
                .map(|c| c.date + 1)
                .unwrap_or_else(|| default_since_ms(new_pairs_days));

            info!("Downloading pair {pair}, interval {timeframe} since {since_ms}");
            let new_candles = exchange.fetch_ohlcv_since(pair, timeframe, since_ms).await?;
            info!(
                "Downloaded {} new candles for pair {pair}, interval {timeframe}",
                new_candles.len()
            );
            let merged = merge_ohlcv(existing, new_candles);
            handler.ohlcv_store(pair, timeframe, &merged)?;
        }
    }
    Ok(pairs_not_available)
}

fn merge_ohlcv(existing: Vec<OhlcvRecord>, new: Vec<OhlcvRecord>) -> Vec<OhlcvRecord> {
    let mut by_date: BTreeMap<i64, OhlcvRecord> = BTreeMap::new();
    for candle in existing.into_iter().chain(new) {
        by_date.insert(candle.date, candle);
    }
    by_date.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_handler::TradeRecord;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn candle(date: i64, close: f64) -> OhlcvRecord {
        OhlcvRecord {
            date,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    fn trade(ts_ms: i64, id: &str) -> TradeRecord {
        TradeRecord {
            timestamp: Utc.timestamp_millis_opt(ts_ms).unwrap(),
            trade_id: id.to_string(),
            reserved: None,
            trade_type: "buy".to_string(),
            price: 100.0,
            amount: 1.0,
            value: 100.0,
        }
    }

    #[test]
    fn resume_point_is_one_ms_after_the_last_stored_trade() {
        let dir = tempdir().unwrap();
        let handler = CsvDataHandler::new(dir.path()).unwrap();
        handler
            .trades_append("BTC/USDT", &[trade(1000, "1"), trade(3000, "2")])
            .unwrap();

        let since = trades_resume_point(&handler, "BTC/USDT", 30).unwrap();
        assert_eq!(since, 3001);
    }

    #[test]
    fn resume_point_for_a_fresh_pair_uses_the_default_lookback() {
        let dir = tempdir().unwrap();
        let handler = CsvDataHandler::new(dir.path()).unwrap();

        let floor = default_since_ms(30);
        let since = trades_resume_point(&handler, "BTC/USDT", 30).unwrap();
        let ceil = default_since_ms(30);
        assert!(since >= floor && since <= ceil);
    }

    #[test]
    fn corrupt_trades_file_is_purged_and_resume_falls_back_to_lookback() {
        let dir = tempdir().unwrap();
        let handler = CsvDataHandler::new(dir.path()).unwrap();
        let path = dir.path().join("BTC_USDT-trades.csv");
        std::fs::write(
            &path,
            "timestamp,trade_id,null,type,price,amount,value\n\
             this-is-not-a-trade\n",
        )
        .unwrap();

        let floor = default_since_ms(30);
        let since = trades_resume_point(&handler, "BTC/USDT", 30).unwrap();
        let ceil = default_since_ms(30);

        assert!(!path.exists());
        assert!(since >= floor && since <= ceil);
    }

    #[tokio::test]
    async fn unlisted_pairs_are_skipped_and_collected() {
        let dir = tempdir().unwrap();
        let handler = CsvDataHandler::new(dir.path()).unwrap();
        let exchange = Exchange::with_markets(&["BTC/USDT"]);

        // none of the requested pairs are listed, so no fetch happens
        let pairs = vec!["DOGE/USDT".to_string(), "PEPE/USDT".to_string()];
        let not_available = refresh_trades_data(&exchange, &pairs, &handler, false, 30)
            .await
            .unwrap();

        assert_eq!(not_available, pairs);
        assert!(!dir.path().join("DOGE_USDT-trades.csv").exists());
        assert!(!dir.path().join("PEPE_USDT-trades.csv").exists());
    }

    #[test]
    fn merge_keeps_order_and_prefers_new_candles() {
        let existing = vec![candle(1000, 1.0), candle(2000, 2.0)];
        let new = vec![candle(2000, 2.5), candle(3000, 3.0)];
        let merged = merge_ohlcv(existing, new);
        let dates: Vec<i64> = merged.iter().map(|c| c.date).collect();
        assert_eq!(dates, [1000, 2000, 3000]);
        assert_eq!(merged[1].close, 2.5);
    }

    #[test]
    fn datahandler_selection_rejects_unknown_formats() {
        let dir = tempdir().unwrap();
        let mut config = crate::config::Config {
            exchange: crate::config::ExchangeSection {
                name: "binance".to_string(),
                pair_whitelist: Vec::new(),
            },
            data_dir: dir.path().to_path_buf(),
            pairs: None,
            pairs_file: None,
            download_trades: true,
            erase: false,
            dataformat_trades: "csv".to_string(),
            timeframes: vec!["5m".to_string()],
            new_pairs_days: 30,
        };
        assert!(get_datahandler(&config).is_ok());
        config.dataformat_trades = "hdf5".to_string();
        match get_datahandler(&config) {
            Err(Error::Configuration(msg)) => assert!(msg.contains("hdf5")),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected Configuration error"),
        }
    }
}
