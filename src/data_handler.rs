use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::{Error, Result};

pub const OHLCV_COLUMNS: [&str; 6] = ["date", "open", "high", "low", "close", "volume"];
pub const TRADES_COLUMNS: [&str; 7] =
    ["timestamp", "trade_id", "null", "type", "price", "amount", "value"];

/// Hard cap on the backward tail scan. If no line terminator shows up within
/// this many bytes from the end of the file, the file is reported as corrupt
/// instead of scanning further.
const MAX_TAIL_LOOKBACK: u64 = 64 * 1024;

/// One candle. `date` is integer milliseconds since epoch, matching the
/// on-disk column format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvRecord {
    pub date: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One trade, column order fixed to the canonical trades column set.
/// `reserved` is the historical `null` column and is kept empty on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub trade_id: String,
    #[serde(rename = "null")]
    pub reserved: Option<String>,
    #[serde(rename = "type")]
    pub trade_type: String,
    pub price: f64,
    pub amount: f64,
    pub value: f64,
}

impl TradeRecord {
    /// Builds a record from a raw 7-element row as produced by the exchange
    /// layer: `[timestamp_ms, trade_id, null, type, price, amount, value]`.
    /// Rows with the wrong arity or unparseable fields are rejected here,
    /// before they can ever reach a data file.
    pub fn from_row(row: &[Value]) -> anyhow::Result<Self> {
        if row.len() != TRADES_COLUMNS.len() {
            anyhow::bail!(
                "trade row has {} columns, expected {}",
                row.len(),
                TRADES_COLUMNS.len()
            );
        }
        let ts_ms = row[0]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("trade timestamp is not an integer: {}", row[0]))?;
        let timestamp = DateTime::<Utc>::from_timestamp_millis(ts_ms)
            .ok_or_else(|| anyhow::anyhow!("trade timestamp out of range: {ts_ms}"))?;
        Ok(Self {
            timestamp,
            trade_id: value_as_string(&row[1]),
            reserved: None,
            trade_type: value_as_string(&row[3]),
            price: value_as_f64(&row[4])?,
            amount: value_as_f64(&row[5])?,
            value: value_as_f64(&row[6])?,
        })
    }
}

fn value_as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_as_f64(v: &Value) -> anyhow::Result<f64> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("not representable as f64: {n}")),
        Value::String(s) => Ok(s.parse::<f64>()?),
        other => anyhow::bail!("expected a number, got: {other}"),
    }
}

/// Append-only CSV storage, one file per (pair, kind) under `datadir`.
///
/// OHLCV files are named `<PAIR>-<timeframe>.csv`, trades files
/// `<PAIR>-trades.csv`, with `/` in the pair replaced by `_`.
///
/// The store does not check business ordering (monotonic timestamps); feeding
/// well-ordered data is the caller's contract, so the append path stays cheap.
pub struct CsvDataHandler {
    datadir: PathBuf,
}

impl CsvDataHandler {
    pub fn new(datadir: impl Into<PathBuf>) -> Result<Self> {
        let datadir = datadir.into();
        if !datadir.exists() {
            std::fs::create_dir_all(&datadir)?;
        }
        Ok(Self { datadir })
    }

    pub fn pair_to_filename(pair: &str) -> String {
        pair.replace('/', "_")
    }

    fn pair_data_filename(&self, pair: &str, timeframe: &str) -> PathBuf {
        self.datadir
            .join(format!("{}-{}.csv", Self::pair_to_filename(pair), timeframe))
    }

    fn pair_trades_filename(&self, pair: &str) -> PathBuf {
        self.datadir
            .join(format!("{}-trades.csv", Self::pair_to_filename(pair)))
    }

    /// Overwrites the full per-pair file with `data`. Used for OHLCV bulk
    /// writes; the driver merges old and new candles before calling this.
    pub fn ohlcv_store(&self, pair: &str, timeframe: &str, data: &[OhlcvRecord]) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(self.pair_data_filename(pair, timeframe))?;
        wtr.write_record(OHLCV_COLUMNS)?;
        for record in data {
            wtr.serialize(record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Loads all candles for a pair. A missing file yields an empty vec; an
    /// unreadable one is logged and also yields an empty vec, which makes the
    /// driver redownload from scratch.
    pub fn ohlcv_load(&self, pair: &str, timeframe: &str) -> Result<Vec<OhlcvRecord>> {
        let path = self.pair_data_filename(pair, timeframe);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rdr = csv::Reader::from_path(&path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize::<OhlcvRecord>() {
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("could not load data for {pair}: {e}");
                    return Ok(Vec::new());
                }
            }
        }
        Ok(records)
    }

    /// Appends trade records. Writes the header only when creating the file;
    /// a second call must never duplicate it. Zero records is a no-op.
    pub fn trades_append(&self, pair: &str, data: &[TradeRecord]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let path = self.pair_trades_filename(pair);
        let write_header = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if write_header {
            wtr.write_record(TRADES_COLUMNS)?;
        }
        for record in data {
            wtr.serialize(record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Returns the most recent trade for a pair without reading the whole
    /// file: the header is read once from the start, then the last line is
    /// located by scanning backward from the end of the file.
    ///
    /// Missing file and header-only file both yield `None`. An unparseable
    /// tail yields `Error::CorruptDataFile`; the caller is expected to treat
    /// that as "redownload this pair from scratch".
    pub fn last_trade(&self, pair: &str) -> Result<Option<TradeRecord>> {
        let path = self.pair_trades_filename(pair);
        if !path.exists() {
            return Ok(None);
        }
        let Some(header) = read_header_line(&path)? else {
            return Ok(None);
        };
        let Some(last_line) = read_last_line(&path)? else {
            return Ok(None);
        };
        if last_line == header {
            // header-only file, no data rows yet
            return Ok(None);
        }
        parse_trade_line(&path, &header, &last_line).map(Some)
    }

    pub fn ohlcv_purge(&self, pair: &str, timeframe: &str) -> Result<bool> {
        remove_if_exists(&self.pair_data_filename(pair, timeframe))
    }

    pub fn trades_purge(&self, pair: &str) -> Result<bool> {
        remove_if_exists(&self.pair_trades_filename(pair))
    }

    /// Lists pairs for which a trades or OHLCV file exists in `datadir`,
    /// recovered from the `<PAIR>-<suffix>.csv` naming convention.
    pub fn available_pairs(datadir: &Path) -> Result<Vec<String>> {
        let re = Regex::new(r"^([A-Za-z0-9_]+)-(?:trades|\d+[A-Za-z]+)\.csv(?:\.gz)?$").unwrap();
        let mut pairs = BTreeSet::new();
        for entry in std::fs::read_dir(datadir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(caps) = re.captures(name) {
                pairs.insert(caps[1].replace('_', "/"));
            }
        }
        Ok(pairs.into_iter().collect())
    }
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    if path.exists() {
        std::fs::remove_file(path)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// First line of the file, without the line terminator. `None` for an empty
/// file.
fn read_header_line(path: &Path) -> Result<Option<String>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Last complete line of the file, found by a bounded backward scan from the
/// end. Trailing line terminators are skipped first, so a file whose final
/// byte is exactly one `\n` resolves to its last data row, not to an empty
/// line. Returns `None` if the file holds no line at all.
fn read_last_line(path: &Path) -> Result<Option<String>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(None);
    }
    let lookback = len.min(MAX_TAIL_LOOKBACK);
    file.seek(SeekFrom::End(-(lookback as i64)))?;
    let mut buf = vec![0u8; lookback as usize];
    file.read_exact(&mut buf)?;

    let mut end = buf.len();
    while end > 0 && (buf[end - 1] == b'\n' || buf[end - 1] == b'\r') {
        end -= 1;
    }
    if end == 0 {
        if lookback == len {
            // the whole file is line terminators
            return Ok(None);
        }
        return Err(no_terminator(path));
    }
    let start = match buf[..end].iter().rposition(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        // no terminator in the window: only fine if the window covers the
        // whole file, i.e. this is the first and only line
        None if lookback == len => 0,
        None => return Err(no_terminator(path)),
    };
    let line = std::str::from_utf8(&buf[start..end])
        .map_err(|e| Error::CorruptDataFile {
            path: path.to_path_buf(),
            reason: format!("tail is not valid UTF-8: {e}"),
        })?
        .trim_end_matches('\r')
        .to_string();
    Ok(Some(line))
}

fn no_terminator(path: &Path) -> Error {
    Error::CorruptDataFile {
        path: path.to_path_buf(),
        reason: format!("no line terminator within the last {MAX_TAIL_LOOKBACK} bytes"),
    }
}

fn parse_trade_line(path: &Path, header: &str, line: &str) -> Result<TradeRecord> {
    let data = format!("{header}\n{line}\n");
    let mut rdr = csv::Reader::from_reader(data.as_bytes());
    match rdr.deserialize::<TradeRecord>().next() {
        Some(Ok(record)) => Ok(record),
        Some(Err(e)) => Err(Error::CorruptDataFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        None => Err(Error::CorruptDataFile {
            path: path.to_path_buf(),
            reason: "tail record is empty".to_string(),
        }),
    }
}
