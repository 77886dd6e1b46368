use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::errors::{Error, Result};

/// Command line surface. A single optional positional argument selects the
/// config file; everything else lives in the config file itself.
#[derive(Debug, Default)]
pub struct Args {
    pub config: Option<PathBuf>,
}

impl Args {
    pub fn from_env() -> Result<Self> {
        Self::from_arg(std::env::args().nth(1))
    }

    /// Anything starting with `-` is a flag, and there are none; rejecting
    /// it here beats a misleading "config file could not be read" later.
    fn from_arg(arg: Option<String>) -> Result<Self> {
        match arg {
            Some(arg) if arg.starts_with('-') => Err(Error::Configuration(format!(
                "unexpected flag {arg:?}; usage: history-downloader [config.json]"
            ))),
            arg => Ok(Self {
                config: arg.map(PathBuf::from),
            }),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from("config.json"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSection {
    pub name: String,
    #[serde(default)]
    pub pair_whitelist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub exchange: ExchangeSection,
    pub data_dir: PathBuf,
    /// Explicit pairlist. `None` means "not configured"; an empty list is a
    /// deliberate (if useless) choice and is used as-is.
    #[serde(default)]
    pub pairs: Option<Vec<String>>,
    #[serde(default)]
    pub pairs_file: Option<PathBuf>,
    #[serde(default)]
    pub download_trades: bool,
    #[serde(default)]
    pub erase: bool,
    #[serde(default = "default_dataformat_trades")]
    pub dataformat_trades: String,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
    #[serde(default = "default_new_pairs_days")]
    pub new_pairs_days: i64,
}

fn default_dataformat_trades() -> String {
    "csv".to_string()
}

fn default_timeframes() -> Vec<String> {
    vec!["5m".to_string()]
}

fn default_new_pairs_days() -> i64 {
    30
}

impl Config {
    /// Loads the config file and resolves the pairlist in one go.
    pub fn load(args: &Args) -> Result<Self> {
        let path = args.config_path();
        let mut config: Config = load_json_file(&path)?;
        resolve_pairs_list(&mut config, args)?;
        Ok(config)
    }

    /// The resolved pairlist. Empty when no source matched, which the caller
    /// treats as "nothing to download".
    pub fn resolved_pairs(&self) -> &[String] {
        self.pairs.as_deref().unwrap_or(&[])
    }
}

/// Reads a JSON file, tolerating `//` and `/* */` comments plus trailing
/// commas, and wraps any failure with the offending path.
pub fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!(
            "config file {:?} could not be read: {e}. Please create a config file or check whether it exists.",
            path
        ))
    })?;
    let cleaned = strip_json_extensions(&raw);
    serde_json::from_str(&cleaned)
        .map_err(|e| Error::Configuration(format!("{:?}: {e}", path)))
}

/// Strips comments and trailing commas so the result is plain JSON. String
/// literals are left untouched.
fn strip_json_extensions(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_string = false;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b);
            if b == b'\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
                i += 2;
                continue;
            }
            if b == b'"' {
                in_string = false;
            }
            i += 1;
        } else if b == b'"' {
            in_string = true;
            out.push(b);
            i += 1;
        } else if b == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if b == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
        } else if b == b',' {
            // drop the comma if the next significant character closes a
            // container (a trailing comma)
            let mut j = i + 1;
            while j < bytes.len() {
                match bytes[j] {
                    b' ' | b'\t' | b'\r' | b'\n' => j += 1,
                    b'/' if j + 1 < bytes.len() && bytes[j + 1] == b'/' => {
                        while j < bytes.len() && bytes[j] != b'\n' {
                            j += 1;
                        }
                    }
                    b'/' if j + 1 < bytes.len() && bytes[j + 1] == b'*' => {
                        j += 2;
                        while j + 1 < bytes.len() && !(bytes[j] == b'*' && bytes[j + 1] == b'/') {
                            j += 1;
                        }
                        j = (j + 2).min(bytes.len());
                    }
                    _ => break,
                }
            }
            if j < bytes.len() && (bytes[j] == b'}' || bytes[j] == b']') {
                i += 1;
            } else {
                out.push(b);
                i += 1;
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
    String::from_utf8(out).unwrap_or_else(|_| input.to_string())
}

/// Picks the effective pairlist, first match wins, no merging:
/// 1. `pairs` already set in the config: used unchanged.
/// 2. `pairs_file`: must exist, loaded and sorted.
/// 3. config file explicitly supplied: the exchange pair whitelist, verbatim.
/// 4. `<data_dir>/pairs.json` if present, loaded and sorted; otherwise the
///    pairlist stays empty, which is a normal "nothing to download" outcome.
fn resolve_pairs_list(config: &mut Config, args: &Args) -> Result<()> {
    if config.pairs.is_some() {
        info!("Using explicit pairs from configuration.");
        return Ok(());
    }

    if let Some(pairs_file) = config.pairs_file.clone().filter(|p| !p.as_os_str().is_empty()) {
        info!("Reading pairs file {:?}.", pairs_file);
        if !pairs_file.exists() {
            return Err(Error::Configuration(format!(
                "no pairs file found with path {:?}",
                pairs_file
            )));
        }
        let mut pairs: Vec<String> = load_json_file(&pairs_file)?;
        pairs.sort();
        config.pairs = Some(pairs);
        return Ok(());
    }

    if args.config.is_some() {
        info!("Using pairlist from configuration.");
        config.pairs = Some(config.exchange.pair_whitelist.clone());
        return Ok(());
    }

    // last resort: the on-disk pairs cache
    let cache = config.data_dir.join("pairs.json");
    if cache.exists() {
        info!("Using pairs from {:?}.", cache);
        let mut pairs: Vec<String> = load_json_file(&cache)?;
        pairs.sort();
        config.pairs = Some(pairs);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn base_config(data_dir: &Path) -> Config {
        Config {
            exchange: ExchangeSection {
                name: "binance".to_string(),
                pair_whitelist: vec!["XRP/USDT".to_string(), "ADA/USDT".to_string()],
            },
            data_dir: data_dir.to_path_buf(),
            pairs: None,
            pairs_file: None,
            download_trades: false,
            erase: false,
            dataformat_trades: "csv".to_string(),
            timeframes: vec!["5m".to_string()],
            new_pairs_days: 30,
        }
    }

    #[test]
    fn explicit_pairs_win_and_stay_unsorted() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.pairs = Some(vec!["ETH/BTC".to_string(), "BTC/USDT".to_string()]);
        resolve_pairs_list(&mut config, &Args::default()).unwrap();
        assert_eq!(
            config.resolved_pairs(),
            ["ETH/BTC".to_string(), "BTC/USDT".to_string()]
        );
    }

    #[test]
    fn explicit_empty_pairs_are_respected() {
        let dir = tempdir().unwrap();
        let pairs_file = dir.path().join("pairs.json");
        std::fs::write(&pairs_file, r#"["ETH/BTC"]"#).unwrap();

        let mut config = base_config(dir.path());
        config.pairs = Some(Vec::new());
        config.pairs_file = Some(pairs_file);
        resolve_pairs_list(&mut config, &Args::default()).unwrap();
        // the empty list is present, so the pairs file must not be consulted
        assert!(config.resolved_pairs().is_empty());
    }

    #[test]
    fn pairs_file_is_loaded_and_sorted() {
        let dir = tempdir().unwrap();
        let pairs_file = dir.path().join("mypairs.json");
        std::fs::write(&pairs_file, r#"["ETH/BTC", "BTC/USDT"]"#).unwrap();

        let mut config = base_config(dir.path());
        config.pairs_file = Some(pairs_file);
        resolve_pairs_list(&mut config, &Args::default()).unwrap();
        assert_eq!(
            config.resolved_pairs(),
            ["BTC/USDT".to_string(), "ETH/BTC".to_string()]
        );
    }

    #[test]
    fn missing_pairs_file_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.pairs_file = Some(dir.path().join("nope.json"));
        match resolve_pairs_list(&mut config, &Args::default()) {
            Err(Error::Configuration(msg)) => assert!(msg.contains("pairs file")),
            other => panic!("expected Configuration error, got {other:?}"),
        }
    }

    #[test]
    fn explicit_config_uses_the_exchange_whitelist_unsorted() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path());
        let args = Args {
            config: Some(PathBuf::from("config.json")),
        };
        resolve_pairs_list(&mut config, &args).unwrap();
        assert_eq!(
            config.resolved_pairs(),
            ["XRP/USDT".to_string(), "ADA/USDT".to_string()]
        );
    }

    #[test]
    fn falls_back_to_pairs_cache_in_data_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("pairs.json"),
            r#"["LTC/USDT", "BTC/USDT"]"#,
        )
        .unwrap();
        let mut config = base_config(dir.path());
        resolve_pairs_list(&mut config, &Args::default()).unwrap();
        assert_eq!(
            config.resolved_pairs(),
            ["BTC/USDT".to_string(), "LTC/USDT".to_string()]
        );
    }

    #[test]
    fn no_source_at_all_leaves_the_pairlist_empty() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path());
        resolve_pairs_list(&mut config, &Args::default()).unwrap();
        assert!(config.pairs.is_none());
        assert!(config.resolved_pairs().is_empty());
    }

    #[test]
    fn loader_tolerates_comments_and_trailing_commas() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // exchange section
                "exchange": {
                    "name": "binance",
                    "pair_whitelist": ["BTC/USDT", /* inline */ "ETH/USDT",],
                },
                "data_dir": "data",
                "download_trades": true,
            }"#,
        )
        .unwrap();
        let config: Config = load_json_file(&path).unwrap();
        assert_eq!(config.exchange.name, "binance");
        assert_eq!(
            config.exchange.pair_whitelist,
            ["BTC/USDT".to_string(), "ETH/USDT".to_string()]
        );
        assert!(config.download_trades);
    }

    #[test]
    fn loader_leaves_slashes_inside_strings_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairs.json");
        std::fs::write(&path, r#"["BTC/USDT"]"#).unwrap();
        let pairs: Vec<String> = load_json_file(&path).unwrap();
        assert_eq!(pairs, ["BTC/USDT".to_string()]);
    }

    #[test]
    fn flag_like_arguments_are_rejected_up_front() {
        match Args::from_arg(Some("--help".to_string())) {
            Err(Error::Configuration(msg)) => assert!(msg.contains("--help")),
            other => panic!("expected Configuration error, got {other:?}"),
        }

        let args = Args::from_arg(Some("myconfig.json".to_string())).unwrap();
        assert_eq!(args.config_path(), PathBuf::from("myconfig.json"));
        let args = Args::from_arg(None).unwrap();
        assert_eq!(args.config_path(), PathBuf::from("config.json"));
    }

    #[test]
    fn missing_config_file_is_a_configuration_error() {
        let args = Args {
            config: Some(PathBuf::from("/definitely/not/here.json")),
        };
        match Config::load(&args) {
            Err(Error::Configuration(msg)) => assert!(msg.contains("not/here.json")),
            other => panic!("expected Configuration error, got {other:?}"),
        }
    }
}
