use std::path::PathBuf;

/// Error taxonomy for the downloader.
///
/// `Configuration` and `UnknownPairs` are fatal for the invocation and are
/// reported to the operator. `CorruptDataFile` is recoverable: the download
/// driver reacts by purging the file and redownloading the pair from scratch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing config file, missing pairs file, malformed JSON, unknown
    /// exchange name or data format.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The tail of a data file could not be parsed. Carries the file path
    /// and the underlying reason so the operator can inspect the file.
    #[error("corrupt data file {path:?}: {reason}")]
    CorruptDataFile { path: PathBuf, reason: String },

    /// One or more pairs are not present in the exchange markets.
    #[error("pairs not available on exchange: {0:?}")]
    UnknownPairs(Vec<String>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
