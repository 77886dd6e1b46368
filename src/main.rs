mod config;
mod data_handler;
mod download;
mod errors;
mod exchange;

use config::{Args, Config};
use exchange::Exchange;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::from_env()?;

    // Step 1: Load Configuration
    println!("\n--- Step 1: Loading Configuration ---");
    let config = Config::load(&args)?;

    // Step 2: Connect to Exchange
    println!("\n--- Step 2: Loading Exchange Markets ---");
    let mut exchange = Exchange::new(&config.exchange.name)?;
    exchange.load_markets().await?;
    exchange.validate_pairs(config.resolved_pairs())?;

    let pairs = config.resolved_pairs().to_vec();
    if pairs.is_empty() {
        println!("No pairs resolved, nothing to download.");
        return Ok(());
    }
    println!(
        "About to download pairs: {:?}, to {:?}",
        pairs, config.data_dir
    );

    // Step 3: Download Data
    println!("\n--- Step 3: Downloading Data ---");
    let handler = download::get_datahandler(&config)?;
    let pairs_not_available = if config.download_trades {
        download::refresh_trades_data(
            &exchange,
            &pairs,
            &handler,
            config.erase,
            config.new_pairs_days,
        )
        .await?
    } else {
        download::refresh_ohlcv_data(
            &exchange,
            &pairs,
            &config.timeframes,
            &handler,
            config.erase,
            config.new_pairs_days,
        )
        .await?
    };

    if !pairs_not_available.is_empty() {
        eprintln!(
            "Pairs [{}] not available on {}.",
            pairs_not_available.join(", "),
            config.exchange.name
        );
    }

    Ok(())
}
