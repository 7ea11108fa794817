//! Forecast Pass Binary
//!
//! Runs one forecasting pass over a JSON array of transactions (company and
//! region scopes) and prints the response as JSON.
//!
//! Usage:
//!   forecast_pass transactions.json --config engine.toml --registry models.json
//!
//! Environment:
//!   FORECAST_TOP_N - Entities per scope in the timeline (default: from config)
//!   FORECAST_HORIZON - Months to forecast (default: from config)
//!   RUST_LOG - Log filter, logs go to stderr

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::Parser;
use forecast_engine::{
    EngineConfig, ForecastEngine, ForecastError, ForecastRequest, ModelRecord, ModelRegistry,
    Result, Transaction,
};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "forecast_pass")]
#[command(about = "Quality-gated, tiered monthly volume forecast")]
struct Args {
    /// JSON array of transactions
    input: PathBuf,

    /// Engine configuration (TOML)
    #[arg(long, env = "FORECAST_CONFIG")]
    config: Option<PathBuf>,

    /// Model registry snapshot, read before and written after the pass
    #[arg(long, env = "FORECAST_REGISTRY")]
    registry: Option<PathBuf>,

    #[arg(long, env = "FORECAST_TOP_N")]
    top_n: Option<usize>,

    #[arg(long, env = "FORECAST_HORIZON")]
    horizon: Option<usize>,

    /// Retrain every entity even when its data is unchanged
    #[arg(long)]
    force_retrain: bool,

    /// Anchor date (YYYY-MM-DD); the forecast starts at its month
    #[arg(long)]
    as_of: Option<NaiveDate>,

    /// Pretty-print the response
    #[arg(long)]
    pretty: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(Level::INFO.as_str())),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let top_n = args.top_n.unwrap_or(config.default_top_n);
    let horizon = args.horizon.unwrap_or(config.default_horizon);

    let transactions: Vec<Transaction> =
        serde_json::from_reader(BufReader::new(File::open(&args.input)?))?;
    info!(
        transactions = transactions.len(),
        top_n, horizon, "starting forecast pass"
    );

    let registry = match &args.registry {
        Some(path) if path.exists() => {
            let records: Vec<ModelRecord> =
                serde_json::from_reader(BufReader::new(File::open(path)?))?;
            info!(models = records.len(), path = %path.display(), "registry restored");
            Arc::new(ModelRegistry::from_records(records))
        }
        _ => Arc::new(ModelRegistry::new()),
    };

    let engine = ForecastEngine::new(config)?.with_registry(Arc::clone(&registry));

    let mut request = ForecastRequest::from_transactions(&transactions, top_n, horizon)
        .with_force_retrain(args.force_retrain);
    if let Some(as_of) = args.as_of {
        request = request.with_as_of(as_of);
    }

    let response = engine.run(&request)?;

    if let Some(path) = &args.registry {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, &registry.snapshot())?;
        writer.flush()?;
        info!(models = registry.len(), path = %path.display(), "registry saved");
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if args.pretty {
        serde_json::to_writer_pretty(&mut out, &response)?;
    } else {
        serde_json::to_writer(&mut out, &response)?;
    }
    writeln!(out).map_err(ForecastError::from)?;

    Ok(())
}
