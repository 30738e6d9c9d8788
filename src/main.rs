use anyhow::{Context, Result};
use clap::Parser;
use cocoon::data;
use cocoon::{load_from_data_frame, ApiConfig, HttpPlatformClient, LoadOptions, PropertyColumn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cocoon")]
#[command(about = "Load a CSV or parquet file into the platform", long_about = None)]
struct Cli {
    /// Entity type to load (instrument, portfolio, transaction, holding, quote, ...)
    #[arg(long)]
    file_type: String,

    /// Scope to load into
    #[arg(long)]
    scope: String,

    /// CSV or parquet file with one entity per row
    #[arg(long)]
    data: PathBuf,

    /// JSON mapping file
    #[arg(long)]
    mapping: PathBuf,

    /// JSON secrets file; the environment is used when absent
    #[arg(long)]
    secrets: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Concurrent platform calls
    #[arg(long, default_value_t = cocoon::dispatch::DEFAULT_WORKERS)]
    workers: usize,

    /// Look up missing instrument names on the platform
    #[arg(long, default_value_t = false)]
    enrich_names: bool,

    /// Adjust holdings instead of replacing them
    #[arg(long, default_value_t = false)]
    adjust_only: bool,

    /// Keep leading/trailing whitespace in mapped columns
    #[arg(long, default_value_t = false)]
    keep_white_space: bool,

    /// Give up on a single call after this many seconds
    #[arg(long)]
    call_timeout_secs: Option<u64>,
}

/// Contents of the `--mapping` file
#[derive(Debug, Default, Deserialize)]
struct MappingFile {
    #[serde(default)]
    required: Value,
    #[serde(default)]
    optional: Value,
    #[serde(default)]
    identifier_mapping: BTreeMap<String, String>,
    #[serde(default)]
    property_columns: Vec<PropertyColumn>,
    #[serde(default)]
    sub_holding_keys: Vec<PropertyColumn>,
    #[serde(default)]
    properties_scope: Option<String>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.secrets {
        Some(path) => ApiConfig::from_secrets_file(path)?,
        None => ApiConfig::from_env()?,
    };
    tracing::info!("Using platform API at {}", config.api_url);
    let api = Arc::new(HttpPlatformClient::new(&config)?);

    let text = std::fs::read_to_string(&cli.mapping)
        .with_context(|| format!("reading mapping file {:?}", cli.mapping))?;
    let mapping: MappingFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing mapping file {:?}", cli.mapping))?;

    let frame = data::load_frame(&cli.data)?;

    let options = LoadOptions {
        identifier_mapping: mapping.identifier_mapping,
        property_columns: mapping.property_columns,
        properties_scope: mapping.properties_scope,
        batch_size: cli.batch_size,
        remove_white_space: !cli.keep_white_space,
        instrument_name_enrichment: cli.enrich_names,
        sub_holding_keys: mapping.sub_holding_keys,
        holdings_adjustment_only: cli.adjust_only,
        workers: cli.workers,
        call_timeout: cli.call_timeout_secs.map(Duration::from_secs),
    };

    let result = load_from_data_frame(
        api,
        &cli.scope,
        frame,
        &mapping.required,
        &mapping.optional,
        &cli.file_type,
        options,
    )?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    let mut rejected = 0;
    for (entity, outcome) in &result {
        tracing::info!(
            "{}: {} batches succeeded, {} rejected, {} items failed inside successful batches",
            entity,
            outcome.success.len(),
            outcome.errors.len(),
            outcome.failed_items()
        );
        rejected += outcome.errors.len();
    }

    if rejected > 0 {
        anyhow::bail!("{} batches were rejected", rejected);
    }
    Ok(())
}
