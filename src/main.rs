use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use modis_pds::config::{parse_date, Config};
use modis_pds::convert::GdalTools;
use modis_pds::download::Downloader;
use modis_pds::fetch::GranuleFetcher;
use modis_pds::ingest::{DayOutcome, IngestOptions, Ingester};
use modis_pds::products::{ProductCatalog, DEFAULT_PRODUCT};
use modis_pds::publish::S3Publisher;
use modis_pds::search::CmrClient;
use modis_pds::transport::Transport;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "modis-pds")]
#[command(about = "Republish MODIS granules as single-band GeoTIFFs on S3")]
struct Args {
    /// First date to ingest
    #[arg(value_parser = parse_date)]
    start_date: NaiveDate,

    /// Day after the last date to ingest
    #[arg(value_parser = parse_date)]
    end_date: NaiveDate,

    /// Product key in the product table
    #[arg(short, long, default_value = DEFAULT_PRODUCT)]
    product: String,

    /// Reprocess dates that are already published
    #[arg(long)]
    overwrite: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    loglevel: String,

    /// Key prefix for everything written to the bucket
    #[arg(long, default_value = "")]
    prefix: String,

    /// Scratch directory for downloads and converted files
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// TOML file replacing the built-in product table
    #[arg(long)]
    products: Option<PathBuf>,

    /// Retries per HTTP request
    #[arg(long)]
    retries: Option<u32>,
}

fn init_tracing(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::new(format!(
        "{level},aws_config=warn,aws_smithy_runtime=warn,hyper=warn,reqwest=warn"
    ));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(&args.loglevel)?;

    let mut config = Config::from_env()?;
    config.prefix = args.prefix.trim_matches('/').to_string();
    if let Some(workdir) = args.workdir {
        config.workdir = workdir;
    }
    if let Some(retries) = args.retries {
        config.retry.max_retries = retries;
    }

    let catalog = match &args.products {
        Some(path) => ProductCatalog::read(path)
            .with_context(|| format!("reading product table {}", path.display()))?,
        None => ProductCatalog::builtin()?,
    };
    let credentials = config.credentials()?.clone();

    tokio::fs::create_dir_all(&config.workdir)
        .await
        .with_context(|| format!("creating {}", config.workdir.display()))?;

    let transport = Transport::new(config.retry)?;
    let search = CmrClient::new(transport.clone(), &config.cmr_url, &config.provider);
    let fetcher = GranuleFetcher::new(
        Downloader::new(transport, config.max_redirects),
        Some(credentials),
    );
    let publisher = S3Publisher::from_config(&config).await;

    let ingester = Ingester::new(
        search,
        GdalTools::new(config.gdal_bin.clone()),
        publisher,
        fetcher,
        catalog,
        IngestOptions {
            product: args.product.clone(),
            prefix: config.prefix.clone(),
            workdir: config.workdir.clone(),
            overwrite: args.overwrite,
        },
    )?;

    info!(
        product = %args.product,
        start = %args.start_date,
        end = %args.end_date,
        bucket = %config.bucket,
        "Starting ingest"
    );
    let report = ingester.run(args.start_date, args.end_date).await;

    let completed = report.count(|o| matches!(o, DayOutcome::Completed { .. }));
    let skipped = report.count(|o| matches!(o, DayOutcome::Skipped));
    let empty = report.count(|o| matches!(o, DayOutcome::Empty));
    info!(
        dates = report.days.len(),
        completed = completed,
        skipped = skipped,
        empty = empty,
        abandoned = report.abandoned(),
        "Ingest finished"
    );

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        for day in &report.days {
            if let DayOutcome::Abandoned { error } = &day.outcome {
                warn!(date = %day.date, error = %error, "Date was not published");
            }
        }
        Ok(ExitCode::FAILURE)
    }
}
