use clap::Parser;
use dimdate::{
    DateDimensionJob, FsStore, JobConfig, ObjectStore, S3Config, S3Store, SimpleLogger,
    StorageLocation, UsFederalHolidays,
};
use log::debug;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

static LOGGER: SimpleLogger = SimpleLogger;

/// Where input and output objects live.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Backend {
    S3,
    /// Buckets are directories under --fs-root
    Fs,
}

/// Builds the date dimension table from rental transactions
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bucket holding the transaction parquet files
    #[arg(long, env = "DIMDATE_INPUT_BUCKET", default_value = "sakila-rds-customers")]
    input_bucket: String,

    /// Key prefix of the transaction parquet files
    #[arg(long, env = "DIMDATE_INPUT_PREFIX", default_value = "fact_rental/")]
    input_prefix: String,

    /// Bucket receiving dim_date.snappy.parquet
    #[arg(long, env = "DIMDATE_OUTPUT_BUCKET", default_value = "sakila-rds-customers")]
    output_bucket: String,

    /// Key prefix of the published table
    #[arg(long, env = "DIMDATE_OUTPUT_PREFIX", default_value = "dim_date/")]
    output_prefix: String,

    /// Transaction timestamp column
    #[arg(long, env = "DIMDATE_TIMESTAMP_COLUMN", default_value = "rental_date")]
    timestamp_column: String,

    #[arg(long, env = "DIMDATE_BACKEND", value_enum, default_value = "s3")]
    backend: Backend,

    /// Root directory for the fs backend
    #[arg(long, env = "DIMDATE_FS_ROOT", default_value = "./data")]
    fs_root: PathBuf,

    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Custom S3 endpoint (MinIO, LocalStack, ...)
    #[arg(long, env = "DIMDATE_S3_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, env = "DIMDATE_S3_FORCE_PATH_STYLE", default_value_t = false)]
    force_path_style: bool,

    /// Timeout in seconds for each object store call
    #[arg(long, env = "DIMDATE_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Maximum concurrent input downloads
    #[arg(long, env = "DIMDATE_FETCH_CONCURRENCY", default_value_t = 8)]
    fetch_concurrency: usize,

    /// Print the run summary as a single JSON line
    #[arg(long, env = "DIMDATE_JSON_SUMMARY", default_value_t = false)]
    json_summary: bool,

    /// Log level for output
    #[arg(long, env = "DIMDATE_DEBUG", default_value_t = false)]
    debug: bool,
}

async fn build_store(args: &Args) -> Result<Box<dyn ObjectStore>, dimdate::StoreError> {
    match args.backend {
        Backend::S3 => {
            let store = S3Store::new(S3Config {
                region: args.region.clone(),
                endpoint: args.endpoint.clone(),
                force_path_style: args.force_path_style,
            })
            .await?;
            Ok(Box::new(store))
        }
        Backend::Fs => Ok(Box::new(FsStore::new(&args.fs_root))),
    }
}

fn report_error(err: &dyn Error) {
    eprintln!("Error: {}", err);
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {}", cause);
        source = cause.source();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let total_start = Instant::now();
    // A missing .env file is fine; the environment may be set by the scheduler.
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        });
    }

    println!("dimdate: date dimension build");
    debug!("Arguments: {:?}", args);

    let config = JobConfig {
        input: StorageLocation::new(&args.input_bucket, &args.input_prefix),
        output: StorageLocation::new(&args.output_bucket, &args.output_prefix),
        timestamp_column: args.timestamp_column.clone(),
        timeout: Duration::from_secs(args.timeout_secs),
        fetch_concurrency: args.fetch_concurrency,
    };

    let store = match build_store(&args).await {
        Ok(store) => store,
        Err(err) => {
            report_error(&err);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, cancelling run...");
            on_signal.cancel();
        }
    });

    let job = DateDimensionJob::new(store.as_ref(), &UsFederalHolidays, config)
        .with_cancellation(cancel);

    match job.run().await {
        Ok(report) => {
            println!(
                "Built {} dates ({} holidays) from {} rows in {} files",
                report.dimension_rows, report.holidays, report.input_rows, report.input_files
            );
            println!(
                "Wrote s3://{}/{} ({} bytes)",
                report.output_bucket, report.output_key, report.output_bytes
            );
            if args.json_summary {
                match serde_json::to_string(&report) {
                    Ok(line) => println!("{}", line),
                    Err(err) => report_error(&err),
                }
            }
            println!("Pipeline completed successfully in {:.2?}", total_start.elapsed());
            ExitCode::SUCCESS
        }
        Err(failure) => {
            report_error(&failure);
            ExitCode::FAILURE
        }
    }
}
