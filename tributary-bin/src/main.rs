use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tributary_server_common::{init_logging, shutdown_signal};
use tributary_sink::{
    part_store_for, BucketId, BucketRouter, FileMetadata, LocalPipeline, PipelineOptions,
    SinkConfig,
};
use tributary_state::CheckpointStore;
use tributary_types::{Record, Schema, CHECKPOINT_URL_ENV, JOB_ID_ENV};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Writes newline-delimited JSON records into a partitioned table
    Run(RunArgs),

    /// Prints the writer index that owns a bucket
    Route {
        /// Bucket id, e.g. `date=2024-01-01/region=eu`
        #[arg(long)]
        bucket: String,

        #[arg(long, default_value_t = 1)]
        parallelism: usize,
    },

    /// Shows the latest completed checkpoint of a job
    Checkpoints {
        #[arg(long, env = JOB_ID_ENV, default_value = "tributary")]
        job_id: String,

        #[arg(long, env = CHECKPOINT_URL_ENV, default_value = "/tmp/tributary/checkpoints")]
        checkpoint_url: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Sink configuration as JSON
    #[arg(long)]
    config: PathBuf,

    /// Table schema as JSON, `{"fields": [{"name": .., "type": ..}]}`
    #[arg(long)]
    schema: PathBuf,

    /// Newline-delimited JSON records; `-` reads stdin
    #[arg(long, default_value = "-")]
    input: String,

    #[arg(long, default_value_t = 1)]
    parallelism: usize,

    /// Takes a checkpoint after this many records
    #[arg(long)]
    checkpoint_every: Option<usize>,

    #[arg(long, env = JOB_ID_ENV, default_value = "tributary")]
    job_id: String,

    #[arg(long, env = CHECKPOINT_URL_ENV, default_value = "/tmp/tributary/checkpoints")]
    checkpoint_url: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _guard = match init_logging("tributary") {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {:?}", e);
            exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Route {
            bucket,
            parallelism,
        } => route(&bucket, parallelism),
        Commands::Checkpoints {
            job_id,
            checkpoint_url,
        } => checkpoints(&job_id, &checkpoint_url).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        exit(1);
    }
}

fn read_json_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

async fn run(args: RunArgs) -> Result<()> {
    let config = SinkConfig::from_json(&read_json_file(&args.config)?)?;
    let schema: Schema = serde_json::from_str(&read_json_file(&args.schema)?)
        .with_context(|| format!("invalid schema in {}", args.schema.display()))?;
    if args.parallelism == 0 {
        bail!("parallelism must be at least 1");
    }

    let store = part_store_for(&config.path).await?;
    let checkpoints = CheckpointStore::for_url(&args.checkpoint_url, &args.job_id).await?;

    let mut options = PipelineOptions::new(&args.job_id, args.parallelism);
    options.checkpoint_every = args.checkpoint_every;

    let mut pipeline = LocalPipeline::start(options, config, &schema, checkpoints, store).await?;

    let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = if args.input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            File::open(&args.input)
                .await
                .with_context(|| format!("failed to open {}", args.input))?,
        )
    };
    let mut lines = BufReader::new(reader).lines();
    let mut shutdown = shutdown_signal().subscribe();

    let mut line_number = 0;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read input")?,
            _ = shutdown.recv() => {
                warn!("interrupted after {} lines; records since the last checkpoint are dropped", line_number);
                pipeline.abort().await?;
                return Ok(());
            }
        };
        let Some(line) = line else {
            break;
        };
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let value: serde_json::Value = serde_json::from_str(&line)
            .with_context(|| format!("line {} is not valid JSON", line_number))?;
        let record = Record::from_json(&schema, SystemTime::now(), &value)
            .with_context(|| format!("line {} does not match the schema", line_number))?;
        pipeline.send(record).await?;

        print_committed(&pipeline.take_committed())?;
    }

    print_committed(&pipeline.finish().await?)?;
    info!("read {} lines", line_number);
    Ok(())
}

fn print_committed(files: &[FileMetadata]) -> Result<()> {
    for file in files {
        println!("{}", serde_json::to_string(file)?);
    }
    Ok(())
}

fn route(bucket: &str, parallelism: usize) -> Result<()> {
    let router = BucketRouter::new(parallelism)?;
    println!("{}", router.route(&BucketId::new(bucket)));
    Ok(())
}

async fn checkpoints(job_id: &str, checkpoint_url: &str) -> Result<()> {
    let store = CheckpointStore::for_url(checkpoint_url, job_id).await?;
    match store.latest_metadata().await? {
        Some(metadata) => println!(
            "job {} operator {} checkpoint {} (parallelism {}) finished at {}",
            metadata.job_id,
            metadata.operator_id,
            metadata.epoch,
            metadata.parallelism,
            metadata.finish_time
        ),
        None => println!("job {} has no completed checkpoints", job_id),
    }
    Ok(())
}
