//! Customer Pipeline CLI
//!
//! Ingest, deduplicate, enrich and route customer records into per-country tables.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use customer_pipeline::io::{create_object_store, create_table_store, RunLock};
use customer_pipeline::record::sample_records;
use customer_pipeline::{
    build_runtime, init_rayon, run_pipeline, CancellationFlag, Catalog, Config, RawCustomerRecord, StagePlan,
    TableStore,
};

#[derive(Parser)]
#[command(name = "customer-pipeline")]
#[command(about = "Route the latest customer records into per-country tables", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override partition write concurrency
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over a batch of records
    Run {
        /// Input records: JSON array (.json), JSON Lines (.jsonl, .ndjson) or YAML (.yaml, .yml)
        #[arg(short, long)]
        input: PathBuf,

        /// Processing date override (YYYY-MM-DD)
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },

    /// Print the stage plan for the configured countries
    Plan,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Generate a sample input batch
    GenerateSample {
        /// Output path for the records
        #[arg(short, long, default_value = "customers.json")]
        output: PathBuf,
    },

    /// Print the rows of a table
    Inspect {
        /// Table name, e.g. table_ind
        #[arg(short, long)]
        table: String,

        /// Maximum rows to print
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Remove a run lock left behind by a crashed run
    Unlock,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { input, as_of } => {
            run_command(cli.config, input, as_of, cli.concurrency)?;
        }

        Commands::Plan => {
            plan_command(cli.config)?;
        }

        Commands::Validate => {
            validate_command(cli.config)?;
        }

        Commands::GenerateConfig { output } => {
            generate_config_command(output)?;
        }

        Commands::GenerateSample { output } => {
            generate_sample_command(output)?;
        }

        Commands::Inspect { table, limit } => {
            inspect_command(cli.config, table, limit)?;
        }

        Commands::Unlock => {
            unlock_command(cli.config)?;
        }
    }

    Ok(())
}

/// Load an input batch, choosing the format from the file extension.
fn load_records(path: &Path) -> Result<Vec<RawCustomerRecord>> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read input {}", path.display()))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    let records = match ext {
        "jsonl" | "ndjson" => contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Invalid record on line {} of {}", idx + 1, path.display()))
            })
            .collect::<Result<Vec<_>>>()?,
        "yaml" | "yml" => serde_yaml::from_str(&contents)?,
        _ => serde_json::from_str(&contents)?,
    };
    Ok(records)
}

fn run_command(
    config_path: PathBuf,
    input: PathBuf,
    as_of: Option<NaiveDate>,
    concurrency: Option<usize>,
) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;

    // Apply overrides
    if let Some(c) = concurrency {
        config.processing.partition_concurrency = c;
    }
    if as_of.is_some() {
        config.pipeline.as_of_date = as_of;
    }

    config.validate()?;

    let records = load_records(&input)?;
    tracing::info!("Loaded {} records from {}", records.len(), input.display());

    // Initialize Rayon
    init_rayon(config.processing.rayon_threads)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    let summary = runtime.block_on(async {
        let cancel = CancellationFlag::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; stopping at the next stage boundary");
                on_signal.cancel();
            }
        });

        run_pipeline(config, records, &cancel).await
    })?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn plan_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;

    let catalog = Catalog::new(config.pipeline.supported_countries.iter());
    println!("\n=== Stage Plan: {} ===", config.pipeline.name);
    print!("{}", StagePlan::new(&catalog).describe());
    println!("Tables at: {}", config.storage.path_display());
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn inspect_command(config_path: PathBuf, table: String, limit: usize) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;

    let runtime = build_runtime(None)?;
    runtime.block_on(async {
        let store = create_table_store(&config.storage)?;
        let rows = store.read_all(&table).await?;

        println!("\n=== {} ({} rows) ===", table, rows.len());
        for row in rows.iter().take(limit) {
            println!("{}", serde_json::to_string(row)?);
        }
        if rows.len() > limit {
            println!("... {} more", rows.len() - limit);
        }
        Ok::<_, anyhow::Error>(())
    })
}

fn unlock_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;

    let runtime = build_runtime(None)?;
    runtime.block_on(async {
        let (store, prefix) = create_object_store(&config.storage)?;
        if RunLock::force_release(store.as_ref(), &prefix, &config.pipeline.name).await? {
            println!("Removed run lock for {}", config.pipeline.name);
        } else {
            println!("No run lock held for {}", config.pipeline.name);
        }
        Ok::<_, anyhow::Error>(())
    })
}

fn generate_sample_command(output: PathBuf) -> Result<()> {
    let json = serde_json::to_string_pretty(&sample_records())?;
    std::fs::write(&output, json)?;
    println!("Generated sample records at: {}", output.display());
    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# Customer Pipeline Configuration

# === PIPELINE: What a run computes ===
pipeline:
  # Pipeline identity; also names the run lock
  name: "customer_data_pipeline"

  # Countries that get a destination table (table_<code>)
  # Records with any other country go to unrouted_customers
  supported_countries: [IND, USA]

  # Processing date for derived fields (default: today, UTC)
  # as_of_date: 2023-03-10

  # flag_days_gt_30 is set when days since last consultation exceed this
  stale_after_days: 30

  # Age computation: calendar_year (as_of.year - dob.year) or exact
  age_policy: calendar_year

# === STORAGE: Where tables live ===
# Choose ONE of: local_path, bucket+prefix (S3), or in_memory
storage:
  # Option 1: Local filesystem
  local_path: "/tmp/customer-pipeline"

  # Option 2: S3 (comment out local_path and uncomment these)
  # bucket: "warehouse-bucket"
  # prefix: "customers"

  # Option 3: In memory (nothing persists after the run)
  # in_memory: true

# === PROCESSING: Performance tuning ===
processing:
  # Destination partitions written concurrently
  partition_concurrency: 8

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Rayon thread pool size for enrichment (null = num CPUs)
  # rayon_threads: 8

  # Log metrics during the run and print a summary
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # Save final metrics as JSON
  # metrics_output_path: "metrics.json"

  # Retries for destination table writes
  retry:
    max_retries: 1
    initial_backoff_ms: 500
    max_backoff_ms: 10000
"#;

fn generate_config_command(output: PathBuf) -> Result<()> {
    std::fs::write(&output, SAMPLE_CONFIG)?;
    println!("Generated sample configuration at: {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from(["customer-pipeline", "run", "--input", "batch.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { as_of: None, .. }));
    }

    #[test]
    fn test_cli_parse_run_requires_input() {
        assert!(Cli::try_parse_from(["customer-pipeline", "run"]).is_err());
    }

    #[test]
    fn test_cli_parse_as_of() {
        let cli = Cli::try_parse_from([
            "customer-pipeline",
            "-c",
            "other.yaml",
            "run",
            "-i",
            "batch.jsonl",
            "--as-of",
            "2023-03-10",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
        match cli.command {
            Commands::Run { as_of, .. } => assert_eq!(as_of, NaiveDate::from_ymd_opt(2023, 3, 10)),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parse_inspect() {
        let cli = Cli::try_parse_from(["customer-pipeline", "inspect", "--table", "table_ind", "-c", "test.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Inspect { ref table, limit: 20 } if table == "table_ind"));
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.processing.partition_concurrency, 8);
    }

    #[test]
    fn test_load_records_formats() {
        let dir = tempfile::tempdir().unwrap();

        let json = dir.path().join("batch.json");
        std::fs::write(&json, serde_json::to_string(&sample_records()).unwrap()).unwrap();
        assert_eq!(load_records(&json).unwrap(), sample_records());

        let jsonl = dir.path().join("batch.jsonl");
        std::fs::write(
            &jsonl,
            "{\"Customer_Id\": \"CUST001\", \"Open_Date\": \"2023-01-01\"}\n\n{\"customer_id\": \"CUST002\"}\n",
        )
        .unwrap();
        let records = load_records(&jsonl).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].customer_id.as_deref(), Some("CUST001"));
        assert_eq!(records[0].open_date.as_deref(), Some("2023-01-01"));

        let yaml = dir.path().join("batch.yaml");
        std::fs::write(&yaml, "- customer_id: CUST011\n  country: USA\n").unwrap();
        assert_eq!(load_records(&yaml).unwrap()[0].country.as_deref(), Some("USA"));
    }
}
