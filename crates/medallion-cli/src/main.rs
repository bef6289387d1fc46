mod commands;
mod logging;

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "medallion",
    version,
    about = "Incremental bronze/silver/gold pipelines over landing-zone files"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Trigger every stage once, or keep triggering in continuous mode
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Keep polling for new data until Ctrl-C
        #[arg(long)]
        continuous: bool,
        /// Date `current_date()` evaluates to (YYYY-MM-DD)
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Rebuild every table from its sources instead of new data only
        #[arg(long)]
        full_refresh: bool,
    },
    /// Validate pipeline configuration, sources, and state backend
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Show stage status, last run, and violation counts per table
    Status {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Return a failed stage to idle
    Reset {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Table whose stage to reset
        table: String,
        /// Also drop the table and its descendants and clear their progress
        #[arg(long)]
        wipe: bool,
    },
    /// Print the current contents of a table
    Query {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Table to print
        table: String,
        /// Maximum rows to print
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            pipeline,
            continuous,
            as_of,
            full_refresh,
        } => commands::run::execute(&pipeline, continuous, as_of, full_refresh).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
        Commands::Status { pipeline, json } => commands::status::execute(&pipeline, json).await,
        Commands::Reset {
            pipeline,
            table,
            wipe,
        } => commands::reset::execute(&pipeline, &table, wipe).await,
        Commands::Query {
            pipeline,
            table,
            limit,
        } => commands::query::execute(&pipeline, &table, limit),
    }
}
