use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use yth_core::HarvestReport;
use yth_sync::RunOptions;

#[derive(Debug, Parser)]
#[command(name = "yth-cli")]
#[command(about = "YouTube channel harvester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest one channel with its playlists, uploads and comments.
    Harvest {
        channel_id: String,
        /// Concurrent per-video workers (1..=16).
        #[arg(long)]
        workers: Option<usize>,
        /// Harvest into memory; nothing is written to the database.
        #[arg(long)]
        dry_run: bool,
        /// Print the run report as JSON instead of a summary line.
        #[arg(long)]
        json: bool,
    },
    /// Apply pending database migrations.
    Migrate,
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("sqlx=warn".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if std::env::var("YTH_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn print_report(report: &HarvestReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("{}", report.summary_line());
    for skip in &report.skipped {
        println!("  skipped {:?} {} at {}: {}", skip.kind, skip.id, skip.stage, skip.reason);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Harvest {
            channel_id,
            workers,
            dry_run,
            json,
        } => {
            if dry_run {
                info!("dry run: harvesting into memory");
            }
            let report =
                yth_sync::run_harvest_from_env(&channel_id, RunOptions { workers, dry_run }).await?;
            print_report(&report, json)?;
        }
        Commands::Migrate => {
            yth_sync::run_migrations_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
