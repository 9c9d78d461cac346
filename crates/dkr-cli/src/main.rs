use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dkr_core::EntityId;
use dkr_reconcile::{reconcile_with_config, report_recent_markdown, ReconcileConfig, RunSummary};
use dkr_storage::PgStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dkr")]
#[command(about = "Derived key reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Consolidate entities whose derived keys drifted from their source fields.
    Reconcile {
        /// Run every phase, then roll back.
        #[arg(long)]
        dry_run: bool,
        /// Skip writing reports/<run_id>/.
        #[arg(long)]
        no_report: bool,
    },
    /// Print the consolidation plan without changing the store.
    Scan,
    /// Apply the reconciliation schema migrations.
    Migrate,
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn print_summary(summary: &RunSummary) {
    println!(
        "reconcile complete: run_id={} committed={} mismatches={} groups={} rekeyed={} deleted={} digest={}",
        summary.run_id,
        summary.committed,
        summary.mismatches,
        summary.groups,
        summary.entities_rekeyed,
        summary.entities_deleted.len(),
        summary.plan_digest
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = ReconcileConfig::from_env();

    match cli.command.unwrap_or(Commands::Reconcile {
        dry_run: false,
        no_report: false,
    }) {
        Commands::Reconcile { dry_run, no_report } => {
            config.dry_run |= dry_run;
            let (summary, report_dir) = reconcile_with_config(&config, !no_report).await?;
            print_summary(&summary);
            if let Some(dir) = report_dir {
                println!("report: {}", dir.display());
            }
        }
        Commands::Scan => {
            config.dry_run = true;
            let (summary, _) = reconcile_with_config(&config, false).await?;
            let joined = |ids: &[EntityId]| {
                ids.iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            };
            for group in &summary.plan {
                println!(
                    "{} -> entity {} ({:?}); children={} retire=[{}] keep=[{}]",
                    group.correct_key,
                    group.canonical,
                    group.selection,
                    group.children.len(),
                    joined(&group.retired),
                    joined(&group.retained)
                );
            }
            print_summary(&summary);
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to the reconciliation database")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, &config.reports_root())?);
        }
    }

    Ok(())
}
