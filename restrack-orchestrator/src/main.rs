use anyhow::bail;
use clap::{Parser, Subcommand};
use restrack_common::{expand_selection, KindSelection, Site};
use std::time::Duration;

use restrack_orchestrator::provider_manager::{ProviderManager, SiteGateways};
use restrack_orchestrator::retirement::{self, RetirementRequest};
use restrack_orchestrator::settings::Settings;
use restrack_orchestrator::terminator::{self, PgDeletionLedger, RetirementOutcome};
use restrack_orchestrator::{database, logger, migrations, reconciliation};

#[derive(Parser)]
#[command(name = "restrack")]
#[command(about = "Track and retire resources across the testbed's OpenStack sites")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the inventory with the live state of every configured site
    Track {
        /// Repeat every N seconds instead of running a single pass
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        site: Option<Site>,
    },
    /// Delete still-present resources created more than HOURS ago
    Cleanup {
        #[arg(allow_hyphen_values = true)]
        hours: i64,
        /// Only print what would be deleted
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Resource kind to consider (repeatable, default all)
        #[arg(long = "kind")]
        kinds: Vec<KindSelection>,
        #[arg(long)]
        site: Option<Site>,
    },
    /// Apply the inventory schema
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;

    match cli.command {
        Commands::Migrate => {
            let pool = database::create_pool(&settings).await?;
            migrations::run_migrations(&pool).await?;
            println!("✅ migrations applied");
        }
        Commands::Track { interval, site } => {
            settings.restrict_to(site)?;
            let pool = database::create_pool(&settings).await?;
            migrations::run_migrations(&pool).await?;

            let connections = ProviderManager::connect(&settings).await?;
            let unreachable = connections.failures.len();
            if connections.gateways.is_empty() {
                bail!("no site could be reached ({} failed to authenticate)", unreachable);
            }

            if let Some(secs) = interval {
                if secs == 0 {
                    bail!("--interval must be at least one second");
                }
                reconciliation::run(pool, connections.gateways, Duration::from_secs(secs)).await;
                return Ok(());
            }

            let results = reconciliation::reconcile_all(&pool, &connections.gateways).await;
            for (site, result) in &results {
                match result {
                    Ok(report) => {
                        println!("✅ {}", site);
                        for (kind, t) in &report.kinds {
                            println!(
                                "   {:<13} +{} ~{} -{}{}{}",
                                kind.plural(),
                                t.inserted,
                                t.updated,
                                t.marked_absent,
                                if t.malformed > 0 {
                                    format!(" ({} malformed)", t.malformed)
                                } else {
                                    String::new()
                                },
                                if t.failed > 0 {
                                    format!(" ({} rejected)", t.failed)
                                } else {
                                    String::new()
                                }
                            );
                        }
                    }
                    Err(e) => println!("❌ {}: {}", site, e),
                }
            }
            for (site, e) in &connections.failures {
                println!("❌ {}: {}", site, e);
            }

            let failed = unreachable + results.iter().filter(|(_, r)| r.is_err()).count();
            if failed > 0 {
                bail!("{} of {} site(s) failed", failed, results.len() + unreachable);
            }
        }
        Commands::Cleanup {
            hours,
            dry_run,
            kinds,
            site,
        } => {
            let request = RetirementRequest {
                older_than: retirement::age_from_hours(hours)?,
                kinds: expand_selection(&kinds),
                site,
            };

            let pool = database::create_pool(&settings).await?;
            let selection = retirement::select_from_pool(&pool, &request, &settings.protect).await?;
            let ledger = PgDeletionLedger::new(pool);

            if dry_run {
                let outcome = terminator::retire(&selection, true, &SiteGateways::new(), &ledger).await;
                print!("{}", outcome.preview.unwrap_or_default());
                return Ok(());
            }
            if selection.is_empty() {
                println!("nothing older than {} hours", hours);
                return Ok(());
            }

            settings.restrict_to(site)?;
            let connections = ProviderManager::connect(&settings).await?;
            let outcome = terminator::retire(&selection, false, &connections.gateways, &ledger).await;
            print_outcome(&outcome);

            if !outcome.is_clean() {
                bail!(
                    "{} deletion(s) failed, {} kind(s) not recorded",
                    outcome.failed_count(),
                    outcome.bookkeeping_errors.len()
                );
            }
        }
    }
    Ok(())
}

fn print_outcome(outcome: &RetirementOutcome) {
    for (kind, ids) in &outcome.confirmed {
        println!("🗑️  {}: {} deleted", kind.plural(), ids.len());
    }
    for (kind, failures) in &outcome.failed {
        for f in failures {
            println!("❌ {} {}: {}", kind.as_str(), f.resource, f.reason);
        }
    }
    for (kind, e) in &outcome.bookkeeping_errors {
        println!("⚠️  {} deleted but not recorded: {}", kind.plural(), e);
    }
}
