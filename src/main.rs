use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "crawlsched",
    about = "Weekly gym-crawl scheduler and supervisor",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + weekly crawl timer)
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Run one crawl right now and wait for it to finish
    Run,

    /// Report deployment mode, schedule, and crawl script resolution
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = crawlsched::config::CrawlschedConfig::load_or_default();

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(%bind, "Starting crawlsched daemon");
            crawlsched::serve(&bind, config).await?;
        }
        Commands::Run => {
            tracing::info!("Running manual crawl");
            let scheduler = crawlsched::runner::CrawlScheduler::new(&config)?;

            match scheduler
                .run_once(crawlsched::runner::status::Trigger::Manual)
                .await
            {
                Ok(report) if report.success => {
                    println!(
                        "Crawl run {} succeeded in {:.1}s.",
                        report.run_id,
                        report.duration.as_secs_f64()
                    );
                }
                Ok(report) => {
                    println!(
                        "Crawl run {} failed after {:.1}s:",
                        report.run_id,
                        report.duration.as_secs_f64()
                    );
                    if let Some(error) = &report.error {
                        println!("  {}", error);
                    }
                    anyhow::bail!("crawl run failed");
                }
                Err(refused) => {
                    anyhow::bail!("crawl not started: {refused}");
                }
            }
        }
        Commands::Check => {
            let scheduler = crawlsched::runner::CrawlScheduler::new(&config)?;
            let spec = scheduler.schedule();

            println!("Mode:       {}", config.runtime.mode);
            println!("Schedule:   {} ({})", spec.expression(), spec.timezone());
            match spec.next_occurrence(chrono::Utc::now()) {
                Some(next) => println!("Next slot:  {}", next.to_rfc3339()),
                None => println!("Next slot:  none"),
            }
            println!("Error log:  {}", scheduler.failure_log_path().display());

            match scheduler.check_armable() {
                Ok(script) => {
                    println!("Script:     {}", script.display());
                    println!("Timer:      will arm at startup");
                }
                Err(refusal) => {
                    println!("Timer:      will not arm ({refusal})");
                    if matches!(
                        refusal,
                        crawlsched::runner::ArmRefusal::ScriptUnavailable(_)
                    ) {
                        anyhow::bail!("crawl script unavailable");
                    }
                }
            }
        }
    }

    Ok(())
}
