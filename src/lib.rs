//! crawlsched -- Weekly gym-crawl scheduler and supervisor.
//!
//! This crate provides the core library for the crawl scheduler: the weekly
//! cron gate, crawl script discovery, supervised execution with timeout
//! escalation, the failure circuit breaker, and the persistent failure log.

pub mod api;
pub mod config;
pub mod faillog;
pub mod runner;
pub mod schedule;
pub mod script;

use std::sync::Arc;

use anyhow::Result;

/// Start the crawlsched daemon: weekly timer (when armable) and API server.
pub async fn serve(bind: &str, config: config::CrawlschedConfig) -> Result<()> {
    // 1. Build the scheduler service
    let scheduler = Arc::new(runner::CrawlScheduler::new(&config)?);

    // 2. Arm the weekly timer (production mode plus a usable script)
    match scheduler.clone().arm() {
        Ok(script) => {
            let next = scheduler.schedule().next_occurrence(chrono::Utc::now());
            tracing::info!(
                script = %script.display(),
                expression = scheduler.schedule().expression(),
                timezone = %scheduler.schedule().timezone(),
                next_run = ?next,
                "weekly crawl timer armed"
            );
        }
        Err(refusal) => {
            tracing::warn!(
                reason = %refusal,
                "weekly crawl timer not armed, manual runs remain available"
            );
        }
    }

    // 3. Start API server
    let addr: std::net::SocketAddr = bind.parse()?;
    let app = api::router(api::state::AppState {
        scheduler: Arc::clone(&scheduler),
    });

    tracing::info!(%addr, "crawlsched listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 4. Drain: stop the timer and settle any in-flight crawl
    tracing::info!("shutting down, waiting for in-flight work");
    scheduler.shutdown().await;

    Ok(())
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    return;
                }
            }
            std::future::pending::<()>().await
        } => {
            tracing::info!("received terminate signal");
        }
    }
}
