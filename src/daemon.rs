//! Process orchestration.
//!
//! Wires the channels between the ingester, aggregator, observation window
//! and admin server, installs signal handling, and runs until shutdown.
//! Exactly one task owns each piece of mutable state; everything crossing a
//! task boundary goes through a bounded channel.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::admin::AdminServer;
use crate::aggregate::Aggregator;
use crate::config::Config;
use crate::ingest::UdpIngester;
use crate::window::ObservationWindow;

/// Capacity of the ingester→aggregator and ingester→window channels. A full
/// channel blocks the ingester, which is the sole backpressure mechanism.
const MAX_PENDING_EVENTS: usize = 1000;

/// Capacity of the admin→window query channel; each connection has at most
/// one query in flight.
const MAX_PENDING_QUERIES: usize = 32;

/// Runs the daemon until SIGINT/SIGTERM (or a fatal listener error), ending
/// with one final flush.
pub async fn run(cfg: Config) -> Result<()> {
    let percentiles = cfg
        .percentiles()
        .context("parsing percentile_thresholds")?;

    let cancel = CancellationToken::new();

    let (event_tx, event_rx) = mpsc::channel(MAX_PENDING_EVENTS);
    let (observation_tx, observation_rx) = mpsc::channel(MAX_PENDING_EVENTS);
    let (query_tx, query_rx) = mpsc::channel(MAX_PENDING_QUERIES);

    // Signal watcher: first SIGINT/SIGTERM cancels everything.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                }
            }

            cancel.cancel();
        });
    }

    let window = ObservationWindow::new(cfg.max_timers_per_s);
    tokio::spawn(window.run(observation_rx, query_rx, cancel.clone()));

    let admin = AdminServer::bind(&cfg.admin_addr, query_tx)
        .await
        .context("starting admin server")?;
    let admin_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = admin.run(cancel.clone()).await;
            if let Err(e) = &result {
                error!(error = %e, "admin server failed");
                cancel.cancel();
            }
            result
        })
    };

    let ingester = UdpIngester::bind(&cfg.listen_addr, event_tx, observation_tx)
        .await
        .context("starting UDP ingester")?;
    tokio::spawn(ingester.run(cancel.clone()));

    // The aggregator runs on this task and performs the final flush when
    // the token is cancelled.
    let aggregator = Aggregator::new(&cfg, percentiles);
    aggregator.run(event_rx, cancel.clone()).await;

    // Surface a fatal admin error as the process result.
    match admin_task.await {
        Ok(result) => result?,
        Err(e) => error!(error = %e, "admin task join failed"),
    }

    info!("statsdaemon stopped");

    Ok(())
}
