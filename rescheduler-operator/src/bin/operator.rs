//! Rescheduler reconciliation driver.
//!
//! Campaigns for the leader Lease and, while leading, runs a reconciliation
//! pass over all pods on a fixed interval.

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use rescheduler_operator::config::OperatorArgs;
use rescheduler_operator::controller::{ControllerContext, LeaderElector, ReconcileDriver};
use rescheduler_operator::store::KubeStore;
use rescheduler_operator::telemetry::{TelemetryConfig, init_tracing};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = OperatorArgs::parse();
    init_tracing(&TelemetryConfig::from_env())?;

    tracing::info!("Starting rescheduler operator");

    let settings = args.reconcile_settings()?;
    let election = args.leader_election()?;

    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let store = KubeStore::new(client);
    let ctx = Arc::new(ControllerContext::new(store.clone(), settings));
    let driver = ReconcileDriver::new(ctx);
    let elector = LeaderElector::new(store, election);

    let token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(token.clone()));

    elector
        .run(token, move |leading| {
            let driver = driver.clone();
            async move { driver.run(leading).await }
        })
        .await?;

    tracing::info!("Rescheduler operator stopped");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
    token.cancel();
}
