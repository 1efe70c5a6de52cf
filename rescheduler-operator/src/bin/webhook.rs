//! Rescheduler webhook server.
//!
//! Serves the mutating admission webhook that injects scheduling hints into
//! new pods, and the scheduler extender `filter` verb that honours them.

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use rescheduler_operator::admission::HintInjector;
use rescheduler_operator::config::WebhookArgs;
use rescheduler_operator::server::{self, WebhookState};
use rescheduler_operator::store::KubeStore;
use rescheduler_operator::telemetry::{TelemetryConfig, init_tracing};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = WebhookArgs::parse();
    init_tracing(&TelemetryConfig::from_env())?;

    info!("Rescheduler webhook server starting...");

    let config = args.server_config()?;
    info!(
        port = args.port,
        tls_cert = %config.tls_cert.display(),
        tls_key = %config.tls_key.display(),
        system_namespace = %args.system_namespace,
        "Webhook configuration loaded"
    );

    let client = Client::try_default().await?;
    let injector = HintInjector::new(KubeStore::new(client), args.system_namespace.clone());
    let state = Arc::new(WebhookState::new(injector));

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    server::serve(&config, state, token).await?;
    Ok(())
}
