//! Command-line and environment configuration for the binaries.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::controller::{
    DEFAULT_SYSTEM_NAMESPACE, LeaderElectionConfig, ReconcileSettings,
};
use crate::error::{OperatorError, OperatorResult};
use crate::retry::Backoff;

/// Default name of the leader election Lease.
pub const DEFAULT_LEASE_NAME: &str = "kse-rescheduler";

/// Default HTTPS port for the webhook server.
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// Reconciliation driver options.
#[derive(Debug, Clone, Parser)]
#[command(name = "rescheduler-operator")]
#[command(author, version, about = "Retry ledger reconciliation driver", long_about = None)]
pub struct OperatorArgs {
    /// Seconds between reconciliation passes.
    #[arg(long, env = "RESCHEDULER_PASS_INTERVAL_SECS", default_value_t = 30)]
    pub pass_interval_secs: u64,

    /// Seconds after pod creation during which failed nodes are excluded.
    #[arg(long, env = "RESCHEDULER_RETRY_WINDOW_SECS", default_value_t = 1800)]
    pub retry_window_secs: u64,

    /// Attempts for each optimistic-concurrency write.
    #[arg(long, env = "RESCHEDULER_CONFLICT_RETRIES", default_value_t = 5)]
    pub conflict_retries: u32,

    /// Attempts to create a deleted Job, CronJob or bare pod again.
    #[arg(long, env = "RESCHEDULER_RECREATE_RETRIES", default_value_t = 10)]
    pub recreate_retries: u32,

    /// Namespace holding the leader election Lease.
    #[arg(long, env = "POD_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    pub lease_namespace: String,

    /// Leader election Lease name.
    #[arg(long, env = "RESCHEDULER_LEASE_NAME", default_value = DEFAULT_LEASE_NAME)]
    pub lease_name: String,

    /// Holder identity. Defaults to hostname plus a random suffix.
    #[arg(long, env = "POD_NAME")]
    pub identity: Option<String>,

    /// Lease validity in seconds.
    #[arg(long, default_value_t = 15)]
    pub lease_duration_secs: u64,

    /// Seconds the leader keeps trying to renew before stepping down.
    #[arg(long, default_value_t = 10)]
    pub renew_deadline_secs: u64,

    /// Seconds between acquire and renew attempts.
    #[arg(long, default_value_t = 2)]
    pub retry_period_secs: u64,
}

impl OperatorArgs {
    /// Pipeline settings.
    pub fn reconcile_settings(&self) -> OperatorResult<ReconcileSettings> {
        let settings = ReconcileSettings {
            retry_window: Duration::from_secs(self.retry_window_secs),
            pass_interval: Duration::from_secs(self.pass_interval_secs),
            backoff: Backoff {
                steps: self.conflict_retries,
                ..Backoff::default()
            },
            recreate_backoff: Backoff {
                steps: self.recreate_retries,
                ..Backoff::recreate()
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Leader election settings.
    pub fn leader_election(&self) -> OperatorResult<LeaderElectionConfig> {
        let identity = self.identity.clone().unwrap_or_else(default_identity);
        let config = LeaderElectionConfig {
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
            ..LeaderElectionConfig::new(&self.lease_name, &self.lease_namespace, identity)
        };
        config.validate()?;
        Ok(config)
    }
}

/// Admission webhook and scheduler extender options.
#[derive(Debug, Clone, Parser)]
#[command(name = "rescheduler-webhook")]
#[command(author, version, about = "Scheduling hint injector and extender filter", long_about = None)]
pub struct WebhookArgs {
    /// HTTPS listen port.
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    pub port: u16,

    /// PEM certificate chain.
    #[arg(long, env = "TLS_CERT_FILE", default_value = "/run/secrets/tls/tls.crt")]
    pub tls_cert: PathBuf,

    /// PEM private key.
    #[arg(long, env = "TLS_KEY_FILE", default_value = "/run/secrets/tls/tls.key")]
    pub tls_key: PathBuf,

    /// Pods in this namespace are never hinted.
    #[arg(long, env = "RESCHEDULER_SYSTEM_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    pub system_namespace: String,
}

/// Listener settings for [`crate::server::serve`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to bind.
    pub addr: SocketAddr,
    /// PEM certificate chain.
    pub tls_cert: PathBuf,
    /// PEM private key.
    pub tls_key: PathBuf,
}

impl WebhookArgs {
    /// Listener settings.
    pub fn server_config(&self) -> OperatorResult<ServerConfig> {
        if self.port == 0 {
            return Err(OperatorError::InvalidConfig(
                "webhook port must be non-zero".to_string(),
            ));
        }
        Ok(ServerConfig {
            addr: SocketAddr::from(([0, 0, 0, 0], self.port)),
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
        })
    }
}

fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "rescheduler".to_string());
    format!("{}_{}", host, uuid::Uuid::new_v4())
}
