//! Reconciliation of pods against their owners' retry ledgers.
//!
//! - [`resolver`]: pod → canonical owner
//! - [`reconciler`]: per-pod pipeline (classify, decide, apply)
//! - [`executor`]: applies an [`crate::policy::Action`] to the store
//! - [`driver`]: periodic cluster-wide passes
//! - [`leader`]: Lease-based leader election gating the driver
//!
//! # Usage
//!
//! ```ignore
//! let ctx = Arc::new(ControllerContext::new(KubeStore::new(client), ReconcileSettings::default()));
//! let driver = ReconcileDriver::new(ctx);
//! elector.run(token, move |lead| {
//!     let driver = driver.clone();
//!     async move { driver.run(lead).await }
//! }).await?;
//! ```

pub mod driver;
pub mod executor;
pub mod leader;
pub mod reconciler;
pub mod resolver;

use std::time::Duration;

use crate::error::{OperatorError, OperatorResult};
use crate::retry::Backoff;

pub use driver::{PassSummary, ReconcileDriver};
pub use executor::MutationExecutor;
pub use leader::{LeaderElectionConfig, LeaderElector};
pub use reconciler::{PodOutcome, SkipReason, reconcile_pod};
pub use resolver::{ResolvedOwner, resolve_owner};

/// Default retry window measured from pod creation.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Longest retry window accepted by [`ReconcileSettings::validate`].
pub const MAX_RETRY_WINDOW: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Default period between reconciliation passes.
pub const DEFAULT_PASS_INTERVAL: Duration = Duration::from_secs(30);

/// Namespace excluded from admission hints by default.
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "kube-system";

/// Tunables for the reconciliation pipeline.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Window after pod creation during which excluded hosts are tracked.
    pub retry_window: Duration,
    /// Time between passes.
    pub pass_interval: Duration,
    /// Backoff for optimistic-concurrency retries.
    pub backoff: Backoff,
    /// Backoff for creating a copy while the deleted original terminates.
    pub recreate_backoff: Backoff,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            retry_window: DEFAULT_RETRY_WINDOW,
            pass_interval: DEFAULT_PASS_INTERVAL,
            backoff: Backoff::default(),
            recreate_backoff: Backoff::recreate(),
        }
    }
}

impl ReconcileSettings {
    /// Reject settings that would stall or spin the driver.
    pub fn validate(&self) -> OperatorResult<()> {
        if self.retry_window.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "retry window must be positive".to_string(),
            ));
        }
        if self.retry_window > MAX_RETRY_WINDOW {
            return Err(OperatorError::InvalidConfig(format!(
                "retry window of {}s exceeds the maximum of {}s",
                self.retry_window.as_secs(),
                MAX_RETRY_WINDOW.as_secs()
            )));
        }
        if self.pass_interval.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "pass interval must be positive".to_string(),
            ));
        }
        if self.backoff.steps == 0 {
            return Err(OperatorError::InvalidConfig(
                "conflict retry steps must be at least 1".to_string(),
            ));
        }
        if self.recreate_backoff.steps == 0 {
            return Err(OperatorError::InvalidConfig(
                "recreate retry steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry window as a chrono duration for timestamp arithmetic.
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retry_window).unwrap_or(chrono::Duration::MAX)
    }
}

/// Shared context for the reconciler.
pub struct ControllerContext<S> {
    /// Object store.
    pub store: S,
    /// Pipeline settings.
    pub settings: ReconcileSettings,
}

impl<S> ControllerContext<S> {
    /// Create a new controller context.
    pub fn new(store: S, settings: ReconcileSettings) -> Self {
        Self { store, settings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = ReconcileSettings::default();
        settings.validate().expect("defaults");
        assert_eq!(settings.window(), chrono::Duration::minutes(30));
    }

    #[test]
    fn zero_window_is_rejected() {
        let settings = ReconcileSettings {
            retry_window: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(OperatorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn oversized_window_is_rejected() {
        let settings = ReconcileSettings {
            retry_window: Duration::from_secs(10_000_000_000_000),
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(OperatorError::InvalidConfig(_))
        ));

        let settings = ReconcileSettings {
            retry_window: MAX_RETRY_WINDOW,
            ..Default::default()
        };
        settings.validate().expect("upper bound is inclusive");
    }
}
