//! Periodic cluster-wide reconciliation passes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::ControllerContext;
use super::reconciler::{PodOutcome, reconcile_pod};
use crate::classify;
use crate::error::OperatorResult;
use crate::store::ObjectStore;

/// Counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Abnormal pods fed into the pipeline.
    pub examined: usize,
    /// Pods skipped (gone, completed, unmanaged owner).
    pub skipped: usize,
    /// Pods where the policy decided nothing.
    pub unchanged: usize,
    /// Pods whose owner ledger was written.
    pub mutated: usize,
    /// Pods that failed; logged and left for the next pass.
    pub failed: usize,
}

/// Lists pods and runs the pipeline on each abnormal one.
pub struct ReconcileDriver<S> {
    ctx: Arc<ControllerContext<S>>,
}

impl<S> Clone for ReconcileDriver<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<S: ObjectStore> ReconcileDriver<S> {
    /// Create a driver over a shared context.
    pub fn new(ctx: Arc<ControllerContext<S>>) -> Self {
        Self { ctx }
    }

    /// Run one pass. Errors for individual pods are logged and counted;
    /// only a failed pod listing fails the pass.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> OperatorResult<PassSummary> {
        let pods: Vec<Pod> = self.ctx.store.list().await?;
        let mut summary = PassSummary::default();

        for pod in pods.iter().filter(|p| classify::is_abnormal(p)) {
            summary.examined += 1;
            match reconcile_pod(&self.ctx, pod, now).await {
                Ok(PodOutcome::Skipped(reason)) => {
                    tracing::trace!(pod = %pod.name_any(), ?reason, "Skipped pod");
                    summary.skipped += 1;
                }
                Ok(PodOutcome::Unchanged) => summary.unchanged += 1,
                Ok(PodOutcome::Applied(action)) => {
                    tracing::debug!(
                        namespace = %pod.namespace().unwrap_or_default(),
                        pod = %pod.name_any(),
                        action,
                        "Reconciled pod"
                    );
                    summary.mutated += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        namespace = %pod.namespace().unwrap_or_default(),
                        pod = %pod.name_any(),
                        error = %e,
                        "Pod reconciliation failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Run passes every `pass_interval` until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.settings.pass_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval = ?self.ctx.settings.pass_interval,
            window = ?self.ctx.settings.retry_window,
            "Reconciliation driver started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_pass(Utc::now()).await {
                        Ok(summary) => tracing::info!(
                            examined = summary.examined,
                            mutated = summary.mutated,
                            unchanged = summary.unchanged,
                            skipped = summary.skipped,
                            failed = summary.failed,
                            "Reconciliation pass complete"
                        ),
                        Err(e) => tracing::error!(error = %e, "Reconciliation pass failed"),
                    }
                }
            }
        }

        tracing::info!("Reconciliation driver stopped");
    }
}
