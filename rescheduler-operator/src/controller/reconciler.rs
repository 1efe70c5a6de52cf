//! Per-pod reconciliation: resolve, classify, decide, apply.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use super::ControllerContext;
use super::executor::MutationExecutor;
use super::resolver::{ResolvedOwner, resolve_owner};
use crate::classify::{self, PodSignals};
use crate::error::{OperatorError, OperatorResult};
use crate::ledger::{decode, decode_budget};
use crate::owner::{OwnerKind, Workload};
use crate::policy::{PolicyInput, decide};
use crate::store::ObjectStore;

/// Why a pod was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The pod was deleted since it was listed.
    PodGone,
    /// The owner was deleted since the pod was resolved.
    OwnerGone,
    /// A Job/CronJob pod that already finished.
    Completed,
    /// The owner declares no retry budget, or is a kind not managed here.
    Unmanaged,
}

/// Result of reconciling one pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodOutcome {
    /// Not considered.
    Skipped(SkipReason),
    /// Policy decided there is nothing to do.
    Unchanged,
    /// An action was applied. Carries the action name.
    Applied(&'static str),
}

/// Run the full pipeline for one listed pod.
///
/// The pod is re-read first so decisions are made on current state.
pub async fn reconcile_pod<S: ObjectStore>(
    ctx: &ControllerContext<S>,
    listed: &Pod,
    now: DateTime<Utc>,
) -> OperatorResult<PodOutcome> {
    let namespace = listed.namespace().unwrap_or_default();
    let Some(pod) = ctx
        .store
        .get::<Pod>(&namespace, &listed.name_any())
        .await?
    else {
        return Ok(PodOutcome::Skipped(SkipReason::PodGone));
    };

    let owner = match resolve_owner(&ctx.store, &pod).await {
        Ok(owner) => owner,
        Err(OperatorError::UnsupportedOwner { .. }) => {
            return Ok(PodOutcome::Skipped(SkipReason::Unmanaged));
        }
        Err(e) => return Err(e),
    };
    if owner.kind.is_batch() && classify::is_completed(&pod) {
        return Ok(PodOutcome::Skipped(SkipReason::Completed));
    }

    match owner.kind {
        OwnerKind::Deployment => reconcile_with::<Deployment, S>(ctx, &pod, &owner, now).await,
        OwnerKind::ReplicaSet => reconcile_with::<ReplicaSet, S>(ctx, &pod, &owner, now).await,
        OwnerKind::StatefulSet => reconcile_with::<StatefulSet, S>(ctx, &pod, &owner, now).await,
        OwnerKind::DaemonSet => reconcile_with::<DaemonSet, S>(ctx, &pod, &owner, now).await,
        OwnerKind::Job => reconcile_with::<Job, S>(ctx, &pod, &owner, now).await,
        OwnerKind::CronJob => reconcile_with::<CronJob, S>(ctx, &pod, &owner, now).await,
        OwnerKind::Pod => reconcile_with::<Pod, S>(ctx, &pod, &owner, now).await,
    }
}

async fn reconcile_with<K: Workload, S: ObjectStore>(
    ctx: &ControllerContext<S>,
    pod: &Pod,
    owner: &ResolvedOwner,
    now: DateTime<Utc>,
) -> OperatorResult<PodOutcome> {
    let Some(workload) = ctx.store.get::<K>(&owner.namespace, &owner.name).await? else {
        return Ok(PodOutcome::Skipped(SkipReason::OwnerGone));
    };
    let object = owner.object_ref();
    let annotations = workload.meta().annotations.as_ref();

    let Some(declared) = decode_budget(annotations, &object)? else {
        return Ok(PodOutcome::Skipped(SkipReason::Unmanaged));
    };
    let budget = if K::KIND.scales_with_replicas() {
        declared.saturating_mul(i64::from(workload.replicas().unwrap_or(1)))
    } else {
        declared
    };

    let pod_name = pod.name_any();
    let schema = K::KIND.ledger_schema();
    let ledger = decode(schema, annotations, &pod_name, &object)?;

    let action = decide(PolicyInput {
        ledger: ledger.as_ref(),
        signals: PodSignals::of(pod),
        budget,
        within_window: classify::within_window(pod, ctx.settings.window(), now),
        node: classify::node_name(pod),
        tracks_hosts: schema.tracks_hosts(),
    });

    tracing::debug!(
        owner = %object,
        pod = %pod_name,
        budget,
        attempts = ledger.as_ref().map(|l| l.attempts),
        action = action.name(),
        "Policy decision"
    );

    if action.ledger().is_none() {
        return Ok(PodOutcome::Unchanged);
    }

    MutationExecutor::new(&ctx.store, ctx.settings.backoff)
        .with_recreate_backoff(ctx.settings.recreate_backoff)
        .apply::<K>(owner, &pod_name, &action)
        .await?;
    Ok(PodOutcome::Applied(action.name()))
}
