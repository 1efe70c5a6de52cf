//! Pod status predicates.
//!
//! Everything here is a pure function over a pod's phase, conditions and
//! container statuses.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Pod, PodCondition};

use crate::ledger::HINT_ANNOTATION;

const PHASE_PENDING: &str = "Pending";
const CONDITION_SCHEDULED: &str = "PodScheduled";
const CONDITION_READY: &str = "Ready";
const CONDITION_CONTAINERS_READY: &str = "ContainersReady";
const REASON_COMPLETED: &str = "PodCompleted";

/// Scheduling signals fed into the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodSignals {
    /// See [`has_scheduled`].
    pub has_scheduled: bool,
    /// See [`is_unschedulable`].
    pub unschedulable: bool,
}

impl PodSignals {
    /// Evaluate both predicates for `pod`.
    pub fn of(pod: &Pod) -> Self {
        Self {
            has_scheduled: has_scheduled(pod),
            unschedulable: is_unschedulable(pod),
        }
    }
}

/// The pod has been placed on a node and none of its containers is running.
pub fn has_scheduled(pod: &Pod) -> bool {
    if phase(pod) == Some(PHASE_PENDING) {
        return false;
    }
    let any_running = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses
                .iter()
                .any(|c| c.state.as_ref().is_some_and(|st| st.running.is_some()))
        });
    if any_running {
        return false;
    }
    conditions(pod).any(|c| c.type_ == CONDITION_SCHEDULED && c.status == "True")
}

/// The scheduler could not place the pod, and the pod carries our hint.
///
/// Pods that failed to schedule without ever being hinted are left to the
/// scheduler.
pub fn is_unschedulable(pod: &Pod) -> bool {
    let hinted = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(HINT_ANNOTATION));
    hinted && conditions(pod).any(|c| c.type_ == CONDITION_SCHEDULED && c.status == "False")
}

/// A Job/CronJob pod that ran to completion.
pub fn is_completed(pod: &Pod) -> bool {
    if phase(pod) == Some(PHASE_PENDING) {
        return false;
    }
    !conditions(pod).any(|c| {
        (c.type_ == CONDITION_READY || c.type_ == CONDITION_CONTAINERS_READY)
            && c.reason.as_deref() != Some(REASON_COMPLETED)
    })
}

/// Any condition reports `False`. Healthy pods are never reconciled.
pub fn is_abnormal(pod: &Pod) -> bool {
    conditions(pod).any(|c| c.status == "False")
}

/// The pod was created less than `window` before `now`.
///
/// Pods without a creation timestamp are treated as outside the window.
/// A window that runs past the representable end of time never closes.
pub fn within_window(pod: &Pod, window: Duration, now: DateTime<Utc>) -> bool {
    pod.metadata.creation_timestamp.as_ref().is_some_and(|created| {
        created
            .0
            .checked_add_signed(window)
            .is_none_or(|deadline| now < deadline)
    })
}

/// Node the pod is bound to.
pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

fn conditions(pod: &Pod) -> impl Iterator<Item = &PodCondition> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
}
