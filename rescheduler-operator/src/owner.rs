//! Owner kinds the rescheduler manages and the per-kind quirks it needs.
//!
//! [`OwnerKind`] carries the data that differs between kinds: ledger layout,
//! how a mutation is applied and whether the budget scales with replicas.
//! [`Workload`] is implemented for each Kubernetes type so the reconciler and
//! executor can stay generic over the owner.

use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;

use crate::error::OperatorResult;
use crate::ledger::{HINT_ANNOTATION, Ledger, LedgerSchema, codec};
use crate::store::StoredObject;

/// Labels the Job controller stamps on a Job and its template.
const JOB_MANAGED_LABELS: &[&str] = &[
    "controller-uid",
    "batch.kubernetes.io/controller-uid",
    "job-name",
    "batch.kubernetes.io/job-name",
];

/// Canonical owner of a pod after collapsing ReplicaSet→Deployment and
/// Job→CronJob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    /// apps/v1 Deployment.
    Deployment,
    /// Standalone apps/v1 ReplicaSet.
    ReplicaSet,
    /// apps/v1 StatefulSet.
    StatefulSet,
    /// apps/v1 DaemonSet.
    DaemonSet,
    /// Standalone batch/v1 Job.
    Job,
    /// batch/v1 CronJob.
    CronJob,
    /// Pod without owner references.
    Pod,
}

/// How a ledger write reaches the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStrategy {
    /// Update the owner's annotations, then delete the pod.
    InPlace,
    /// Delete the owner and create a stripped copy carrying the new ledger.
    Recreate,
}

impl OwnerKind {
    /// Map an owner reference kind. Returns `None` for kinds not managed.
    pub fn from_reference_kind(kind: &str) -> Option<Self> {
        Some(match kind {
            "Deployment" => OwnerKind::Deployment,
            "ReplicaSet" => OwnerKind::ReplicaSet,
            "StatefulSet" => OwnerKind::StatefulSet,
            "DaemonSet" => OwnerKind::DaemonSet,
            "Job" => OwnerKind::Job,
            "CronJob" => OwnerKind::CronJob,
            _ => return None,
        })
    }

    /// Kubernetes kind name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Deployment => "Deployment",
            OwnerKind::ReplicaSet => "ReplicaSet",
            OwnerKind::StatefulSet => "StatefulSet",
            OwnerKind::DaemonSet => "DaemonSet",
            OwnerKind::Job => "Job",
            OwnerKind::CronJob => "CronJob",
            OwnerKind::Pod => "Pod",
        }
    }

    /// Annotation layout used for this kind's ledger.
    pub fn ledger_schema(&self) -> LedgerSchema {
        match self {
            OwnerKind::Deployment => LedgerSchema::Hosts {
                key: "kse.com/deploy",
                field: "deployScheduledHosts",
            },
            OwnerKind::ReplicaSet => LedgerSchema::Hosts {
                key: "kse.com/rs",
                field: "rsScheduledHosts",
            },
            OwnerKind::CronJob => LedgerSchema::Hosts {
                key: "kse.com/cj",
                field: "cjScheduledHosts",
            },
            OwnerKind::Job => LedgerSchema::Hosts {
                key: "kse.com/job",
                field: "jobScheduledHosts",
            },
            OwnerKind::Pod => LedgerSchema::Hosts {
                key: "kse.com/pod",
                field: "podScheduledHosts",
            },
            OwnerKind::StatefulSet => LedgerSchema::PodMap {
                key: "kse.com/sts-pods-map",
            },
            OwnerKind::DaemonSet => LedgerSchema::Counter {
                key: "kse.com/current-retries-times",
            },
        }
    }

    /// How evicting mutations are applied.
    pub fn mutation_strategy(&self) -> MutationStrategy {
        match self {
            OwnerKind::Job | OwnerKind::CronJob | OwnerKind::Pod => MutationStrategy::Recreate,
            _ => MutationStrategy::InPlace,
        }
    }

    /// Whether the declared budget is multiplied by the replica count.
    pub fn scales_with_replicas(&self) -> bool {
        matches!(self, OwnerKind::Deployment | OwnerKind::ReplicaSet)
    }

    /// Whether the owner runs pods to completion.
    pub fn is_batch(&self) -> bool {
        matches!(self, OwnerKind::Job | OwnerKind::CronJob)
    }

    /// Whether new pods get their hint from the admission injector.
    pub fn receives_admission_hint(&self) -> bool {
        !matches!(self, OwnerKind::DaemonSet | OwnerKind::Pod)
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Kubernetes type that can own a retry ledger.
pub trait Workload: StoredObject {
    /// Owner kind this type represents.
    const KIND: OwnerKind;

    /// Declared replica count, for kinds whose budget scales with it.
    fn replicas(&self) -> Option<i32> {
        None
    }

    /// Clear kind-specific fields the API server rejects on create.
    ///
    /// Metadata identity is cleared by the executor.
    fn strip_for_recreate(&mut self) {}

    /// Hook run after the ledger annotation is set on this object.
    fn ledger_written(&mut self, _ledger: &Ledger) -> OperatorResult<()> {
        Ok(())
    }
}

impl Workload for Deployment {
    const KIND: OwnerKind = OwnerKind::Deployment;

    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref().and_then(|s| s.replicas)
    }
}

impl Workload for ReplicaSet {
    const KIND: OwnerKind = OwnerKind::ReplicaSet;

    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref().and_then(|s| s.replicas)
    }
}

impl Workload for StatefulSet {
    const KIND: OwnerKind = OwnerKind::StatefulSet;
}

impl Workload for DaemonSet {
    const KIND: OwnerKind = OwnerKind::DaemonSet;
}

impl Workload for CronJob {
    const KIND: OwnerKind = OwnerKind::CronJob;

    fn strip_for_recreate(&mut self) {
        self.status = None;
    }
}

impl Workload for Job {
    const KIND: OwnerKind = OwnerKind::Job;

    fn strip_for_recreate(&mut self) {
        self.status = None;
        strip_job_labels(self.metadata.labels.as_mut());
        if let Some(spec) = self.spec.as_mut() {
            // The generated selector pins the old controller-uid.
            spec.selector = None;
            if let Some(meta) = spec.template.metadata.as_mut() {
                strip_job_labels(meta.labels.as_mut());
            }
        }
    }
}

impl Workload for Pod {
    const KIND: OwnerKind = OwnerKind::Pod;

    fn strip_for_recreate(&mut self) {
        self.status = None;
        if let Some(spec) = self.spec.as_mut() {
            spec.node_name = None;
        }
    }

    fn ledger_written(&mut self, ledger: &Ledger) -> OperatorResult<()> {
        let annotations = self.metadata.annotations.get_or_insert_with(Default::default);
        if ledger.excluded_hosts.is_empty() {
            annotations.remove(HINT_ANNOTATION);
        } else {
            annotations.insert(HINT_ANNOTATION.to_string(), codec::encode_hint(ledger)?);
        }
        Ok(())
    }
}

fn strip_job_labels(labels: Option<&mut std::collections::BTreeMap<String, String>>) {
    if let Some(labels) = labels {
        for key in JOB_MANAGED_LABELS {
            labels.remove(*key);
        }
    }
}
