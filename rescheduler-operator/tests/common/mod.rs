//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use k8s_openapi::api::apps::v1::{
    DaemonSet, Deployment, DeploymentSpec, ReplicaSet, StatefulSet,
};
use k8s_openapi::api::batch::v1::{CronJob, Job, JobSpec};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodSpec, PodStatus, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::Resource;
use rescheduler_operator::controller::{ControllerContext, ReconcileDriver, ReconcileSettings};
use rescheduler_operator::store::MemoryStore;

pub const NAMESPACE: &str = "shop";

/// Fixed reference time for window checks.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub fn annotations(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

pub fn meta(name: &str, pairs: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        annotations: annotations(pairs),
        ..Default::default()
    }
}

/// Controller reference to a seeded object.
pub fn controlled_by<K: Resource<DynamicType = ()>>(owner: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.meta().name.clone().unwrap_or_default(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        ..Default::default()
    }
}

pub fn deployment(name: &str, replicas: i32, pairs: &[(&str, &str)]) -> Deployment {
    Deployment {
        metadata: meta(name, pairs),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn replica_set(name: &str, owner: &Deployment) -> ReplicaSet {
    ReplicaSet {
        metadata: ObjectMeta {
            owner_references: Some(vec![controlled_by(owner)]),
            ..meta(name, &[])
        },
        ..Default::default()
    }
}

pub fn stateful_set(name: &str, pairs: &[(&str, &str)]) -> StatefulSet {
    StatefulSet {
        metadata: meta(name, pairs),
        ..Default::default()
    }
}

pub fn daemon_set(name: &str, pairs: &[(&str, &str)]) -> DaemonSet {
    DaemonSet {
        metadata: meta(name, pairs),
        ..Default::default()
    }
}

pub fn job(name: &str, pairs: &[(&str, &str)]) -> Job {
    Job {
        metadata: meta(name, pairs),
        spec: Some(JobSpec {
            template: PodTemplateSpec::default(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn cron_job(name: &str, pairs: &[(&str, &str)]) -> CronJob {
    CronJob {
        metadata: meta(name, pairs),
        ..Default::default()
    }
}

pub fn job_owned_by(name: &str, owner: &CronJob) -> Job {
    Job {
        metadata: ObjectMeta {
            owner_references: Some(vec![controlled_by(owner)]),
            ..meta(name, &[])
        },
        ..job(name, &[])
    }
}

fn condition(type_: &str, status: &str) -> PodCondition {
    PodCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        ..Default::default()
    }
}

/// A pod that was placed on `node` but never became ready.
pub fn failed_pod(name: &str, node: &str, age: Duration, owner: OwnerReference) -> Pod {
    Pod {
        metadata: ObjectMeta {
            creation_timestamp: Some(Time(now() - age)),
            owner_references: Some(vec![owner]),
            ..meta(name, &[])
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Failed".to_string()),
            conditions: Some(vec![
                condition("PodScheduled", "True"),
                condition("Ready", "False"),
            ]),
            ..Default::default()
        }),
    }
}

/// A pod the scheduler could not place despite carrying a hint.
pub fn unschedulable_pod(name: &str, hint: &str, owner: OwnerReference) -> Pod {
    Pod {
        metadata: ObjectMeta {
            creation_timestamp: Some(Time(now() - Duration::minutes(1))),
            owner_references: Some(vec![owner]),
            ..meta(name, &[("kse.com/scheduled-hosts", hint)])
        },
        status: Some(PodStatus {
            phase: Some("Pending".to_string()),
            conditions: Some(vec![condition("PodScheduled", "False")]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn annotation<K: Resource>(object: &K, key: &str) -> Option<String> {
    object
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .cloned()
}

pub fn driver(store: Arc<MemoryStore>) -> ReconcileDriver<Arc<MemoryStore>> {
    ReconcileDriver::new(Arc::new(ControllerContext::new(
        store,
        ReconcileSettings::default(),
    )))
}
