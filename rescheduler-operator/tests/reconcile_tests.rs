//! End-to-end reconciliation passes against the in-memory store.

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::*;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use pretty_assertions::assert_eq;
use rescheduler_operator::controller::PassSummary;
use rescheduler_operator::store::{MemoryStore, Mutation};

const DEPLOY_LEDGER: &str = "kse.com/deploy";

/// Deployment `web` with budget 2 and two replicas, plus its ReplicaSet.
fn seed_web(store: &MemoryStore, ledger: Option<&str>) -> OwnerReference {
    let mut pairs = vec![("scheduling-retries", "2")];
    if let Some(ledger) = ledger {
        pairs.push((DEPLOY_LEDGER, ledger));
    }
    let deploy = store.insert(deployment("web", 2, &pairs));
    let rs = store.insert(replica_set("web-7d9f", &deploy));
    controlled_by(&rs)
}

fn web(store: &MemoryStore) -> Deployment {
    store.fetch(NAMESPACE, "web").expect("deployment")
}

#[tokio::test]
async fn test_first_failure_records_attempt_and_host() {
    let store = Arc::new(MemoryStore::new());
    let rs = seed_web(&store, None);
    store.insert(failed_pod("web-7d9f-a", "n1", Duration::minutes(5), rs));

    let summary = driver(store.clone()).run_pass(now()).await.expect("pass");

    assert_eq!(
        summary,
        PassSummary {
            examined: 1,
            mutated: 1,
            ..Default::default()
        }
    );
    assert_eq!(
        annotation(&web(&store), DEPLOY_LEDGER).as_deref(),
        Some(r#"{"currentReschedulingTimes":1,"deployScheduledHosts":["n1"]}"#)
    );
    assert!(store.fetch::<Pod>(NAMESPACE, "web-7d9f-a").is_none());
}

#[tokio::test]
async fn test_budget_is_inclusive_then_frozen() {
    let store = Arc::new(MemoryStore::new());
    let rs = seed_web(
        &store,
        Some(r#"{"currentReschedulingTimes":4,"deployScheduledHosts":["n1"]}"#),
    );
    store.insert(failed_pod("web-7d9f-a", "n2", Duration::minutes(5), rs.clone()));
    let driver = driver(store.clone());

    // budget 2 x 2 replicas = 4; attempt 4 still retries.
    driver.run_pass(now()).await.expect("pass");
    assert_eq!(
        annotation(&web(&store), DEPLOY_LEDGER).as_deref(),
        Some(r#"{"currentReschedulingTimes":5,"deployScheduledHosts":["n1","n2"]}"#)
    );
    assert!(store.fetch::<Pod>(NAMESPACE, "web-7d9f-a").is_none());

    store.insert(failed_pod("web-7d9f-b", "n3", Duration::minutes(5), rs));
    store.clear_journal();
    let summary = driver.run_pass(now()).await.expect("pass");

    assert_eq!(summary.mutated, 1);
    assert_eq!(
        annotation(&web(&store), DEPLOY_LEDGER).as_deref(),
        Some(r#"{"currentReschedulingTimes":5,"deployScheduledHosts":null}"#)
    );
    assert!(
        store.fetch::<Pod>(NAMESPACE, "web-7d9f-b").is_some(),
        "frozen workloads keep their pods"
    );
    assert!(
        !store
            .journal()
            .iter()
            .any(|m| matches!(m, Mutation::Deleted { .. }))
    );

    // Frozen ledgers are not rewritten.
    store.clear_journal();
    let summary = driver.run_pass(now()).await.expect("pass");
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.mutated, 0);
    assert!(store.journal().is_empty());
}

#[tokio::test]
async fn test_outside_window_counts_but_forgets_hosts() {
    let store = Arc::new(MemoryStore::new());
    let rs = seed_web(
        &store,
        Some(r#"{"currentReschedulingTimes":1,"deployScheduledHosts":["n1"]}"#),
    );
    let age = Duration::minutes(30) + Duration::seconds(1);
    store.insert(failed_pod("web-7d9f-a", "n2", age, rs));

    driver(store.clone()).run_pass(now()).await.expect("pass");

    assert_eq!(
        annotation(&web(&store), DEPLOY_LEDGER).as_deref(),
        Some(r#"{"currentReschedulingTimes":2,"deployScheduledHosts":null}"#)
    );
    assert!(store.fetch::<Pod>(NAMESPACE, "web-7d9f-a").is_none());
}

#[tokio::test]
async fn test_just_inside_window_keeps_hosts() {
    let store = Arc::new(MemoryStore::new());
    let rs = seed_web(&store, None);
    let age = Duration::minutes(30) - Duration::seconds(1);
    store.insert(failed_pod("web-7d9f-a", "n2", age, rs));

    driver(store.clone()).run_pass(now()).await.expect("pass");

    assert_eq!(
        annotation(&web(&store), DEPLOY_LEDGER).as_deref(),
        Some(r#"{"currentReschedulingTimes":1,"deployScheduledHosts":["n2"]}"#)
    );
}

#[tokio::test]
async fn test_unschedulable_pod_releases_hosts() {
    let store = Arc::new(MemoryStore::new());
    let rs = seed_web(
        &store,
        Some(r#"{"currentReschedulingTimes":3,"deployScheduledHosts":["n1","n2"]}"#),
    );
    store.insert(unschedulable_pod("web-7d9f-a", r#"["n1","n2"]"#, rs));

    driver(store.clone()).run_pass(now()).await.expect("pass");

    assert_eq!(
        annotation(&web(&store), DEPLOY_LEDGER).as_deref(),
        Some(r#"{"currentReschedulingTimes":3,"deployScheduledHosts":null}"#)
    );
    assert!(store.fetch::<Pod>(NAMESPACE, "web-7d9f-a").is_none());
}

#[tokio::test]
async fn test_unmanaged_owner_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let deploy = store.insert(deployment("api", 1, &[]));
    let rs = store.insert(replica_set("api-5c", &deploy));
    store.insert(failed_pod("api-5c-a", "n1", Duration::minutes(1), controlled_by(&rs)));

    let summary = driver(store.clone()).run_pass(now()).await.expect("pass");

    assert_eq!(summary.skipped, 1);
    assert!(store.journal().is_empty());
    assert!(store.fetch::<Pod>(NAMESPACE, "api-5c-a").is_some());
}

#[tokio::test]
async fn test_healthy_pods_are_not_examined() {
    let store = Arc::new(MemoryStore::new());
    let rs = seed_web(&store, None);
    let mut pod = failed_pod("web-7d9f-a", "n1", Duration::minutes(1), rs);
    if let Some(conditions) = pod.status.as_mut().and_then(|s| s.conditions.as_mut()) {
        for c in conditions.iter_mut() {
            c.status = "True".to_string();
        }
    }
    store.insert(pod);

    let summary = driver(store.clone()).run_pass(now()).await.expect("pass");
    assert_eq!(summary, PassSummary::default());
}

#[tokio::test]
async fn test_conflicting_writes_are_retried() {
    let store = Arc::new(MemoryStore::new());
    let rs = seed_web(&store, None);
    store.insert(failed_pod("web-7d9f-a", "n1", Duration::minutes(1), rs));
    store.inject_conflicts::<Deployment>(NAMESPACE, "web", 3);

    let summary = driver(store.clone()).run_pass(now()).await.expect("pass");

    assert_eq!(summary.mutated, 1);
    assert_eq!(
        annotation(&web(&store), DEPLOY_LEDGER).as_deref(),
        Some(r#"{"currentReschedulingTimes":1,"deployScheduledHosts":["n1"]}"#)
    );
}

#[tokio::test]
async fn test_persistent_conflicts_fail_the_pod_only() {
    let store = Arc::new(MemoryStore::new());
    let rs = seed_web(&store, None);
    store.insert(failed_pod("web-7d9f-a", "n1", Duration::minutes(1), rs));
    store.inject_conflicts::<Deployment>(NAMESPACE, "web", 100);

    let summary = driver(store.clone()).run_pass(now()).await.expect("pass");

    assert_eq!(summary.failed, 1);
    assert!(annotation(&web(&store), DEPLOY_LEDGER).is_none());
    assert!(store.fetch::<Pod>(NAMESPACE, "web-7d9f-a").is_some());
}

#[tokio::test]
async fn test_statefulset_entries_are_preserved() {
    let store = Arc::new(MemoryStore::new());
    let other = r#"{"currentReschedulingTimes": 2, "podScheduledHosts": ["x"]}"#;
    let map = format!(r#"{{"web-1":{other}}}"#);
    let sts = store.insert(stateful_set(
        "web",
        &[("scheduling-retries", "3"), ("kse.com/sts-pods-map", map.as_str())],
    ));
    store.insert(failed_pod("web-0", "n1", Duration::minutes(1), controlled_by(&sts)));

    driver(store.clone()).run_pass(now()).await.expect("pass");

    let sts: StatefulSet = store.fetch(NAMESPACE, "web").expect("statefulset");
    let written = annotation(&sts, "kse.com/sts-pods-map").expect("ledger");
    assert_eq!(
        written,
        format!(
            r#"{{"web-0":{{"currentReschedulingTimes":1,"podScheduledHosts":["n1"]}},"web-1":{other}}}"#
        )
    );
    assert!(store.fetch::<Pod>(NAMESPACE, "web-0").is_none());
}

#[tokio::test]
async fn test_daemonset_counts_without_hosts() {
    let store = Arc::new(MemoryStore::new());
    let ds = store.insert(daemon_set("agent", &[("scheduling-retries", "3")]));
    store.insert(failed_pod("agent-x", "n1", Duration::minutes(1), controlled_by(&ds)));

    driver(store.clone()).run_pass(now()).await.expect("pass");

    let ds: DaemonSet = store.fetch(NAMESPACE, "agent").expect("daemonset");
    assert_eq!(
        annotation(&ds, "kse.com/current-retries-times").as_deref(),
        Some("1")
    );
    assert!(store.fetch::<Pod>(NAMESPACE, "agent-x").is_none());
}

#[tokio::test]
async fn test_job_is_recreated_with_ledger() {
    let store = Arc::new(MemoryStore::new());
    let job = store.insert(job("batch", &[("scheduling-retries", "1")]));
    let old_uid = job.metadata.uid.clone();
    store.insert(failed_pod("batch-q", "n1", Duration::minutes(1), controlled_by(&job)));

    let summary = driver(store.clone()).run_pass(now()).await.expect("pass");
    assert_eq!(summary.mutated, 1);

    let job: Job = store.fetch(NAMESPACE, "batch").expect("recreated job");
    assert_ne!(job.metadata.uid, old_uid);
    assert_eq!(
        annotation(&job, "kse.com/job").as_deref(),
        Some(r#"{"currentReschedulingTimes":1,"jobScheduledHosts":["n1"]}"#)
    );
    assert!(store.fetch::<Pod>(NAMESPACE, "batch-q").is_none());

    let journal = store.journal();
    let deleted = journal
        .iter()
        .position(|m| matches!(m, Mutation::Deleted { kind, .. } if kind == "Job"));
    let created = journal
        .iter()
        .position(|m| matches!(m, Mutation::Created { kind, .. } if kind == "Job"));
    assert!(deleted.is_some() && created.is_some());
    assert!(deleted < created, "delete happens before create");
}

#[tokio::test]
async fn test_cronjob_pod_recreates_the_cronjob() {
    let store = Arc::new(MemoryStore::new());
    let cj = store.insert(cron_job("nightly", &[("scheduling-retries", "2")]));
    let job = store.insert(job_owned_by("nightly-2890", &cj));
    store.insert(failed_pod("nightly-2890-z", "n4", Duration::minutes(1), controlled_by(&job)));

    driver(store.clone()).run_pass(now()).await.expect("pass");

    let cj: CronJob = store.fetch(NAMESPACE, "nightly").expect("cronjob");
    assert_eq!(
        annotation(&cj, "kse.com/cj").as_deref(),
        Some(r#"{"currentReschedulingTimes":1,"cjScheduledHosts":["n4"]}"#)
    );
    assert!(store.fetch::<Job>(NAMESPACE, "nightly-2890").is_none());
}

#[tokio::test]
async fn test_bare_pod_is_recreated_with_hint() {
    let store = Arc::new(MemoryStore::new());
    let mut pod = failed_pod(
        "solo",
        "n1",
        Duration::minutes(1),
        OwnerReference::default(),
    );
    pod.metadata.owner_references = None;
    pod.metadata.annotations = annotations(&[("scheduling-retries", "1")]);
    store.insert(pod);

    driver(store.clone()).run_pass(now()).await.expect("pass");

    let pod: Pod = store.fetch(NAMESPACE, "solo").expect("recreated pod");
    assert_eq!(
        annotation(&pod, "kse.com/pod").as_deref(),
        Some(r#"{"currentReschedulingTimes":1,"podScheduledHosts":["n1"]}"#)
    );
    assert_eq!(
        annotation(&pod, "kse.com/scheduled-hosts").as_deref(),
        Some(r#"["n1"]"#)
    );
    assert!(pod.spec.and_then(|s| s.node_name).is_none());
    assert!(pod.status.is_none());
}

#[tokio::test]
async fn test_foreign_owner_kind_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let owner = OwnerReference {
        api_version: "argoproj.io/v1alpha1".to_string(),
        kind: "Rollout".to_string(),
        name: "canary".to_string(),
        uid: "rollout-uid".to_string(),
        controller: Some(true),
        ..Default::default()
    };
    store.insert(failed_pod("canary-x", "n1", Duration::minutes(1), owner));

    let summary = driver(store.clone()).run_pass(now()).await.expect("pass");

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);
}
