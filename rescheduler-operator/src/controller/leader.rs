//! Lease-based leader election.
//!
//! One replica holds the `coordination.k8s.io/v1` Lease and runs the
//! reconciliation driver. The holder renews every `retry_period`; if it
//! cannot renew within `renew_deadline` it stops leading. Other replicas
//! take over once `lease_duration` has passed without a renewal.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{OperatorError, OperatorResult};
use crate::store::ObjectStore;

/// Lease and timing parameters.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Lease object name.
    pub lease_name: String,
    /// Namespace holding the lease.
    pub namespace: String,
    /// Identity written as the lease holder.
    pub identity: String,
    /// How long a lease is valid after a renewal.
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before giving up.
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts.
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    /// Config with the default timings (15s / 10s / 2s).
    pub fn new(
        lease_name: impl Into<String>,
        namespace: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            lease_name: lease_name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    /// Timings must satisfy `lease_duration > renew_deadline > retry_period`.
    pub fn validate(&self) -> OperatorResult<()> {
        if self.identity.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "leader election identity must not be empty".to_string(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(OperatorError::InvalidConfig(
                "lease duration must be greater than renew deadline".to_string(),
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(OperatorError::InvalidConfig(
                "renew deadline must be greater than retry period".to_string(),
            ));
        }
        Ok(())
    }
}

/// Campaigns for a Lease and runs a task while holding it.
pub struct LeaderElector<S> {
    store: S,
    config: LeaderElectionConfig,
}

impl<S: ObjectStore> LeaderElector<S> {
    /// Create an elector.
    pub fn new(store: S, config: LeaderElectionConfig) -> Self {
        Self { store, config }
    }

    /// Election parameters.
    pub fn config(&self) -> &LeaderElectionConfig {
        &self.config
    }

    /// Acquire the lease if free or expired, or renew it if already held.
    ///
    /// Returns `false` when another live holder owns it or a concurrent
    /// writer won the race.
    pub async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> OperatorResult<bool> {
        let cfg = &self.config;
        let existing: Option<Lease> = self.store.get(&cfg.namespace, &cfg.lease_name).await?;

        let Some(mut lease) = existing else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(cfg.lease_name.clone()),
                    namespace: Some(cfg.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(cfg.identity.clone()),
                    lease_duration_seconds: Some(self.lease_seconds()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return match self.store.create(&cfg.namespace, &lease).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_already_exists() || e.is_conflict() => Ok(false),
                Err(e) => Err(e),
            };
        };

        let spec = lease.spec.get_or_insert_with(Default::default);
        let holder = spec.holder_identity.as_deref().unwrap_or_default();
        let held_by_us = holder == cfg.identity;

        if !held_by_us && !holder.is_empty() && !lease_expired(spec, now) {
            return Ok(false);
        }

        if !held_by_us {
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.holder_identity = Some(cfg.identity.clone());
        spec.lease_duration_seconds = Some(self.lease_seconds());
        spec.renew_time = Some(MicroTime(now));

        match self.store.replace(&cfg.namespace, &lease).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Give up the lease if we hold it, so a successor need not wait for
    /// expiry.
    pub async fn release(&self) -> OperatorResult<()> {
        let cfg = &self.config;
        let Some(mut lease) = self
            .store
            .get::<Lease>(&cfg.namespace, &cfg.lease_name)
            .await?
        else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(cfg.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        self.store.replace(&cfg.namespace, &lease).await?;
        Ok(())
    }

    /// Campaign until `token` is cancelled. Each time leadership is gained,
    /// `lead` is spawned with a child token that is cancelled when
    /// leadership is lost. If the task ends on its own while the lease is
    /// held, the lease is released and the elector waits one retry period
    /// before campaigning again. The lease is released on shutdown.
    pub async fn run<F, Fut>(&self, token: CancellationToken, mut lead: F) -> OperatorResult<()>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cfg = &self.config;
        loop {
            if !self.campaign(&token).await {
                break;
            }
            tracing::info!(identity = %cfg.identity, lease = %cfg.lease_name, "Acquired leadership");

            let leading = token.child_token();
            let mut task = tokio::spawn(lead(leading.clone()));
            let ended = self.hold(&token, &mut task).await;
            leading.cancel();

            match ended {
                HoldEnd::TaskExited(result) => {
                    match result {
                        Ok(()) => tracing::error!(
                            identity = %cfg.identity,
                            "Leader task exited while holding the lease"
                        ),
                        Err(e) => tracing::error!(
                            identity = %cfg.identity,
                            error = %e,
                            "Leader task panicked"
                        ),
                    }
                    if let Err(e) = self.release().await {
                        tracing::warn!(error = %e, "Failed to release lease");
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(cfg.retry_period) => {}
                    }
                    tracing::warn!(identity = %cfg.identity, "Stepped down; campaigning again");
                }
                HoldEnd::Cancelled | HoldEnd::Lost => {
                    if let Err(e) = task.await {
                        tracing::error!(error = %e, "Leader task panicked");
                    }
                    if token.is_cancelled() {
                        break;
                    }
                    tracing::warn!(identity = %cfg.identity, "Lost leadership; campaigning again");
                }
            }
        }

        if let Err(e) = self.release().await {
            tracing::warn!(error = %e, "Failed to release lease");
        }
        tracing::info!(identity = %cfg.identity, "Leader election stopped");
        Ok(())
    }

    /// Poll until the lease is ours. Returns `false` if cancelled first.
    async fn campaign(&self, token: &CancellationToken) -> bool {
        loop {
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => return true,
                Ok(false) => tracing::trace!("Lease held by another replica"),
                Err(e) => tracing::warn!(error = %e, "Failed to acquire lease"),
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew until leadership is lost, `token` is cancelled, or the
    /// leader task finishes.
    async fn hold(&self, token: &CancellationToken, task: &mut JoinHandle<()>) -> HoldEnd {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = token.cancelled() => return HoldEnd::Cancelled,
                result = &mut *task => return HoldEnd::TaskExited(result),
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => last_renewal = Instant::now(),
                Ok(false) => return HoldEnd::Lost,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to renew lease");
                    if last_renewal.elapsed() >= self.config.renew_deadline {
                        return HoldEnd::Lost;
                    }
                }
            }
        }
    }

    fn lease_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

/// Why [`LeaderElector::hold`] returned.
enum HoldEnd {
    Cancelled,
    Lost,
    TaskExited(Result<(), JoinError>),
}

fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let Some(renewed) = spec.renew_time.as_ref() else {
        return true;
    };
    let duration = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    renewed.0 + duration <= now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("timestamp")
    }

    fn elector(store: &Arc<MemoryStore>, identity: &str) -> LeaderElector<Arc<MemoryStore>> {
        LeaderElector::new(
            store.clone(),
            LeaderElectionConfig::new("kse-rescheduler", "kube-system", identity),
        )
    }

    fn lease(store: &MemoryStore) -> LeaseSpec {
        store
            .fetch::<Lease>("kube-system", "kse-rescheduler")
            .and_then(|l| l.spec)
            .expect("lease")
    }

    #[test]
    fn default_timings_are_valid() {
        LeaderElectionConfig::new("l", "ns", "me")
            .validate()
            .expect("defaults");

        let mut cfg = LeaderElectionConfig::new("l", "ns", "me");
        cfg.renew_deadline = cfg.lease_duration;
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn first_candidate_creates_the_lease() {
        let store = Arc::new(MemoryStore::new());
        assert!(elector(&store, "a").try_acquire_or_renew(at(0)).await.expect("acquire"));

        let spec = lease(&store);
        assert_eq!(spec.holder_identity.as_deref(), Some("a"));
        assert_eq!(spec.lease_duration_seconds, Some(15));
        assert_eq!(spec.lease_transitions, Some(0));
    }

    #[tokio::test]
    async fn live_lease_is_respected_and_expired_lease_is_taken() {
        let store = Arc::new(MemoryStore::new());
        let a = elector(&store, "a");
        let b = elector(&store, "b");

        assert!(a.try_acquire_or_renew(at(0)).await.expect("a acquires"));
        assert!(!b.try_acquire_or_renew(at(10)).await.expect("b waits"));
        assert!(a.try_acquire_or_renew(at(12)).await.expect("a renews"));
        assert!(!b.try_acquire_or_renew(at(26)).await.expect("still live"));

        assert!(b.try_acquire_or_renew(at(27)).await.expect("b takes over"));
        let spec = lease(&store);
        assert_eq!(spec.holder_identity.as_deref(), Some("b"));
        assert_eq!(spec.lease_transitions, Some(1));
        assert_eq!(spec.acquire_time, Some(MicroTime(at(27))));

        assert!(!a.try_acquire_or_renew(at(28)).await.expect("a lost"));
    }

    #[tokio::test]
    async fn release_frees_the_lease() {
        let store = Arc::new(MemoryStore::new());
        let a = elector(&store, "a");
        let b = elector(&store, "b");

        assert!(a.try_acquire_or_renew(at(0)).await.expect("acquire"));
        b.release().await.expect("non-holder release is a no-op");
        assert_eq!(lease(&store).holder_identity.as_deref(), Some("a"));

        a.release().await.expect("release");
        assert_eq!(lease(&store).holder_identity, None);
        assert!(b.try_acquire_or_renew(at(1)).await.expect("b acquires"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_leads_until_cancelled_then_releases() {
        let store = Arc::new(MemoryStore::new());
        let a = elector(&store, "a");
        let token = CancellationToken::new();
        let started = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));

        let run = {
            let token = token.clone();
            let started = started.clone();
            let stopped = stopped.clone();
            async move {
                a.run(token, move |lead| {
                    let started = started.clone();
                    let stopped = stopped.clone();
                    async move {
                        started.store(true, Ordering::SeqCst);
                        lead.cancelled().await;
                        stopped.store(true, Ordering::SeqCst);
                    }
                })
                .await
            }
        };
        let handle = tokio::spawn(run);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(lease(&store).holder_identity.as_deref(), Some("a"));

        token.cancel();
        handle.await.expect("join").expect("run");
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(lease(&store).holder_identity, None);
    }

    fn crash() {
        panic!("driver crashed");
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_leader_task_steps_down_and_relaunches() {
        let store = Arc::new(MemoryStore::new());
        let a = elector(&store, "a");
        let token = CancellationToken::new();
        let launches = Arc::new(AtomicUsize::new(0));

        let run = {
            let token = token.clone();
            let launches = launches.clone();
            async move {
                a.run(token, move |_lead| {
                    let launches = launches.clone();
                    async move {
                        launches.fetch_add(1, Ordering::SeqCst);
                        crash();
                    }
                })
                .await
            }
        };
        let handle = tokio::spawn(run);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert_eq!(lease(&store).holder_identity, None);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(launches.load(Ordering::SeqCst) >= 2);

        token.cancel();
        handle.await.expect("join").expect("run");
        assert_eq!(lease(&store).holder_identity, None);
    }

    #[tokio::test(start_paused = true)]
    async fn leader_task_returning_early_releases_the_lease() {
        let store = Arc::new(MemoryStore::new());
        let a = elector(&store, "a");
        let b = elector(&store, "b");
        let token = CancellationToken::new();

        let run = {
            let token = token.clone();
            async move { a.run(token, |_lead| async {}).await }
        };
        let handle = tokio::spawn(run);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(lease(&store).holder_identity, None);
        assert!(b.try_acquire_or_renew(Utc::now()).await.expect("b acquires"));

        token.cancel();
        handle.await.expect("join").expect("run");
        assert_eq!(lease(&store).holder_identity.as_deref(), Some("b"));
    }
}
