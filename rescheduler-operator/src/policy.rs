//! Reconciliation policy: the decision table mapping a ledger and a pod's
//! scheduling signals to the next action.
//!
//! | Condition                                  | Within window            | Outside window      |
//! |--------------------------------------------|--------------------------|---------------------|
//! | no ledger, scheduled                       | attempts=1, hosts={node} | attempts=1, hosts={} |
//! | ledger, scheduled, 1 <= attempts <= budget | attempts+1, hosts+=node  | attempts+1, hosts={} |
//! | ledger, scheduled, attempts > budget       | freeze: hosts={}         | same                |
//! | ledger, unschedulable                      | release: hosts={}        | same                |
//! | otherwise                                  | no-op                    | no-op               |

use crate::classify::PodSignals;
use crate::ledger::Ledger;

/// Everything [`decide`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    /// Ledger currently persisted for the pod's owner, if any.
    pub ledger: Option<&'a Ledger>,
    /// Scheduling signals of the pod.
    pub signals: PodSignals,
    /// Effective retry budget (already scaled by replicas where applicable).
    pub budget: i64,
    /// Pod creation is within the retry window.
    pub within_window: bool,
    /// Node the pod is bound to.
    pub node: Option<&'a str>,
    /// Ledger layout can hold excluded hosts.
    pub tracks_hosts: bool,
}

/// Next step for a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do.
    Noop,
    /// Record the placement and evict so the pod lands elsewhere.
    Retry(Ledger),
    /// Count the attempt and evict, without tracking hosts.
    Expire(Ledger),
    /// Budget exhausted: drop the excluded hosts and keep the pod where it is.
    Freeze(Ledger),
    /// The hint made the pod unschedulable: drop the hosts and evict.
    Release(Ledger),
}

impl Action {
    /// Ledger to persist, if any.
    pub fn ledger(&self) -> Option<&Ledger> {
        match self {
            Action::Noop => None,
            Action::Retry(l) | Action::Expire(l) | Action::Freeze(l) | Action::Release(l) => {
                Some(l)
            }
        }
    }

    /// Whether applying the action removes the current pod.
    pub fn evicts(&self) -> bool {
        matches!(
            self,
            Action::Retry(_) | Action::Expire(_) | Action::Release(_)
        )
    }

    /// Short name for logs and audit records.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Noop => "noop",
            Action::Retry(_) => "retry",
            Action::Expire(_) => "expire",
            Action::Freeze(_) => "freeze",
            Action::Release(_) => "release",
        }
    }
}

/// Decide the next action.
pub fn decide(input: PolicyInput<'_>) -> Action {
    if input.signals.has_scheduled {
        return decide_scheduled(&input);
    }

    if input.signals.unschedulable {
        return match input.ledger {
            Some(ledger) => Action::Release(Ledger::cleared(ledger.attempts)),
            None => Action::Noop,
        };
    }

    Action::Noop
}

fn decide_scheduled(input: &PolicyInput<'_>) -> Action {
    let record_hosts = input.within_window && input.tracks_hosts;

    let (attempts, mut hosts) = match input.ledger {
        None => (1, Default::default()),
        Some(ledger) if ledger.attempts == 0 => return Action::Noop,
        Some(ledger) if i64::from(ledger.attempts) <= input.budget => (
            ledger.attempts.saturating_add(1),
            if record_hosts {
                ledger.excluded_hosts.clone()
            } else {
                Default::default()
            },
        ),
        Some(ledger) => {
            let frozen = Ledger::cleared(ledger.attempts);
            return if frozen == *ledger {
                Action::Noop
            } else {
                Action::Freeze(frozen)
            };
        }
    };

    if let Some(node) = input.node.filter(|_| record_hosts) {
        hosts.insert(node.to_string());
    }

    let next = Ledger {
        attempts,
        excluded_hosts: hosts,
    };
    if input.within_window {
        Action::Retry(next)
    } else {
        Action::Expire(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SCHEDULED: PodSignals = PodSignals {
        has_scheduled: true,
        unschedulable: false,
    };
    const UNSCHEDULABLE: PodSignals = PodSignals {
        has_scheduled: false,
        unschedulable: true,
    };

    fn ledger(attempts: u32, hosts: &[&str]) -> Ledger {
        Ledger {
            attempts,
            excluded_hosts: hosts.iter().map(|h| h.to_string()).collect(),
        }
    }

    fn input<'a>(ledger: Option<&'a Ledger>, signals: PodSignals) -> PolicyInput<'a> {
        PolicyInput {
            ledger,
            signals,
            budget: 4,
            within_window: true,
            node: Some("n2"),
            tracks_hosts: true,
        }
    }

    #[test]
    fn first_retry_records_node() {
        assert_eq!(
            decide(input(None, SCHEDULED)),
            Action::Retry(ledger(1, &["n2"]))
        );
    }

    #[test]
    fn first_retry_outside_window_skips_hosts() {
        let mut i = input(None, SCHEDULED);
        i.within_window = false;
        assert_eq!(decide(i), Action::Expire(ledger(1, &[])));
    }

    #[test]
    fn retry_grows_hosts_up_to_budget_inclusive() {
        let current = ledger(4, &["n1"]);
        let action = decide(input(Some(&current), SCHEDULED));
        assert_eq!(action, Action::Retry(ledger(5, &["n1", "n2"])));
        assert!(action.evicts());
    }

    #[test]
    fn expire_counts_but_clears_hosts() {
        let current = ledger(2, &["n1"]);
        let mut i = input(Some(&current), SCHEDULED);
        i.within_window = false;
        assert_eq!(decide(i), Action::Expire(ledger(3, &[])));
    }

    #[test]
    fn over_budget_freezes_without_eviction() {
        let current = ledger(5, &["n1", "n2"]);
        let action = decide(input(Some(&current), SCHEDULED));
        assert_eq!(action, Action::Freeze(ledger(5, &[])));
        assert!(!action.evicts());
    }

    #[test]
    fn frozen_ledger_is_stable() {
        let current = ledger(5, &[]);
        assert_eq!(decide(input(Some(&current), SCHEDULED)), Action::Noop);
    }

    #[test]
    fn zero_attempts_is_noop() {
        let current = ledger(0, &[]);
        assert_eq!(decide(input(Some(&current), SCHEDULED)), Action::Noop);
    }

    #[test]
    fn unschedulable_releases_existing_ledger() {
        let current = ledger(2, &["n1", "n2"]);
        let action = decide(input(Some(&current), UNSCHEDULABLE));
        assert_eq!(action, Action::Release(ledger(2, &[])));
        assert!(action.evicts());

        assert_eq!(decide(input(None, UNSCHEDULABLE)), Action::Noop);
    }

    #[test]
    fn scheduled_wins_over_unschedulable() {
        let both = PodSignals {
            has_scheduled: true,
            unschedulable: true,
        };
        let current = ledger(1, &[]);
        assert_eq!(
            decide(input(Some(&current), both)),
            Action::Retry(ledger(2, &["n2"]))
        );
    }

    #[test]
    fn counter_schema_never_records_hosts() {
        let current = ledger(1, &[]);
        let mut i = input(Some(&current), SCHEDULED);
        i.tracks_hosts = false;
        assert_eq!(decide(i), Action::Retry(ledger(2, &[])));
    }

    #[test]
    fn neither_signal_is_noop() {
        let current = ledger(1, &["n1"]);
        assert_eq!(
            decide(input(Some(&current), PodSignals::default())),
            Action::Noop
        );
    }

    #[test]
    fn attempts_never_exceed_budget_plus_one() {
        let budget = 6;
        let mut current: Option<Ledger> = None;
        for pass in 0..20 {
            let node = format!("n{pass}");
            let action = decide(PolicyInput {
                ledger: current.as_ref(),
                signals: SCHEDULED,
                budget,
                within_window: true,
                node: Some(&node),
                tracks_hosts: true,
            });
            if let Some(next) = action.ledger() {
                current = Some(next.clone());
            }
        }
        let last = current.expect("ledger");
        assert_eq!(i64::from(last.attempts), budget + 1);
        assert!(last.excluded_hosts.is_empty());
    }
}
