//! Pod rescheduler: retry ledger and reconciliation engine.
//!
//! Workloads opt in with a `scheduling-retries` annotation. When one of
//! their pods is stuck (unschedulable, or scheduled but unhealthy) the
//! driver records the attempt and the failed node in a ledger annotation
//! on the owner, then evicts the pod so it is placed again. New pods get
//! a `kse.com/scheduled-hosts` hint from the admission webhook, and the
//! scheduler extender filters those nodes out. Once the budget is spent
//! the ledger is frozen and the workload is left alone.
//!
//! # Example
//!
//! ```yaml
//! apiVersion: apps/v1
//! kind: Deployment
//! metadata:
//!   name: web
//!   annotations:
//!     scheduling-retries: "2"
//! ```
//!
//! # Binaries
//!
//! - **rescheduler-operator**: leader-elected reconciliation driver
//! - **rescheduler-webhook**: admission webhook and scheduler extender

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admission;
pub mod audit;
pub mod classify;
pub mod config;
pub mod controller;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod owner;
pub mod policy;
pub mod retry;
pub mod server;
pub mod store;
pub mod telemetry;

pub use error::{OperatorError, OperatorResult};
