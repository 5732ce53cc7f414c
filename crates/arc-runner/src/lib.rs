//! Runner reconciliation controller
//!
//! Keeps every Runner backed by one pod running the runner agent and keeps
//! the registration service's view of the runner consistent with it.

#![deny(missing_docs)]

pub mod backoff;
pub mod config;
pub mod controller;
pub mod pod;
pub mod registration;
pub mod state;

#[cfg(test)]
mod testing;

pub use backoff::ErrorBackoff;
pub use config::{PodDefaults, ReconcilerConfig};
pub use controller::{error_policy, reconcile, Clock, Context, ContextBuilder, SystemClock};
pub use pod::{build_pod, pod_template_hash};
