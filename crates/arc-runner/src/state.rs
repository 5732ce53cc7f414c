//! Derived reconciliation states
//!
//! Nothing here is persisted. Each pass recomputes the state of a Runner from
//! its spec, status, owned pod and the registration service, so a pass can be
//! repeated or interrupted at any point without losing progress.

use std::time::Duration;

use arc_common::crd::{Runner, LABEL_KEY_POD_TEMPLATE_HASH, RUNNER_CONTAINER_NAME};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::config::ReconcilerConfig;

const POD_PHASE_SUCCEEDED: &str = "Succeeded";

/// Where a Runner stands, in precedence order
#[derive(Clone, Debug, PartialEq)]
pub enum RunnerState {
    /// The spec is invalid; nothing is done until it is fixed
    Unvalidated {
        /// Validation failure
        message: String,
    },
    /// Live runner without the cleanup finalizer
    AwaitingFinalizer,
    /// Deletion requested; deregistration pending
    Deleting {
        /// Whether a registration token was ever issued
        registered: bool,
    },
    /// Deletion requested and cleanup already done
    Deleted,
    /// No backing pod exists
    NoPod,
    /// Backing pod is terminating within its grace window
    PodTerminatingGraceful {
        /// Time left before forced deletion
        remaining: Duration,
    },
    /// Backing pod overstayed its grace window
    PodTerminatingForced {
        /// How far past the window the pod is
        overdue: Duration,
    },
    /// Backing pod is live
    PodLive,
}

/// Why a live pod must be replaced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartReason {
    /// The runner agent finished its run
    RunCompleted,
    /// The desired pod differs from the live one
    SpecDrift,
    /// The runner never showed up in the registration service
    RegistrationTimeout,
    /// The runner stayed offline past the registration timeout
    OfflineTimeout,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::RunCompleted => f.write_str("run completed"),
            RestartReason::SpecDrift => f.write_str("pod template changed"),
            RestartReason::RegistrationTimeout => f.write_str("registration timed out"),
            RestartReason::OfflineTimeout => f.write_str("runner offline past registration timeout"),
        }
    }
}

/// What the registration service said about a runner
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationObservation {
    /// Registered, online, running a job
    Busy,
    /// Registered, online, idle
    Idle,
    /// Not registered
    NotFound,
    /// Registered but disconnected
    Offline,
}

impl RegistrationObservation {
    fn is_busy(self) -> bool {
        matches!(self, RegistrationObservation::Busy)
    }
}

/// Outcome of checking a live pod
#[derive(Clone, Debug, PartialEq)]
pub enum LiveAssessment {
    /// Nothing to do beyond mirroring pod state into status
    Stable,
    /// Still coming online; check again later
    AwaitingRegistration {
        /// When to check again
        recheck_after: Duration,
    },
    /// Replace the pod
    RestartPending {
        /// Why
        reason: RestartReason,
    },
}

/// States decided from the Runner alone, before the pod is consulted
pub fn lifecycle_state(runner: &Runner) -> Option<RunnerState> {
    if let Err(e) = runner.spec.validate() {
        return Some(RunnerState::Unvalidated { message: e });
    }

    match (runner.is_being_deleted(), runner.has_finalizer()) {
        (false, false) => Some(RunnerState::AwaitingFinalizer),
        (true, true) => Some(RunnerState::Deleting {
            registered: runner.registration_token().is_some(),
        }),
        (true, false) => Some(RunnerState::Deleted),
        (false, true) => None,
    }
}

/// Classify a Runner and its owned pod
pub fn classify(
    runner: &Runner,
    pod: Option<&Pod>,
    now: DateTime<Utc>,
    config: &ReconcilerConfig,
) -> RunnerState {
    if let Some(state) = lifecycle_state(runner) {
        return state;
    }

    let Some(pod) = pod else {
        return RunnerState::NoPod;
    };

    let Some(deleted_at) = pod.metadata.deletion_timestamp.as_ref() else {
        return RunnerState::PodLive;
    };

    let deadline = add(deleted_at.0, config.pod_deletion_timeout);
    if now > deadline {
        RunnerState::PodTerminatingForced {
            overdue: (now - deadline).to_std().unwrap_or_default(),
        }
    } else {
        RunnerState::PodTerminatingGraceful {
            remaining: (deadline - now).to_std().unwrap_or_default(),
        }
    }
}

/// Whether the runner agent finished its run
///
/// True when the pod succeeded or the runner container exited cleanly.
pub fn pod_run_completed(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };

    if status.phase.as_deref() == Some(POD_PHASE_SUCCEEDED) {
        return true;
    }

    status
        .container_statuses
        .iter()
        .flatten()
        .filter(|cs| cs.name == RUNNER_CONTAINER_NAME)
        .filter_map(|cs| cs.state.as_ref()?.terminated.as_ref())
        .any(|t| t.exit_code == 0)
}

/// Whether the pod has had longer than `timeout` to register
pub fn registration_timed_out(pod: &Pod, now: DateTime<Utc>, timeout: Duration) -> bool {
    pod.metadata
        .creation_timestamp
        .as_ref()
        .is_some_and(|created| now > add(created.0, timeout))
}

/// Drift-detection digest stamped on a pod
pub fn pod_template_hash(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()?
        .get(LABEL_KEY_POD_TEMPLATE_HASH)
        .map(String::as_str)
}

/// Earliest time the registration service may be asked about this runner again
pub fn next_registration_check(runner: &Runner, interval: Duration) -> Option<DateTime<Utc>> {
    runner
        .last_registration_check_time()
        .map(|last| add(last, interval))
}

/// Decide whether a live pod must be replaced
///
/// A busy runner is never replaced for drift. A runner that is missing or
/// offline gets until `timed_out` before it is replaced, and a recheck is
/// scheduled meanwhile.
pub fn assess_registration(
    observation: RegistrationObservation,
    drift: bool,
    timed_out: bool,
    recheck_after: Duration,
) -> LiveAssessment {
    let coming_online = matches!(
        observation,
        RegistrationObservation::NotFound | RegistrationObservation::Offline
    );

    if drift && !observation.is_busy() {
        return LiveAssessment::RestartPending {
            reason: RestartReason::SpecDrift,
        };
    }

    match (observation, timed_out) {
        (RegistrationObservation::NotFound, true) => LiveAssessment::RestartPending {
            reason: RestartReason::RegistrationTimeout,
        },
        (RegistrationObservation::Offline, true) => LiveAssessment::RestartPending {
            reason: RestartReason::OfflineTimeout,
        },
        _ if coming_online => LiveAssessment::AwaitingRegistration { recheck_after },
        _ => LiveAssessment::Stable,
    }
}

/// Whether status already mirrors the pod's phase, reason and message
pub fn status_mirrors_pod(runner: &Runner, pod: &Pod) -> bool {
    let (phase, reason, message) = runner.observed_pod_state();
    let pod_status = pod.status.as_ref();
    phase == pod_status.and_then(|s| s.phase.as_deref())
        && reason == pod_status.and_then(|s| s.reason.as_deref())
        && message == pod_status.and_then(|s| s.message.as_deref())
}

fn add(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
