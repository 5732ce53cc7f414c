//! Reconciler timing and pod defaults
//!
//! Every delay the controller uses is a named field here so the operator can
//! override it from the command line. Defaults match the upstream controller.

use std::time::Duration;

use rand::Rng;

/// Default job working directory inside the runner container
pub const DEFAULT_WORK_DIR: &str = "/runner/_work";

/// Default runner agent image
pub const DEFAULT_RUNNER_IMAGE: &str = "summerwind/actions-runner:latest";

/// Default docker-in-docker sidecar image
pub const DEFAULT_DOCKER_IMAGE: &str = "docker:dind";

/// Timing knobs for the Runner reconciler
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcilerConfig {
    /// How long a terminating pod may linger before it is force-deleted
    pub pod_deletion_timeout: Duration,
    /// How long a new pod has to show up in the registration service
    pub registration_timeout: Duration,
    /// Minimum spacing between registration checks for one runner
    pub registration_check_interval: Duration,
    /// Base of the jitter added to a scheduled registration recheck
    pub registration_recheck_jitter: Duration,
    /// Jitter factor applied to `registration_recheck_jitter`
    pub jitter_factor: f64,
    /// Requeue delay after a registration service rate limit
    pub rate_limit_retry_delay: Duration,
    /// Requeue delay after a create hit an existing pod
    pub pod_exists_retry_delay: Duration,
    /// Requeue delay after a forced pod deletion
    pub forced_deletion_requeue: Duration,
    /// First error backoff step
    pub error_backoff_base: Duration,
    /// Error backoff ceiling
    pub error_backoff_max: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            pod_deletion_timeout: Duration::from_secs(60),
            registration_timeout: Duration::from_secs(10 * 60),
            registration_check_interval: Duration::from_secs(60),
            registration_recheck_jitter: Duration::from_secs(10),
            jitter_factor: 0.1,
            rate_limit_retry_delay: Duration::from_secs(30),
            pod_exists_retry_delay: Duration::from_secs(10),
            forced_deletion_requeue: Duration::from_secs(3),
            error_backoff_base: Duration::from_millis(5),
            error_backoff_max: Duration::from_secs(1000),
        }
    }
}

impl ReconcilerConfig {
    /// Delay before the next registration check for a runner still coming online
    pub fn registration_recheck_delay(&self) -> Duration {
        self.registration_check_interval
            + jitter(self.registration_recheck_jitter, self.jitter_factor)
    }
}

/// Images and paths the pod builder falls back to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodDefaults {
    /// Runner agent image when the Runner names none
    pub runner_image: String,
    /// Image of the docker sidecar
    pub docker_image: String,
    /// Working directory when the Runner names none
    pub work_dir: String,
}

impl Default for PodDefaults {
    fn default() -> Self {
        Self {
            runner_image: DEFAULT_RUNNER_IMAGE.to_string(),
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            work_dir: DEFAULT_WORK_DIR.to_string(),
        }
    }
}

/// Return a duration in `[base, base + factor * base)`
///
/// A non-positive factor is treated as 1.0.
pub fn jitter(base: Duration, factor: f64) -> Duration {
    let factor = if factor <= 0.0 { 1.0 } else { factor };
    let extra = rand::thread_rng().gen::<f64>() * factor;
    base + base.mul_f64(extra)
}
