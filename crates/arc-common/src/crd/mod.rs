//! Custom Resource Definitions for the runner operator
//!
//! This module contains all CRD definitions used by the operator.

mod autoscaler;
mod runner;

pub use autoscaler::{
    CacheEntry, CapacityReservation, CheckRunSpec, GitHubEventScaleUpTriggerSpec,
    HorizontalRunnerAutoscaler, HorizontalRunnerAutoscalerSpec, HorizontalRunnerAutoscalerStatus,
    MetricSpec, PullRequestSpec, PushSpec, ScaleTargetRef, ScaleUpTrigger,
    AUTOSCALING_METRIC_TYPE_PERCENTAGE_RUNNERS_BUSY,
    AUTOSCALING_METRIC_TYPE_TOTAL_NUMBER_OF_QUEUED_AND_IN_PROGRESS_WORKFLOW_RUNS,
    CACHE_ENTRY_KEY_DESIRED_REPLICAS,
};
pub use runner::{
    Runner, RunnerSpec, RunnerStatus, RunnerStatusRegistration, LABEL_KEY_POD_TEMPLATE_HASH,
    LABEL_KEY_RUNNER_TEMPLATE_HASH, RUNNER_CONTAINER_NAME, RUNNER_FINALIZER,
};
