//! HorizontalRunnerAutoscaler CRD
//!
//! Only the data model lives here. The scaling engine that fills in
//! `desiredReplicas` and the cache entries runs elsewhere; the operator
//! only installs the CRD.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cache key under which the last computed replica count is stored
pub const CACHE_ENTRY_KEY_DESIRED_REPLICAS: &str = "desiredReplicas";

/// Metric type scaling on the fraction of busy runners
pub const AUTOSCALING_METRIC_TYPE_PERCENTAGE_RUNNERS_BUSY: &str = "PercentageRunnersBusy";

/// Metric type scaling on queued plus in-progress workflow runs
pub const AUTOSCALING_METRIC_TYPE_TOTAL_NUMBER_OF_QUEUED_AND_IN_PROGRESS_WORKFLOW_RUNS: &str =
    "TotalNumberOfQueuedAndInProgressWorkflowRuns";

/// HorizontalRunnerAutoscaler scales a runner deployment between bounds.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "actions.summerwind.dev",
    version = "v1alpha1",
    kind = "HorizontalRunnerAutoscaler",
    shortname = "hra",
    namespaced,
    status = "HorizontalRunnerAutoscalerStatus",
    printcolumn = r#"{"name":"Min","type":"number","jsonPath":".spec.minReplicas"}"#,
    printcolumn = r#"{"name":"Max","type":"number","jsonPath":".spec.maxReplicas"}"#,
    printcolumn = r#"{"name":"Desired","type":"number","jsonPath":".status.desiredReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalRunnerAutoscalerSpec {
    /// The runner deployment to scale
    #[serde(default)]
    pub scale_target_ref: ScaleTargetRef,

    /// Lower replica bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper replica bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Minimum wait after a scale out before scaling down
    #[serde(
        rename = "scaleDownDelaySecondsAfterScaleOut",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub scale_down_delay_seconds_after_scale_out: Option<i32>,

    /// Metrics driving the replica count
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,

    /// Webhook-driven scale up triggers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scale_up_triggers: Vec<ScaleUpTrigger>,

    /// Temporary extra capacity
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capacity_reservations: Vec<CapacityReservation>,
}

/// Reference to the scaled resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// Resource name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// One scaling metric
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    /// Metric type, e.g. `PercentageRunnersBusy`
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub metric_type: String,

    /// Repositories whose workflow runs are counted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repository_names: Vec<String>,

    /// Busy ratio above which to scale up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_threshold: Option<String>,

    /// Busy ratio below which to scale down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_threshold: Option<String>,

    /// Multiplier applied on scale up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_factor: Option<String>,

    /// Multiplier applied on scale down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_factor: Option<String>,

    /// Fixed replicas added on scale up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_adjustment: Option<i32>,

    /// Fixed replicas removed on scale down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_adjustment: Option<i32>,
}

/// Scale up in response to a CI platform webhook event
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpTrigger {
    /// Matching event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_event: Option<GitHubEventScaleUpTriggerSpec>,

    /// Replicas to add per matching event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i32>,

    /// How long the added capacity is reserved, e.g. `5m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

/// Webhook event selector
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitHubEventScaleUpTriggerSpec {
    /// check_run events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_run: Option<CheckRunSpec>,

    /// pull_request events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestSpec>,

    /// push events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushSpec>,
}

/// check_run event filter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckRunSpec {
    /// Event actions, e.g. `created`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,

    /// Check run status, e.g. `queued`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Check run names; glob patterns allowed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

/// pull_request event filter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSpec {
    /// Event actions, e.g. `synchronize`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,

    /// Target branches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
}

/// push event filter (matches every push)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PushSpec {}

/// Extra replicas held until an expiry time
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReservation {
    /// Reservation name, used as the merge key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// When the reservation stops counting
    pub expiration_time: DateTime<Utc>,

    /// Replicas reserved
    #[serde(default)]
    pub replicas: i32,
}

/// HorizontalRunnerAutoscaler status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalRunnerAutoscalerStatus {
    /// Generation the status was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Replica count last computed by the scaling engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<i32>,

    /// When the engine last scaled out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_scale_out_time: Option<DateTime<Utc>>,

    /// Short-lived values damping flapping between passes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_entries: Vec<CacheEntry>,
}

/// A cached integer with an expiry
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Cache key, e.g. `desiredReplicas`
    pub key: String,

    /// Cached value
    #[serde(default)]
    pub value: i32,

    /// When the entry stops being served
    pub expiration_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn parses_wire_format() {
        let json = serde_json::json!({
            "apiVersion": "actions.summerwind.dev/v1alpha1",
            "kind": "HorizontalRunnerAutoscaler",
            "metadata": { "name": "hra", "namespace": "default" },
            "spec": {
                "scaleTargetRef": { "name": "deploy" },
                "minReplicas": 1,
                "maxReplicas": 5,
                "scaleDownDelaySecondsAfterScaleOut": 300,
                "metrics": [{
                    "type": "PercentageRunnersBusy",
                    "scaleUpThreshold": "0.75",
                    "scaleDownThreshold": "0.3"
                }],
                "scaleUpTriggers": [{
                    "githubEvent": { "checkRun": { "types": ["created"], "status": "queued" } },
                    "amount": 1,
                    "duration": "5m"
                }]
            }
        });
        let hra: HorizontalRunnerAutoscaler = serde_json::from_value(json).unwrap();
        assert_eq!(hra.spec.scale_target_ref.name, "deploy");
        assert_eq!(hra.spec.scale_down_delay_seconds_after_scale_out, Some(300));
        assert_eq!(
            hra.spec.metrics[0].metric_type,
            AUTOSCALING_METRIC_TYPE_PERCENTAGE_RUNNERS_BUSY
        );
        let trigger = &hra.spec.scale_up_triggers[0];
        assert_eq!(
            trigger
                .github_event
                .as_ref()
                .and_then(|e| e.check_run.as_ref())
                .and_then(|c| c.status.as_deref()),
            Some("queued")
        );
    }

    #[test]
    fn status_keeps_engine_fields_verbatim() {
        let json = serde_json::json!({
            "observedGeneration": 4,
            "desiredReplicas": 3,
            "lastSuccessfulScaleOutTime": "2024-05-01T12:00:00Z",
            "cacheEntries": [
                { "key": "desiredReplicas", "value": 3, "expirationTime": "2024-05-01T12:10:00Z" }
            ]
        });
        let status: HorizontalRunnerAutoscalerStatus =
            serde_json::from_value(json.clone()).unwrap();
        assert_eq!(status.desired_replicas, Some(3));
        assert_eq!(status.cache_entries[0].key, CACHE_ENTRY_KEY_DESIRED_REPLICAS);
        assert_eq!(serde_json::to_value(&status).unwrap(), json);
    }

    #[test]
    fn spec_carries_capacity_reservations_without_interpreting_them() {
        let json = serde_json::json!({
            "scaleTargetRef": { "name": "deploy" },
            "capacityReservations": [
                { "name": "burst", "expirationTime": "2024-05-01T13:00:00Z", "replicas": 2 }
            ]
        });
        let spec: HorizontalRunnerAutoscalerSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.capacity_reservations.len(), 1);
        assert_eq!(spec.capacity_reservations[0].replicas, 2);
    }
}
