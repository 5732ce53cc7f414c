//! Runner CRD: one desired self-hosted CI runner
//!
//! The controller keeps each Runner backed by exactly one pod running the
//! runner agent, and keeps the registration service's view of the runner in
//! sync via the status `registration` snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvFromSource, EnvVar, EphemeralContainer, LocalObjectReference,
    PodSecurityContext, ResourceRequirements, Toleration, Volume, VolumeMount,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::kube_utils::has_finalizer;
use crate::registration::RunnerTarget;

/// Finalizer that holds a Runner until it is removed from the registration service
pub const RUNNER_FINALIZER: &str = "runner.actions.summerwind.dev";

/// Pod label carrying the drift-detection digest
pub const LABEL_KEY_POD_TEMPLATE_HASH: &str = "pod-template-hash";

/// Label a parent replica set stamps on its Runners; excluded from the pod hash
pub const LABEL_KEY_RUNNER_TEMPLATE_HASH: &str = "runner-template-hash";

/// Name of the container running the runner agent
pub const RUNNER_CONTAINER_NAME: &str = "runner";

/// Runner is the desired state of one self-hosted CI runner.
///
/// Example:
/// ```yaml
/// apiVersion: actions.summerwind.dev/v1alpha1
/// kind: Runner
/// metadata:
///   name: r1
/// spec:
///   repository: acme/app
///   labels: [linux, x64]
///   image: summerwind/actions-runner:latest
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "actions.summerwind.dev",
    version = "v1alpha1",
    kind = "Runner",
    namespaced,
    status = "RunnerStatus",
    printcolumn = r#"{"name":"Organization","type":"string","jsonPath":".spec.organization"}"#,
    printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".spec.repository"}"#,
    printcolumn = r#"{"name":"Labels","type":"string","jsonPath":".spec.labels"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSpec {
    /// Enterprise to register under
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub enterprise: String,

    /// Organization to register under
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization: String,

    /// Repository to register under, in `owner/name` form
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,

    /// Labels the runner registers with
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    /// Runner group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Runner agent image; the controller default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Pull policy for the runner container (defaults to `Always`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Working directory for jobs (defaults to `/runner/_work`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,

    /// Run dockerd inside the runner container instead of a sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerd_within_runner_container: Option<bool>,

    /// Provide a docker daemon at all (defaults to true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_enabled: Option<bool>,

    /// MTU override for the docker daemon
    #[serde(rename = "dockerMTU", default, skip_serializing_if = "Option::is_none")]
    pub docker_mtu: Option<i64>,

    /// Resources for the docker sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerd_container_resources: Option<ResourceRequirements>,

    /// Extra environment for the runner container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Extra environment sources for the runner container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,

    /// Extra pod volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Extra mounts for the first container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Resources for the runner container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Replaces the generated container list entirely
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,

    /// Containers appended after the generated ones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecar_containers: Vec<Container>,

    /// Init containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,

    /// Ephemeral containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ephemeral_containers: Vec<EphemeralContainer>,

    /// Node selector for the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Service account for the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Whether to mount the service account token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,

    /// Pod-level security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,

    /// Image pull secrets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    /// Pod affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Pod tolerations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Pod termination grace period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

/// Runner status, written only by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatus {
    /// Phase of the backing pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Reason reported by the backing pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Message reported by the backing pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Snapshot of the last issued registration token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<RunnerStatusRegistration>,

    /// When the registration service was last asked about this runner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_registration_check_time: Option<DateTime<Utc>>,
}

/// Registration token snapshot
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatusRegistration {
    /// Organization the token was issued for
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization: String,

    /// Repository the token was issued for
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,

    /// Labels at issue time
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    /// Registration token
    pub token: String,

    /// Token expiry
    pub expires_at: DateTime<Utc>,
}

impl RunnerSpec {
    /// Validate the registration target
    pub fn validate(&self) -> Result<(), String> {
        let set = [&self.enterprise, &self.organization, &self.repository]
            .iter()
            .filter(|s| !s.is_empty())
            .count();

        match set {
            0 => return Err("spec needs enterprise, organization or repository".to_string()),
            1 => {}
            _ => {
                return Err(
                    "spec cannot have many fields defined enterprise, organization and repository"
                        .to_string(),
                )
            }
        }

        if !self.repository.is_empty() {
            let mut parts = self.repository.split('/');
            let valid = matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
            );
            if !valid {
                return Err(format!(
                    "repository {:?} must be in owner/name form",
                    self.repository
                ));
            }
        }

        Ok(())
    }

    /// Registration scope of this runner
    pub fn target(&self) -> RunnerTarget {
        RunnerTarget {
            enterprise: self.enterprise.clone(),
            organization: self.organization.clone(),
            repository: self.repository.clone(),
        }
    }

    /// Whether a docker daemon runs inside the runner container
    pub fn dockerd_in_runner(&self) -> bool {
        self.dockerd_within_runner_container.unwrap_or(false)
    }

    /// Whether the pod provides a docker daemon
    pub fn docker_enabled(&self) -> bool {
        self.docker_enabled.unwrap_or(true)
    }
}

impl Runner {
    /// Validate the spec, attributing failures to this runner
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.spec
            .validate()
            .map_err(|msg| crate::Error::validation_for(self.name_any(), msg))
    }

    /// Whether deletion has been requested
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the cleanup finalizer is present
    pub fn has_finalizer(&self) -> bool {
        has_finalizer(&self.metadata, RUNNER_FINALIZER)
    }

    /// Recorded registration token, if one was ever issued
    pub fn registration_token(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.registration.as_ref())
            .map(|r| r.token.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Whether the recorded token can still register the runner agent
    ///
    /// The token must exist, have been issued for the current target, and
    /// not have expired at `now`.
    pub fn is_registerable(&self, now: DateTime<Utc>) -> bool {
        let Some(reg) = self.status.as_ref().and_then(|s| s.registration.as_ref()) else {
            return false;
        };
        !reg.token.is_empty()
            && reg.organization == self.spec.organization
            && reg.repository == self.spec.repository
            && reg.expires_at >= now
    }

    /// Observed pod phase, reason and message as last mirrored into status
    pub fn observed_pod_state(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        match &self.status {
            Some(s) => (
                s.phase.as_deref(),
                s.reason.as_deref(),
                s.message.as_deref(),
            ),
            None => (None, None, None),
        }
    }

    /// When the registration service was last consulted
    pub fn last_registration_check_time(&self) -> Option<DateTime<Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.last_registration_check_time)
    }
}
