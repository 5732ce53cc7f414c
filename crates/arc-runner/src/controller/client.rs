//! Kubernetes operations the Runner reconciler performs
//!
//! Every write to a Runner is a merge patch guarded by the resourceVersion the
//! reconciler observed, so a concurrent change surfaces as a 409 Conflict and
//! the pass is retried against fresh state.

use arc_common::crd::{Runner, RunnerStatus, RunnerStatusRegistration};
use arc_common::kube_utils::{is_already_exists, is_not_found, versioned_merge_patch};
use arc_common::{Error, FIELD_MANAGER};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

/// Result of asking the API server to create a pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The pod was created
    Created,
    /// A pod with that name already exists
    AlreadyExists,
}

/// Result of asking the API server to delete a pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Deletion was accepted
    Deleted,
    /// The pod was already gone
    NotFound,
}

/// A status change the reconciler writes
#[derive(Clone, Debug, PartialEq)]
pub enum StatusPatch {
    /// Record a freshly issued registration token, replacing the whole snapshot
    Registration(RunnerStatusRegistration),
    /// Record when the registration service was last consulted
    RegistrationChecked {
        /// Check time
        at: DateTime<Utc>,
    },
    /// Mirror the pod's phase, reason and message
    PodObserved {
        /// Pod phase
        phase: Option<String>,
        /// Pod reason
        reason: Option<String>,
        /// Pod message
        message: Option<String>,
    },
}

impl StatusPatch {
    /// Mirror the status of `pod`
    pub fn observed(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        StatusPatch::PodObserved {
            phase: status.and_then(|s| s.phase.clone()),
            reason: status.and_then(|s| s.reason.clone()),
            message: status.and_then(|s| s.message.clone()),
        }
    }

    /// Merge-patch body for the status subresource
    ///
    /// Every field of the touched section is written out, with `null` for
    /// cleared values, so nothing from the previous state survives the merge.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            StatusPatch::Registration(reg) => json!({
                "status": {
                    "registration": {
                        "organization": reg.organization,
                        "repository": reg.repository,
                        "labels": reg.labels,
                        "token": reg.token,
                        "expiresAt": reg.expires_at,
                    }
                }
            }),
            StatusPatch::RegistrationChecked { at } => json!({
                "status": { "lastRegistrationCheckTime": at }
            }),
            StatusPatch::PodObserved {
                phase,
                reason,
                message,
            } => json!({
                "status": { "phase": phase, "reason": reason, "message": message }
            }),
        }
    }

    /// Apply this change to an in-memory status
    pub fn apply(&self, status: &mut RunnerStatus) {
        match self {
            StatusPatch::Registration(reg) => status.registration = Some(reg.clone()),
            StatusPatch::RegistrationChecked { at } => {
                status.last_registration_check_time = Some(*at)
            }
            StatusPatch::PodObserved {
                phase,
                reason,
                message,
            } => {
                status.phase = phase.clone();
                status.reason = reason.clone();
                status.message = message.clone();
            }
        }
    }
}

/// Trait abstracting the Kubernetes API for the Runner reconciler
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RunnerKubeClient: Send + Sync {
    /// Get a Runner, `None` if it no longer exists
    async fn get_runner(&self, namespace: &str, name: &str) -> Result<Option<Runner>, Error>;

    /// Get a pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Create a pod
    async fn create_pod(&self, pod: &Pod) -> Result<CreateOutcome, Error>;

    /// Delete a pod, optionally overriding its grace period
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<DeleteOutcome, Error>;

    /// Replace the Runner's finalizer list
    async fn patch_finalizers(&self, runner: &Runner, finalizers: Vec<String>)
        -> Result<(), Error>;

    /// Patch the Runner's status subresource
    async fn patch_status(&self, runner: &Runner, patch: &StatusPatch) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct RunnerKubeClientImpl {
    client: Client,
}

impl RunnerKubeClientImpl {
    /// Create a new RunnerKubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn runners(&self, namespace: &str) -> Api<Runner> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of(runner: &Runner) -> Result<String, Error> {
    runner.namespace().ok_or_else(|| {
        Error::internal_with_context(
            "kube-client",
            format!("runner {} has no namespace", runner.name_any()),
        )
    })
}

#[async_trait]
impl RunnerKubeClient for RunnerKubeClientImpl {
    async fn get_runner(&self, namespace: &str, name: &str) -> Result<Option<Runner>, Error> {
        match self.runners(namespace).get(name).await {
            Ok(runner) => Ok(Some(runner)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        match self.pods(namespace).get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_pod(&self, pod: &Pod) -> Result<CreateOutcome, Error> {
        let namespace = pod.namespace().unwrap_or_default();
        match self
            .pods(&namespace)
            .create(&PostParams::default(), pod)
            .await
        {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) if is_already_exists(&e) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<DeleteOutcome, Error> {
        let params = DeleteParams {
            grace_period_seconds,
            ..Default::default()
        };
        match self.pods(namespace).delete(name, &params).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) if is_not_found(&e) => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_finalizers(
        &self,
        runner: &Runner,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let namespace = namespace_of(runner)?;
        let patch = versioned_merge_patch(
            runner.resource_version().as_deref(),
            json!({ "metadata": { "finalizers": finalizers } }),
        );
        self.runners(&namespace)
            .patch(
                &runner.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn patch_status(&self, runner: &Runner, patch: &StatusPatch) -> Result<(), Error> {
        let namespace = namespace_of(runner)?;
        let body = versioned_merge_patch(runner.resource_version().as_deref(), patch.to_json());
        self.runners(&namespace)
            .patch_status(
                &runner.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&body),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;

    #[test]
    fn pod_observed_renders_nulls_for_cleared_fields() {
        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        let body = StatusPatch::observed(&pod).to_json();
        assert_eq!(body["status"]["phase"], "Running");
        assert!(body["status"]["reason"].is_null());
        assert!(body["status"]
            .as_object()
            .unwrap()
            .contains_key("message"));
    }

    #[test]
    fn registration_writes_every_field() {
        let at = DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let body = StatusPatch::Registration(RunnerStatusRegistration {
            organization: "acme".to_string(),
            repository: String::new(),
            labels: vec![],
            token: "tok".to_string(),
            expires_at: at,
        })
        .to_json();
        let reg = &body["status"]["registration"];
        assert_eq!(reg["organization"], "acme");
        assert_eq!(reg["repository"], "");
        assert_eq!(reg["labels"], json!([]));
        assert_eq!(reg["token"], "tok");
        assert_eq!(reg["expiresAt"], "2030-01-01T00:00:00Z");
    }

    #[test]
    fn apply_updates_in_memory_status() {
        let mut status = RunnerStatus {
            reason: Some("Evicted".to_string()),
            ..Default::default()
        };
        StatusPatch::PodObserved {
            phase: Some("Running".to_string()),
            reason: None,
            message: None,
        }
        .apply(&mut status);
        assert_eq!(status.phase.as_deref(), Some("Running"));
        assert_eq!(status.reason, None);

        let at = Utc::now();
        StatusPatch::RegistrationChecked { at }.apply(&mut status);
        assert_eq!(status.last_registration_check_time, Some(at));
    }
}
