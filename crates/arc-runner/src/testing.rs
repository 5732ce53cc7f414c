//! In-memory collaborators for reconciler tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use arc_common::crd::Runner;
use arc_common::{
    Error, EventPublisher, RegisteredRunner, RegistrationClient, RegistrationError,
    RegistrationToken, RunnerTarget,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use mockall::mock;

use crate::controller::client::{CreateOutcome, DeleteOutcome, RunnerKubeClient, StatusPatch};
use crate::controller::Clock;

pub const BASE_URL: &str = "https://github.com/";

mock! {
    pub Registration {}

    #[async_trait]
    impl RegistrationClient for Registration {
        fn base_url(&self) -> String;
        async fn list_runners(
            &self,
            target: &RunnerTarget,
        ) -> Result<Vec<RegisteredRunner>, RegistrationError>;
        async fn registration_token(
            &self,
            target: &RunnerTarget,
            name: &str,
        ) -> Result<RegistrationToken, RegistrationError>;
        async fn remove_runner(&self, target: &RunnerTarget, id: i64)
            -> Result<(), RegistrationError>;
    }
}

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

// =============================================================================
// Clock
// =============================================================================

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("mutex should not be poisoned") = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("mutex should not be poisoned");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("mutex should not be poisoned")
    }
}

// =============================================================================
// Events
// =============================================================================

/// Records every published event as (warning?, reason, note)
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(bool, String, Option<String>)>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("mutex should not be poisoned")
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("mutex should not be poisoned")
            .iter()
            .filter(|(warning, _, _)| *warning)
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events
            .lock()
            .expect("mutex should not be poisoned")
            .push((
                matches!(type_, EventType::Warning),
                reason.to_string(),
                note,
            ));
    }
}

// =============================================================================
// Registration service
// =============================================================================

#[derive(Default)]
struct RegistryState {
    runners: Vec<RegisteredRunner>,
    rate_limited: bool,
    list_calls: u32,
    tokens_issued: u32,
    removed: Vec<i64>,
}

/// Registration service holding runners in memory
pub struct FakeRegistration {
    clock: Arc<ManualClock>,
    state: Mutex<RegistryState>,
}

impl FakeRegistration {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        f(&mut self.state.lock().expect("mutex should not be poisoned"))
    }

    /// Register or update a runner
    pub fn set_runner(&self, id: i64, name: &str, status: &str, busy: bool) {
        self.with_state(|s| {
            s.runners.retain(|r| r.name != name);
            s.runners.push(RegisteredRunner {
                id,
                name: name.to_string(),
                status: status.to_string(),
                busy,
                labels: vec![],
            });
        });
    }

    pub fn set_rate_limited(&self, limited: bool) {
        self.with_state(|s| s.rate_limited = limited);
    }

    pub fn list_calls(&self) -> u32 {
        self.with_state(|s| s.list_calls)
    }

    pub fn tokens_issued(&self) -> u32 {
        self.with_state(|s| s.tokens_issued)
    }

    pub fn removed(&self) -> Vec<i64> {
        self.with_state(|s| s.removed.clone())
    }

    fn rate_limit() -> RegistrationError {
        RegistrationError::RateLimit {
            retry_after: Some(std::time::Duration::from_secs(120)),
            message: "API rate limit exceeded".to_string(),
        }
    }
}

#[async_trait]
impl RegistrationClient for FakeRegistration {
    fn base_url(&self) -> String {
        BASE_URL.to_string()
    }

    async fn list_runners(
        &self,
        _target: &RunnerTarget,
    ) -> Result<Vec<RegisteredRunner>, RegistrationError> {
        self.with_state(|s| {
            if s.rate_limited {
                return Err(Self::rate_limit());
            }
            s.list_calls += 1;
            Ok(s.runners.clone())
        })
    }

    async fn registration_token(
        &self,
        _target: &RunnerTarget,
        _name: &str,
    ) -> Result<RegistrationToken, RegistrationError> {
        let expires_at = self.clock.now() + Duration::hours(1);
        self.with_state(|s| {
            if s.rate_limited {
                return Err(Self::rate_limit());
            }
            s.tokens_issued += 1;
            Ok(RegistrationToken {
                token: format!("tok-{}", s.tokens_issued),
                expires_at,
            })
        })
    }

    async fn remove_runner(&self, _target: &RunnerTarget, id: i64) -> Result<(), RegistrationError> {
        self.with_state(|s| {
            s.runners.retain(|r| r.id != id);
            s.removed.push(id);
            Ok(())
        })
    }
}

// =============================================================================
// Cluster
// =============================================================================

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn conflict(name: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("the object {name} has been modified"),
            reason: "Conflict".to_string(),
            code: 409,
        }),
    }
}

#[derive(Default)]
struct ClusterState {
    runners: BTreeMap<Key, Runner>,
    pods: BTreeMap<Key, Pod>,
    next_version: u64,
    created: Vec<String>,
    deleted: Vec<(String, Option<u32>)>,
    status_patches: Vec<StatusPatch>,
}

impl ClusterState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn runner_for_write(&mut self, runner: &Runner) -> Result<&mut Runner, Error> {
        let name = runner.name_any();
        let k = key(&runner.namespace().unwrap_or_default(), &name);
        let stored = self.runners.get_mut(&k).ok_or_else(|| conflict(&name))?;
        if stored.resource_version() != runner.resource_version() {
            return Err(conflict(&name));
        }
        Ok(stored)
    }
}

/// API server holding Runners and pods in memory
///
/// Writes to a Runner are checked against its resourceVersion. Pods are
/// removed on delete; a terminating pod is modelled by inserting one with a
/// deletion timestamp.
pub struct FakeCluster {
    clock: Arc<ManualClock>,
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(ClusterState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> R {
        f(&mut self.state.lock().expect("mutex should not be poisoned"))
    }

    pub fn insert_runner(&self, mut runner: Runner) {
        self.with_state(|s| {
            runner.metadata.resource_version = Some(s.bump());
            let k = key(&runner.namespace().unwrap_or_default(), &runner.name_any());
            s.runners.insert(k, runner);
        });
    }

    /// Mutate a stored Runner the way another client would
    pub fn update_runner(&self, namespace: &str, name: &str, f: impl FnOnce(&mut Runner)) {
        self.with_state(|s| {
            let version = s.bump();
            let runner = s
                .runners
                .get_mut(&key(namespace, name))
                .expect("runner should exist");
            f(runner);
            runner.metadata.resource_version = Some(version);
        });
    }

    pub fn runner(&self, namespace: &str, name: &str) -> Option<Runner> {
        self.with_state(|s| s.runners.get(&key(namespace, name)).cloned())
    }

    pub fn update_pod(&self, namespace: &str, name: &str, f: impl FnOnce(&mut Pod)) {
        self.with_state(|s| {
            f(s.pods
                .get_mut(&key(namespace, name))
                .expect("pod should exist"))
        });
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.with_state(|s| s.pods.get(&key(namespace, name)).cloned())
    }

    pub fn created(&self) -> Vec<String> {
        self.with_state(|s| s.created.clone())
    }

    pub fn deleted(&self) -> Vec<(String, Option<u32>)> {
        self.with_state(|s| s.deleted.clone())
    }

    pub fn status_patches(&self) -> Vec<StatusPatch> {
        self.with_state(|s| s.status_patches.clone())
    }
}

#[async_trait]
impl RunnerKubeClient for FakeCluster {
    async fn get_runner(&self, namespace: &str, name: &str) -> Result<Option<Runner>, Error> {
        Ok(self.runner(namespace, name))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.pod(namespace, name))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<CreateOutcome, Error> {
        let now = self.clock.now();
        self.with_state(|s| {
            let k = key(&pod.namespace().unwrap_or_default(), &pod.name_any());
            if s.pods.contains_key(&k) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            let mut stored = pod.clone();
            stored.metadata.creation_timestamp = Some(Time(now));
            s.created.push(pod.name_any());
            s.pods.insert(k, stored);
            Ok(CreateOutcome::Created)
        })
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<DeleteOutcome, Error> {
        self.with_state(|s| {
            s.deleted.push((name.to_string(), grace_period_seconds));
            match s.pods.remove(&key(namespace, name)) {
                Some(_) => Ok(DeleteOutcome::Deleted),
                None => Ok(DeleteOutcome::NotFound),
            }
        })
    }

    async fn patch_finalizers(
        &self,
        runner: &Runner,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        self.with_state(|s| {
            let version = s.bump();
            let stored = s.runner_for_write(runner)?;
            stored.metadata.finalizers = Some(finalizers);
            stored.metadata.resource_version = Some(version);

            let released = stored.metadata.deletion_timestamp.is_some()
                && stored.finalizers().is_empty();
            if released {
                let k = key(&runner.namespace().unwrap_or_default(), &runner.name_any());
                s.runners.remove(&k);
            }
            Ok(())
        })
    }

    async fn patch_status(&self, runner: &Runner, patch: &StatusPatch) -> Result<(), Error> {
        self.with_state(|s| {
            let version = s.bump();
            let stored = s.runner_for_write(runner)?;
            patch.apply(stored.status.get_or_insert_with(Default::default));
            stored.metadata.resource_version = Some(version);
            s.status_patches.push(patch.clone());
            Ok(())
        })
    }
}
