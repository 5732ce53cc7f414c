//! Runner controller implementation
//!
//! Each pass re-reads the Runner, derives its state from the Runner, its
//! owned pod and the registration service, takes at most one step toward the
//! desired state, and asks to be called again. Nothing is carried between
//! passes except what is written to the Runner's status.

pub mod client;


use std::sync::Arc;
use std::time::Duration;

use arc_common::crd::{Runner, RUNNER_FINALIZER};
use arc_common::events::{actions, reasons};
use arc_common::kube_utils::{with_finalizer, without_finalizer};
use arc_common::{
    Error, EventPublisher, KubeEventPublisher, RegistrationClient, RegistrationError,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::ErrorBackoff;
use crate::config::{PodDefaults, ReconcilerConfig};
use crate::pod::build_pod;
use crate::registration::{ensure_registration_token, unregister_runner};
use crate::state::{
    self, assess_registration, classify, lifecycle_state, next_registration_check,
    pod_run_completed, registration_timed_out, status_mirrors_pod, LiveAssessment,
    RegistrationObservation, RestartReason, RunnerState,
};

use client::{CreateOutcome, DeleteOutcome, RunnerKubeClient, RunnerKubeClientImpl, StatusPatch};

/// Name reported on Events and used by the watcher
pub const CONTROLLER_NAME: &str = "runner-controller";

const POD_PHASE_RUNNING: &str = "Running";

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared context for the Runner controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, registration)
///     .config(config)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes API operations (trait object for testability)
    pub kube: Arc<dyn RunnerKubeClient>,
    /// Registration service client
    pub registration: Arc<dyn RegistrationClient>,
    /// Event publisher for Runner events
    pub events: Arc<dyn EventPublisher>,
    /// Time source for deadline and debounce checks
    pub clock: Arc<dyn Clock>,
    /// Timing knobs
    pub config: ReconcilerConfig,
    /// Pod builder fallbacks
    pub pod_defaults: PodDefaults,
    /// Per-runner error backoff
    pub backoff: ErrorBackoff,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, registration: Arc<dyn RegistrationClient>) -> ContextBuilder {
        ContextBuilder::new(client, registration)
    }

    /// Create a new controller context with default timings
    ///
    /// Equivalent to `Context::builder(client, registration).build()`.
    pub fn new(client: Client, registration: Arc<dyn RegistrationClient>) -> Self {
        Self::builder(client, registration).build()
    }

    /// Create a context for testing with custom collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn RunnerKubeClient>,
        registration: Arc<dyn RegistrationClient>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = ReconcilerConfig::default();
        Self {
            kube,
            registration,
            events,
            clock,
            backoff: ErrorBackoff::new(config.error_backoff_base, config.error_backoff_max),
            config,
            pod_defaults: PodDefaults::default(),
        }
    }

    async fn publish(
        &self,
        runner: &Runner,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.events
            .publish(&runner.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    registration: Arc<dyn RegistrationClient>,
    kube: Option<Arc<dyn RunnerKubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    clock: Option<Arc<dyn Clock>>,
    config: ReconcilerConfig,
    pod_defaults: PodDefaults,
}

impl ContextBuilder {
    fn new(client: Client, registration: Arc<dyn RegistrationClient>) -> Self {
        Self {
            client,
            registration,
            kube: None,
            events: None,
            clock: None,
            config: ReconcilerConfig::default(),
            pod_defaults: PodDefaults::default(),
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn RunnerKubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set reconciler timings
    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set pod builder fallbacks
    pub fn pod_defaults(mut self, defaults: PodDefaults) -> Self {
        self.pod_defaults = defaults;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(RunnerKubeClientImpl::new(self.client.clone()))),
            registration: self.registration,
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            backoff: ErrorBackoff::new(
                self.config.error_backoff_base,
                self.config.error_backoff_max,
            ),
            config: self.config,
            pod_defaults: self.pod_defaults,
        }
    }
}

fn backoff_key(runner: &Runner) -> String {
    format!(
        "{}/{}",
        runner.namespace().unwrap_or_default(),
        runner.name_any()
    )
}

/// Reconcile a Runner resource
///
/// The delivered object only identifies the Runner; the current object is
/// fetched before any decision is made.
#[instrument(skip(runner, ctx), fields(runner = %runner.name_any()))]
pub async fn reconcile(runner: Arc<Runner>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = runner.name_any();
    let namespace = runner
        .namespace()
        .ok_or_else(|| Error::validation_for(name.as_str(), "runner has no namespace"))?;
    let key = backoff_key(&runner);

    let Some(current) = ctx.kube.get_runner(&namespace, &name).await? else {
        debug!("runner no longer exists");
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    };

    let action = reconcile_runner(&current, &namespace, &ctx).await?;
    ctx.backoff.reset(&key);
    Ok(action)
}

async fn reconcile_runner(runner: &Runner, namespace: &str, ctx: &Context) -> Result<Action, Error> {
    let name = runner.name_any();

    let (state, pod) = match lifecycle_state(runner) {
        Some(state) => (state, None),
        None => {
            let pod = ctx.kube.get_pod(namespace, &name).await?;
            let state = classify(runner, pod.as_ref(), ctx.clock.now(), &ctx.config);
            (state, pod)
        }
    };
    debug!(?state, "classified runner");

    match state {
        RunnerState::Unvalidated { message } => {
            warn!(error = %message, "failed to validate runner spec");
            ctx.publish(
                runner,
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                message,
            )
            .await;
            Ok(Action::await_change())
        }
        RunnerState::AwaitingFinalizer => {
            if let Some(finalizers) = with_finalizer(&runner.metadata, RUNNER_FINALIZER) {
                ctx.kube.patch_finalizers(runner, finalizers).await?;
                debug!("added finalizer");
            }
            Ok(Action::await_change())
        }
        RunnerState::Deleting { registered } => finalize(runner, registered, ctx).await,
        RunnerState::Deleted => Ok(Action::await_change()),
        RunnerState::NoPod => create_runner_pod(runner, ctx).await,
        RunnerState::PodTerminatingGraceful { remaining } => {
            // The pod's own deletion progress re-triggers this runner
            debug!(?remaining, "pod is terminating");
            Ok(Action::await_change())
        }
        RunnerState::PodTerminatingForced { overdue } => {
            force_delete_pod(runner, namespace, pod.as_ref(), overdue, ctx).await
        }
        RunnerState::PodLive => match pod {
            Some(pod) => reconcile_live_pod(runner, namespace, &pod, ctx).await,
            None => Err(Error::internal_with_context(
                "reconcile",
                format!("runner {name} classified as live without a pod"),
            )),
        },
    }
}

/// Deregister the runner and release the finalizer
async fn finalize(runner: &Runner, registered: bool, ctx: &Context) -> Result<Action, Error> {
    let name = runner.name_any();

    if registered {
        match unregister_runner(ctx.registration.as_ref(), &runner.spec.target(), &name).await {
            Ok(true) => info!(scope = %runner.spec.target(), "removed runner from registration service"),
            Ok(false) => debug!("runner no longer exists in registration service"),
            Err(e) if e.rate_limit_retry_after().is_some() => {
                warn!(
                    error = %e,
                    retry_in = ?ctx.config.rate_limit_retry_delay,
                    "failed to unregister runner due to rate limit; delaying retry"
                );
                return Ok(Action::requeue(ctx.config.rate_limit_retry_delay));
            }
            Err(e) => return Err(e),
        }
    } else {
        debug!("runner was never registered");
    }

    if let Some(finalizers) = without_finalizer(&runner.metadata, RUNNER_FINALIZER) {
        ctx.kube.patch_finalizers(runner, finalizers).await?;
    }

    ctx.publish(
        runner,
        EventType::Normal,
        reasons::RUNNER_REMOVED,
        actions::DELETE,
        format!("Removed runner '{name}'"),
    )
    .await;
    info!(
        repository = %runner.spec.repository,
        organization = %runner.spec.organization,
        "released runner"
    );

    Ok(Action::await_change())
}

/// Refresh the registration token when needed
///
/// Returns the action that ends the pass when the token step decided it.
async fn refresh_token(runner: &Runner, ctx: &Context) -> Result<Option<Action>, Error> {
    match ensure_registration_token(runner, ctx).await {
        Ok(true) => Ok(Some(Action::requeue(Duration::ZERO))),
        Ok(false) => Ok(None),
        Err(e) if e.rate_limit_retry_after().is_some() => {
            warn!(
                error = %e,
                retry_in = ?ctx.config.rate_limit_retry_delay,
                "failed to get registration token due to rate limit; delaying retry"
            );
            Ok(Some(Action::requeue(ctx.config.rate_limit_retry_delay)))
        }
        Err(e) => Err(e),
    }
}

async fn create_runner_pod(runner: &Runner, ctx: &Context) -> Result<Action, Error> {
    if let Some(action) = refresh_token(runner, ctx).await? {
        return Ok(action);
    }

    let pod = build_pod(runner, &ctx.pod_defaults, &ctx.registration.base_url())?;
    let pod_name = pod.name_any();

    match ctx.kube.create_pod(&pod).await? {
        CreateOutcome::Created => {
            ctx.publish(
                runner,
                EventType::Normal,
                reasons::POD_CREATED,
                actions::CREATE,
                format!("Created pod '{pod_name}'"),
            )
            .await;
            info!(pod = %pod_name, repository = %runner.spec.repository, "created runner pod");
            Ok(Action::await_change())
        }
        CreateOutcome::AlreadyExists => {
            info!(
                pod = %pod_name,
                "runner pod already exists; likely created by an earlier pass and not yet observed"
            );
            Ok(Action::requeue(ctx.config.pod_exists_retry_delay))
        }
    }
}

async fn force_delete_pod(
    runner: &Runner,
    namespace: &str,
    pod: Option<&Pod>,
    overdue: Duration,
    ctx: &Context,
) -> Result<Action, Error> {
    let name = runner.name_any();
    warn!(
        pod = %name,
        deletion_timestamp = ?pod.and_then(|p| p.metadata.deletion_timestamp.as_ref()).map(|t| t.0),
        now = %ctx.clock.now(),
        timeout = ?ctx.config.pod_deletion_timeout,
        ?overdue,
        "pod failed to delete itself in a timely manner; forcefully deleting"
    );

    match ctx.kube.delete_pod(namespace, &name, Some(0)).await? {
        DeleteOutcome::Deleted => {
            ctx.publish(
                runner,
                EventType::Normal,
                reasons::POD_DELETED,
                actions::DELETE,
                format!("Forcefully deleted pod '{name}'"),
            )
            .await;
            info!(pod = %name, repository = %runner.spec.repository, "forcefully deleted runner pod");
            Ok(Action::requeue(ctx.config.forced_deletion_requeue))
        }
        DeleteOutcome::NotFound => Ok(Action::requeue(Duration::ZERO)),
    }
}

async fn reconcile_live_pod(
    runner: &Runner,
    namespace: &str,
    pod: &Pod,
    ctx: &Context,
) -> Result<Action, Error> {
    let name = runner.name_any();

    if pod_run_completed(pod) {
        return restart_pod(runner, namespace, pod, RestartReason::RunCompleted, ctx).await;
    }

    if let Some(action) = refresh_token(runner, ctx).await? {
        return Ok(action);
    }

    let desired = build_pod(runner, &ctx.pod_defaults, &ctx.registration.base_url())?;

    if let Some(next_check) =
        next_registration_check(runner, ctx.config.registration_check_interval)
    {
        if next_check > ctx.clock.now() {
            debug!(%next_check, "skipping registration check until debounce window elapses");
            return Ok(Action::await_change());
        }
    }

    let observation = match ctx
        .registration
        .is_runner_busy(&runner.spec.target(), &name)
        .await
    {
        Ok(true) => RegistrationObservation::Busy,
        Ok(false) => RegistrationObservation::Idle,
        Err(RegistrationError::NotFound { .. }) => RegistrationObservation::NotFound,
        Err(RegistrationError::Offline { .. }) => RegistrationObservation::Offline,
        Err(e @ RegistrationError::RateLimit { .. }) => {
            warn!(
                error = %e,
                retry_in = ?ctx.config.rate_limit_retry_delay,
                "failed to check if runner is busy due to rate limit; delaying retry"
            );
            return Ok(Action::requeue(ctx.config.rate_limit_retry_delay));
        }
        Err(
            e @ (RegistrationError::Api { .. }
            | RegistrationError::Transport { .. }
            | RegistrationError::Decode { .. }
            | RegistrationError::InvalidTarget { .. }),
        ) => return Err(Error::registration(name, e)),
    };

    let now = ctx.clock.now();
    let drift = state::pod_template_hash(pod) != state::pod_template_hash(&desired);
    let timed_out = registration_timed_out(pod, now, ctx.config.registration_timeout);

    match assess_registration(
        observation,
        drift,
        timed_out,
        ctx.config.registration_recheck_delay(),
    ) {
        LiveAssessment::Stable => {
            if !status_mirrors_pod(runner, pod) {
                let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
                if phase == Some(POD_PHASE_RUNNING) {
                    info!(
                        pod_created = ?pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
                        "runner appears to have registered and is running"
                    );
                }
                ctx.kube
                    .patch_status(runner, &StatusPatch::observed(pod))
                    .await?;
            }
            Ok(Action::await_change())
        }
        LiveAssessment::AwaitingRegistration { recheck_after } => {
            debug!(
                ?observation,
                ?recheck_after,
                "runner pod exists but runner is not online yet; rechecking registration later"
            );
            ctx.kube
                .patch_status(runner, &StatusPatch::RegistrationChecked { at: now })
                .await?;
            Ok(Action::requeue(recheck_after))
        }
        LiveAssessment::RestartPending { reason } => {
            if matches!(
                reason,
                RestartReason::RegistrationTimeout | RestartReason::OfflineTimeout
            ) {
                info!(
                    pod_created = ?pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
                    %now,
                    timeout = ?ctx.config.registration_timeout,
                    %reason,
                    "runner did not come online in a timely manner; recreating pod"
                );
            }
            restart_pod(runner, namespace, pod, reason, ctx).await
        }
    }
}

async fn restart_pod(
    runner: &Runner,
    namespace: &str,
    pod: &Pod,
    reason: RestartReason,
    ctx: &Context,
) -> Result<Action, Error> {
    let pod_name = pod.name_any();

    match ctx.kube.delete_pod(namespace, &pod_name, None).await? {
        DeleteOutcome::Deleted => {
            ctx.publish(
                runner,
                EventType::Normal,
                reasons::POD_DELETED,
                actions::DELETE,
                format!("Deleted pod '{pod_name}': {reason}"),
            )
            .await;
            info!(pod = %pod_name, %reason, repository = %runner.spec.repository, "deleted runner pod");
        }
        DeleteOutcome::NotFound => debug!(pod = %pod_name, "runner pod already gone"),
    }

    Ok(Action::await_change())
}

/// Error policy for the controller
///
/// Retryable errors back off exponentially per runner; the rest wait for the
/// Runner to change.
pub fn error_policy(runner: Arc<Runner>, error: &Error, ctx: Arc<Context>) -> Action {
    if !error.is_retryable() {
        error!(?error, runner = %runner.name_any(), "reconciliation failed permanently");
        return Action::await_change();
    }

    let delay = ctx.backoff.next_delay(&backoff_key(&runner));
    error!(
        ?error,
        runner = %runner.name_any(),
        retry_in = ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}
