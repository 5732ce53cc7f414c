//! Registration token manager and deregistration coordinator

use arc_common::crd::{Runner, RunnerStatusRegistration};
use arc_common::events::{actions, reasons};
use arc_common::{Error, RegistrationClient, RegistrationToken, RunnerTarget};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{error, info};

use crate::controller::client::StatusPatch;
use crate::controller::Context;

/// Snapshot recorded in status for a freshly issued token
pub fn registration_snapshot(runner: &Runner, token: RegistrationToken) -> RunnerStatusRegistration {
    RunnerStatusRegistration {
        organization: runner.spec.organization.clone(),
        repository: runner.spec.repository.clone(),
        labels: runner.spec.labels.clone(),
        token: token.token,
        expires_at: token.expires_at,
    }
}

/// Make sure the Runner carries a token its agent can register with
///
/// Returns `true` when a new token was recorded. The status write re-triggers
/// reconciliation, so callers stop the current pass in that case.
pub async fn ensure_registration_token(runner: &Runner, ctx: &Context) -> Result<bool, Error> {
    if runner.is_registerable(ctx.clock.now()) {
        return Ok(false);
    }

    let name = runner.name_any();
    let object_ref = runner.object_ref(&());

    let token = match ctx
        .registration
        .registration_token(&runner.spec.target(), &name)
        .await
    {
        Ok(token) => token,
        Err(e) => {
            ctx.events
                .publish(
                    &object_ref,
                    EventType::Warning,
                    reasons::FAILED_UPDATE_REGISTRATION_TOKEN,
                    actions::REGISTER,
                    Some(format!("Updating registration token failed: {e}")),
                )
                .await;
            error!(error = %e, "failed to get new registration token");
            return Err(Error::registration(name, e));
        }
    };

    let patch = StatusPatch::Registration(registration_snapshot(runner, token));
    ctx.kube.patch_status(runner, &patch).await?;

    ctx.events
        .publish(
            &object_ref,
            EventType::Normal,
            reasons::REGISTRATION_TOKEN_UPDATED,
            actions::REGISTER,
            Some("Successfully updated registration token".to_string()),
        )
        .await;
    info!(repository = %runner.spec.repository, "updated registration token");

    Ok(true)
}

/// Remove a runner from the registration service
///
/// Returns `true` when a registration was removed and `false` when none
/// existed. A busy runner is never removed.
pub async fn unregister_runner(
    client: &dyn RegistrationClient,
    target: &RunnerTarget,
    name: &str,
) -> Result<bool, Error> {
    let runners = client
        .list_runners(target)
        .await
        .map_err(|e| Error::registration(name, e))?;

    let Some(registered) = runners.iter().find(|r| r.name == name) else {
        return Ok(false);
    };

    if registered.busy {
        return Err(Error::runner_busy(name));
    }

    client
        .remove_runner(target, registered.id)
        .await
        .map_err(|e| Error::registration(name, e))?;

    Ok(true)
}
