//! Controller runner - builds the Runner controller future
//!
//! The Runner controller also watches pods it owns, so a pod phase change or
//! deletion re-triggers reconciliation of its Runner.

use std::future::Future;
use std::sync::Arc;

use arc_common::crd::Runner;
use arc_runner::{error_policy, reconcile, Context};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Where the controller looks for Runners and their pods
#[derive(Clone, Debug, Default)]
pub struct WatchScope {
    /// Restrict to one namespace; all namespaces when unset
    pub namespace: Option<String>,
    /// Maximum concurrent reconciliations (0 = unbounded)
    pub concurrency: u16,
}

impl WatchScope {
    fn api<K>(&self, client: Client) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }
}

/// Build the Runner controller future
pub fn build_runner_controller(
    client: Client,
    ctx: Arc<Context>,
    scope: &WatchScope,
) -> impl Future<Output = ()> + Send {
    let runners: Api<Runner> = scope.api(client.clone());
    let pods: Api<Pod> = scope.api(client);

    match &scope.namespace {
        Some(ns) => tracing::info!(namespace = %ns, "- Runner controller (namespaced)"),
        None => tracing::info!("- Runner controller (all namespaces)"),
    }

    Controller::new(runners, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(pods, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .with_config(ControllerConfig::default().concurrency(scope.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Runner"))
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
