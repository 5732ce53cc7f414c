//! Desired-pod builder
//!
//! Maps a Runner plus controller defaults to the complete pod that should back
//! it. The pod carries a `pod-template-hash` label; a live pod whose label
//! differs from a freshly built one is stale.

use std::collections::BTreeMap;

use arc_common::crd::{
    Runner, LABEL_KEY_POD_TEMPLATE_HASH, LABEL_KEY_RUNNER_TEMPLATE_HASH, RUNNER_CONTAINER_NAME,
};
use arc_common::kube_utils::hash_object;
use arc_common::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_ARC};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::config::PodDefaults;

const DOCKER_CONTAINER_NAME: &str = "docker";
const WORK_VOLUME: &str = "work";
const RUNNER_VOLUME: &str = "runner";
const RUNNER_VOLUME_PATH: &str = "/runner";
const CERTS_VOLUME: &str = "certs-client";
const CERTS_CLIENT_PATH: &str = "/certs/client";
const DEFAULT_PULL_POLICY: &str = "Always";
const RESTART_POLICY: &str = "OnFailure";

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

/// Compute the drift-detection digest for a Runner
///
/// Covers the Runner labels (minus template-hash labels), annotations, the
/// full spec and the registration service base URL. Status is not an input,
/// so a refreshed registration token never forces a restart.
pub fn pod_template_hash(runner: &Runner, base_url: &str) -> Result<String, Error> {
    let labels: BTreeMap<&String, &String> = runner
        .labels()
        .iter()
        .filter(|(k, _)| {
            k.as_str() != LABEL_KEY_RUNNER_TEMPLATE_HASH
                && k.as_str() != LABEL_KEY_POD_TEMPLATE_HASH
        })
        .collect();

    hash_object(&(labels, runner.annotations(), &runner.spec, base_url))
}

/// Standard environment handed to the runner agent
fn runner_env(runner: &Runner, work_dir: &str, base_url: &str) -> Vec<EnvVar> {
    let spec = &runner.spec;
    let token = runner.registration_token().unwrap_or_default();

    let mut vars = vec![
        env("RUNNER_NAME", runner.name_any()),
        env("RUNNER_ORG", spec.organization.as_str()),
        env("RUNNER_REPO", spec.repository.as_str()),
        env("RUNNER_ENTERPRISE", spec.enterprise.as_str()),
        env("RUNNER_LABELS", spec.labels.join(",")),
        env("RUNNER_GROUP", spec.group.clone().unwrap_or_default()),
        env("RUNNER_TOKEN", token),
        env("DOCKERD_IN_RUNNER", spec.dockerd_in_runner().to_string()),
        env("GITHUB_URL", base_url),
        env("RUNNER_WORKDIR", work_dir),
    ];
    vars.extend(spec.env.iter().cloned());
    vars
}

/// Build the pod that should back `runner`
///
/// Overlays from the spec apply in a fixed order: container list override,
/// extra mounts on the first container, volumes, init containers, node
/// selector, service account, token automount, sidecars, pod security
/// context, pull secrets, affinity, tolerations, ephemeral containers, and
/// termination grace period.
pub fn build_pod(runner: &Runner, defaults: &PodDefaults, base_url: &str) -> Result<Pod, Error> {
    let spec = &runner.spec;
    let name = runner.name_any();

    let owner = runner.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context("pod-builder", format!("runner {name} has no uid"))
    })?;

    let dockerd_in_runner = spec.dockerd_in_runner();
    let work_dir = spec
        .work_dir
        .clone()
        .filter(|w| !w.is_empty())
        .unwrap_or_else(|| defaults.work_dir.clone());
    let image = spec
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| defaults.runner_image.clone());
    let pull_policy = spec
        .image_pull_policy
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_PULL_POLICY.to_string());

    let env_vars = runner_env(runner, &work_dir, base_url);

    let mut primary = Container {
        name: RUNNER_CONTAINER_NAME.to_string(),
        image: Some(image),
        image_pull_policy: Some(pull_policy),
        env: Some(env_vars.clone()),
        env_from: (!spec.env_from.is_empty()).then(|| spec.env_from.clone()),
        security_context: Some(SecurityContext {
            privileged: spec.dockerd_within_runner_container,
            ..Default::default()
        }),
        resources: spec.resources.clone(),
        ..Default::default()
    };

    if let (Some(mtu), true) = (spec.docker_mtu, dockerd_in_runner) {
        push_env(&mut primary, env("MTU", mtu.to_string()));
    }

    let mut pod_spec = PodSpec {
        restart_policy: Some(RESTART_POLICY.to_string()),
        ..Default::default()
    };

    let mut containers = vec![primary];

    if !dockerd_in_runner && spec.docker_enabled() {
        pod_spec.volumes = Some(vec![
            empty_dir(WORK_VOLUME),
            empty_dir(RUNNER_VOLUME),
            empty_dir(CERTS_VOLUME),
        ]);

        let primary = &mut containers[0];
        primary.volume_mounts = Some(vec![
            mount(WORK_VOLUME, &work_dir, false),
            mount(RUNNER_VOLUME, RUNNER_VOLUME_PATH, false),
            mount(CERTS_VOLUME, CERTS_CLIENT_PATH, true),
        ]);
        push_env(primary, env("DOCKER_HOST", "tcp://localhost:2376"));
        push_env(primary, env("DOCKER_TLS_VERIFY", "1"));
        push_env(primary, env("DOCKER_CERT_PATH", CERTS_CLIENT_PATH));

        let mut docker_env = vec![env("DOCKER_TLS_CERTDIR", "/certs")];
        if let Some(mtu) = spec.docker_mtu {
            docker_env.push(env("DOCKERD_ROOTLESS_ROOTLESSKIT_MTU", mtu.to_string()));
        }

        containers.push(Container {
            name: DOCKER_CONTAINER_NAME.to_string(),
            image: Some(defaults.docker_image.clone()),
            volume_mounts: Some(vec![
                mount(WORK_VOLUME, &work_dir, false),
                mount(RUNNER_VOLUME, RUNNER_VOLUME_PATH, false),
                mount(CERTS_VOLUME, CERTS_CLIENT_PATH, false),
            ]),
            env: Some(docker_env),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            resources: spec.dockerd_container_resources.clone(),
            ..Default::default()
        });
    }

    if !spec.containers.is_empty() {
        containers = spec.containers.clone();
        for container in containers
            .iter_mut()
            .filter(|c| c.name == RUNNER_CONTAINER_NAME)
        {
            container
                .env
                .get_or_insert_with(Vec::new)
                .extend(env_vars.iter().cloned());
        }
    }

    if !spec.volume_mounts.is_empty() {
        if let Some(first) = containers.first_mut() {
            first
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .extend(spec.volume_mounts.iter().cloned());
        }
    }

    if !spec.volumes.is_empty() {
        pod_spec
            .volumes
            .get_or_insert_with(Vec::new)
            .extend(spec.volumes.iter().cloned());
    }

    if !spec.init_containers.is_empty() {
        pod_spec
            .init_containers
            .get_or_insert_with(Vec::new)
            .extend(spec.init_containers.iter().cloned());
    }

    if spec.node_selector.is_some() {
        pod_spec.node_selector = spec.node_selector.clone();
    }
    if let Some(sa) = spec.service_account_name.as_ref().filter(|s| !s.is_empty()) {
        pod_spec.service_account_name = Some(sa.clone());
    }
    if spec.automount_service_account_token.is_some() {
        pod_spec.automount_service_account_token = spec.automount_service_account_token;
    }

    containers.extend(spec.sidecar_containers.iter().cloned());

    if spec.security_context.is_some() {
        pod_spec.security_context = spec.security_context.clone();
    }
    if !spec.image_pull_secrets.is_empty() {
        pod_spec.image_pull_secrets = Some(spec.image_pull_secrets.clone());
    }
    if spec.affinity.is_some() {
        pod_spec.affinity = spec.affinity.clone();
    }
    if !spec.tolerations.is_empty() {
        pod_spec.tolerations = Some(spec.tolerations.clone());
    }
    if !spec.ephemeral_containers.is_empty() {
        pod_spec.ephemeral_containers = Some(spec.ephemeral_containers.clone());
    }
    if spec.termination_grace_period_seconds.is_some() {
        pod_spec.termination_grace_period_seconds = spec.termination_grace_period_seconds;
    }

    pod_spec.containers = containers;

    let mut labels = runner.labels().clone();
    labels.insert(
        LABEL_KEY_POD_TEMPLATE_HASH.to_string(),
        pod_template_hash(runner, base_url)?,
    );
    labels
        .entry(LABEL_MANAGED_BY.to_string())
        .or_insert_with(|| LABEL_MANAGED_BY_ARC.to_string());

    let annotations = runner.annotations();

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: runner.namespace(),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then(|| annotations.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(pod_spec),
        status: None,
    })
}

fn push_env(container: &mut Container, var: EnvVar) {
    container.env.get_or_insert_with(Vec::new).push(var);
}
