//! Actions runner operator - keeps self-hosted CI runners backed by pods

mod controller_runner;

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};

use arc_common::crd::{HorizontalRunnerAutoscaler, Runner};
use arc_common::telemetry::{init_tracing, LogFormat};
use arc_common::FIELD_MANAGER;
use arc_github::{GitHubClient, GitHubConfig};
use arc_runner::config::{DEFAULT_DOCKER_IMAGE, DEFAULT_RUNNER_IMAGE, DEFAULT_WORK_DIR};
use arc_runner::{Context, PodDefaults, ReconcilerConfig};

use controller_runner::{build_runner_controller, WatchScope};

/// Self-hosted GitHub Actions runner controller
#[derive(Parser, Debug)]
#[command(name = "arc-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Runner agent image used when a Runner names none
    #[arg(long, env = "RUNNER_IMAGE", default_value = DEFAULT_RUNNER_IMAGE)]
    runner_image: String,

    /// Docker-in-docker sidecar image
    #[arg(long, env = "DOCKER_IMAGE", default_value = DEFAULT_DOCKER_IMAGE)]
    docker_image: String,

    /// GitHub token used to mint registration tokens and list runners
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// GitHub web URL handed to runner agents
    #[arg(long, env = "GITHUB_URL")]
    github_url: Option<String>,

    /// GitHub REST API URL
    #[arg(long, env = "GITHUB_API_URL")]
    github_api_url: Option<String>,

    /// GitHub Enterprise Server URL; overrides both URLs above
    #[arg(long, env = "GITHUB_ENTERPRISE_URL")]
    github_enterprise_url: Option<String>,

    /// Only watch Runners in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Maximum concurrent reconciliations (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    concurrency: u16,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(flatten)]
    timing: TimingArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Reconciler delays, in seconds
#[derive(Args, Debug, Clone)]
struct TimingArgs {
    /// How long a terminating pod may linger before it is force-deleted
    #[arg(long, default_value_t = 60)]
    pod_deletion_timeout: u64,

    /// How long a new pod has to register before it is recreated
    #[arg(long, default_value_t = 600)]
    registration_timeout: u64,

    /// Minimum spacing between registration checks for one runner
    #[arg(long, default_value_t = 60)]
    registration_check_interval: u64,

    /// Jitter base added to scheduled registration rechecks
    #[arg(long, default_value_t = 10)]
    registration_recheck_jitter: u64,

    /// Requeue delay after the registration service rate-limits a call
    #[arg(long, default_value_t = 30)]
    rate_limit_retry_delay: u64,

    /// Requeue delay after a pod create found an existing pod
    #[arg(long, default_value_t = 10)]
    pod_exists_retry_delay: u64,

    /// Requeue delay after a forced pod deletion
    #[arg(long, default_value_t = 3)]
    forced_deletion_requeue: u64,
}

impl From<&TimingArgs> for ReconcilerConfig {
    fn from(args: &TimingArgs) -> Self {
        Self {
            pod_deletion_timeout: Duration::from_secs(args.pod_deletion_timeout),
            registration_timeout: Duration::from_secs(args.registration_timeout),
            registration_check_interval: Duration::from_secs(args.registration_check_interval),
            registration_recheck_jitter: Duration::from_secs(args.registration_recheck_jitter),
            rate_limit_retry_delay: Duration::from_secs(args.rate_limit_retry_delay),
            pod_exists_retry_delay: Duration::from_secs(args.pod_exists_retry_delay),
            forced_deletion_requeue: Duration::from_secs(args.forced_deletion_requeue),
            ..ReconcilerConfig::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

impl Cli {
    fn github_config(&self) -> anyhow::Result<GitHubConfig> {
        let token = self
            .github_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("a GitHub token is required (--github-token or GITHUB_TOKEN)")
            })?;

        let mut config = GitHubConfig::new(token);
        if let Some(url) = &self.github_url {
            config.base_url = url.clone();
        }
        if let Some(url) = &self.github_api_url {
            config.api_url = url.clone();
        }
        if let Some(url) = &self.github_enterprise_url {
            config = config.with_enterprise_url(url.clone());
        }
        Ok(config)
    }

    fn pod_defaults(&self) -> PodDefaults {
        PodDefaults {
            runner_image: self.runner_image.clone(),
            docker_image: self.docker_image.clone(),
            work_dir: DEFAULT_WORK_DIR.to_string(),
        }
    }

    fn watch_scope(&self) -> WatchScope {
        WatchScope {
            namespace: self.namespace.clone().filter(|ns| !ns.is_empty()),
            concurrency: self.concurrency,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Both the Kubernetes client and the GitHub client speak TLS through rustls
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let runner = serde_yaml::to_string(&Runner::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Runner CRD: {}", e))?;
        let autoscaler = serde_yaml::to_string(&HorizontalRunnerAutoscaler::crd()).map_err(|e| {
            anyhow::anyhow!("Failed to serialize HorizontalRunnerAutoscaler CRD: {}", e)
        })?;
        println!("{runner}---\n{autoscaler}");
        return Ok(());
    }

    init_tracing(cli.log_format)?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli).await,
    }
}

/// Ensure the operator's CRDs are installed
///
/// Installed with server-side apply so CRD versions always match the operator.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Runner CRD...");
    crds.patch(
        "runners.actions.summerwind.dev",
        &params,
        &Patch::Apply(&Runner::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Runner CRD: {}", e))?;

    tracing::info!("Installing HorizontalRunnerAutoscaler CRD...");
    crds.patch(
        "horizontalrunnerautoscalers.actions.summerwind.dev",
        &params,
        &Patch::Apply(&HorizontalRunnerAutoscaler::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install HorizontalRunnerAutoscaler CRD: {}", e))?;

    tracing::info!("All CRDs installed/updated");
    Ok(())
}

async fn run_controller(cli: &Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let github_config = cli.github_config()?;
    tracing::info!(config = ?github_config, "Configured GitHub client");
    let github = GitHubClient::new(github_config)?;

    let config = ReconcilerConfig::from(&cli.timing);
    tracing::info!(?config, "Reconciler timings");

    let ctx = Arc::new(
        Context::builder(client.clone(), Arc::new(github))
            .config(config)
            .pod_defaults(cli.pod_defaults())
            .build(),
    );

    tracing::info!("Starting controllers...");
    build_runner_controller(client, ctx, &cli.watch_scope()).await;

    tracing::info!("Controller stopped");
    Ok(())
}
