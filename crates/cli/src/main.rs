use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use appset_apply::MergeEngine;
use appset_controller::{assemble, config::parse_sticky, runtime, ControllerConfig, Reconciler};
use appset_core::{ApplicationSet, Destination};
use appset_generators::{CheckoutRepoService, GeneratorRegistry};
use appset_kubehub::{
    application_set_resource, ClusterRegistry, DestinationSnapshot, KubeApplicationStore, KubeProjectSource,
    KubeSecretSource, KubeServerProbe,
};
use appset_render::PlaceholderRenderer;
use clap::{Parser, Subcommand, ValueEnum};
use kube::{
    api::{Api, Patch, PatchParams},
    core::DynamicObject,
    Client,
};
use tracing::info;

/// Annotation whose change makes the controller pick a set up again.
const SET_REFRESH_ANNOTATION: &str = "argocd.argoproj.io/application-set-refresh";

#[derive(Parser, Debug)]
#[command(name = "appsetctl", version, about = "ApplicationSet controller and tools")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace holding ApplicationSets and cluster secrets (default: current context)
    #[arg(long = "ns", global = true, env = "APPSET_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current cluster
    Run {
        /// Directory with checked-out repositories for git generators
        #[arg(long = "repo-root", env = "APPSET_REPO_ROOT")]
        repo_root: Option<PathBuf>,
        /// Upper bound for one reconciliation, in seconds
        #[arg(long = "cycle-timeout", env = "APPSET_CYCLE_TIMEOUT_SECS")]
        cycle_timeout_secs: Option<u64>,
        /// Comma separated annotation keys preserved from live applications
        #[arg(long = "sticky", env = "APPSET_STICKY_ANNOTATIONS")]
        sticky: Option<String>,
    },
    /// Render the applications of an ApplicationSet file without a cluster
    Render {
        /// ApplicationSet manifest (YAML or JSON)
        file: PathBuf,
        /// YAML list of destinations available to the clusters generator
        #[arg(long = "clusters")]
        clusters: Option<PathBuf>,
        /// Directory with checked-out repositories for git generators
        #[arg(long = "repo-root", env = "APPSET_REPO_ROOT", default_value = ".")]
        repo_root: PathBuf,
    },
    /// List destination clusters known to the registry
    Clusters,
    /// Ask the controller to reconcile an ApplicationSet now
    Requeue {
        /// ApplicationSet name
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("APPSET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("APPSET_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid APPSET_METRICS_ADDR; expected host:port");
        }
    }
}

fn registry(client: &Client) -> Arc<ClusterRegistry> {
    Arc::new(ClusterRegistry::new(
        Arc::new(KubeSecretSource::new(client.clone())),
        Arc::new(KubeServerProbe::new(client.clone())),
    ))
}

async fn run_controller(
    namespace: Option<String>,
    repo_root: Option<PathBuf>,
    cycle_timeout_secs: Option<u64>,
    sticky: Option<String>,
) -> Result<()> {
    let mut config = ControllerConfig::from_env();
    if namespace.is_some() {
        config.namespace = namespace;
    }
    if let Some(root) = repo_root {
        config.repo_root = root;
    }
    if let Some(secs) = cycle_timeout_secs {
        config.cycle_timeout = Duration::from_secs(secs);
    }
    if let Some(raw) = sticky {
        config.sticky = parse_sticky(&raw);
    }

    let client = Client::try_default().await.context("building kube client")?;
    let reconciler = Reconciler::new(
        registry(&client),
        GeneratorRegistry::with_defaults(Arc::new(CheckoutRepoService::new(config.repo_root.clone()))),
        Arc::new(PlaceholderRenderer),
        Arc::new(KubeProjectSource::new(client.clone())),
        MergeEngine::new(Arc::new(KubeApplicationStore::new(client.clone())), config.sticky.clone()),
    );
    runtime::run(client, reconciler, config).await
}

async fn render_offline(file: PathBuf, clusters: Option<PathBuf>, repo_root: PathBuf, output: Output) -> Result<()> {
    let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
    let set: ApplicationSet = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
    let destinations: Vec<Destination> = match clusters {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Vec::new(),
    };
    let generators = GeneratorRegistry::with_defaults(Arc::new(CheckoutRepoService::new(repo_root)));
    let snapshot = DestinationSnapshot::new(destinations);
    let apps = assemble(&set, &generators, &PlaceholderRenderer, &snapshot).await?;
    info!(set = %set.name(), count = apps.len(), "render: assembled");
    match output {
        Output::Human => {
            for app in apps.iter() {
                println!("---\n{}", serde_yaml::to_string(app)?);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&apps)?),
    }
    Ok(())
}

async fn list_clusters(namespace: Option<String>, output: Output) -> Result<()> {
    let client = Client::try_default().await.context("building kube client")?;
    let ns = namespace.unwrap_or_else(|| client.default_namespace().to_string());
    let destinations = registry(&client).list(&ns).await?;
    match output {
        Output::Human => {
            for d in destinations.iter() {
                let version = d.server_version.as_deref().unwrap_or("-");
                println!("{} • {} • {:?} • {}", d.name, d.server, d.connection_state.status, version);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&destinations)?),
    }
    Ok(())
}

async fn requeue(namespace: Option<String>, name: String) -> Result<()> {
    let client = Client::try_default().await.context("building kube client")?;
    let ns = namespace.unwrap_or_else(|| client.default_namespace().to_string());
    let api: Api<DynamicObject> = Api::namespaced_with(client, &ns, &application_set_resource());
    let payload = serde_json::json!({
        "metadata": { "annotations": { SET_REFRESH_ANNOTATION: chrono::Utc::now().to_rfc3339() } }
    });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&payload))
        .await
        .with_context(|| format!("patching ApplicationSet {ns}/{name}"))?;
    info!(set = %name, ns = %ns, "requeue requested");
    println!("requeued {ns}/{name}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { repo_root, cycle_timeout_secs, sticky } => {
            init_metrics();
            run_controller(cli.namespace, repo_root, cycle_timeout_secs, sticky).await
        }
        Commands::Render { file, clusters, repo_root } => render_offline(file, clusters, repo_root, cli.output).await,
        Commands::Clusters => list_clusters(cli.namespace, cli.output).await,
        Commands::Requeue { name } => requeue(cli.namespace, name).await,
    }
}
