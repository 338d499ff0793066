use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use cairn_apply::{Executor, Plan};
use cairn_controller::{Reconciler, Settings};
use cairn_core::{Cluster, ClusterDefinition, ClusterVersion, ObservedState};
use cairn_graph::{Action, Graph};
use cairn_kubehub::KubeHub;
use cairn_transform::{Pipeline, TransformContext};
use clap::{Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use serde::de::DeserializeOwned;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cairnctl", version, about = "Cairn database-cluster controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch Clusters and reconcile them until Ctrl-C
    Run {
        /// Concurrent reconcile workers
        #[arg(long = "workers")]
        workers: Option<usize>,
        /// Only watch this namespace (default: all)
        #[arg(long = "namespace")]
        namespace: Option<String>,
    },
    /// Derive the objects for a Cluster from local YAML files and print the ordered plan
    Plan {
        #[arg(long = "cluster")]
        cluster: PathBuf,
        #[arg(long = "definition")]
        definition: PathBuf,
        #[arg(long = "version")]
        version: PathBuf,
    },
    /// Print the CustomResourceDefinitions cairn serves, as a YAML stream
    Crds,
}

fn init_tracing() {
    let env = std::env::var("CAIRN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CAIRN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CAIRN_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn action_label(a: Action) -> &'static str {
    match a {
        Action::Create => "create",
        Action::Update => "update",
        Action::Delete => "delete",
        Action::NoOp => "noop",
    }
}

async fn cmd_run(workers: Option<usize>, namespace: Option<String>) -> Result<()> {
    let mut settings = Settings::from_env();
    if let Some(w) = workers {
        settings.workers = w.max(1);
    }
    if namespace.is_some() {
        settings.watch_namespace = namespace;
    }
    info!(?settings, "starting controller");

    let hub = Arc::new(KubeHub::connect(&settings.field_manager).await?);
    let client = hub.client().clone();
    let reconciler = Arc::new(Reconciler::new(hub, settings));
    let shutdown = CancellationToken::new();
    let controller = tokio::spawn(cairn_controller::run(client, reconciler, shutdown.clone()));

    signal::ctrl_c().await?;
    info!("Ctrl-C received; draining in-flight cycles");
    shutdown.cancel();
    controller.await?;
    warn!("controller stopped");
    Ok(())
}

fn crds_yaml() -> Result<String> {
    let docs = [
        serde_yaml::to_string(&Cluster::crd())?,
        serde_yaml::to_string(&ClusterDefinition::crd())?,
        serde_yaml::to_string(&ClusterVersion::crd())?,
    ];
    Ok(docs.join("---\n"))
}

fn cmd_crds(output: Output) -> Result<()> {
    match output {
        Output::Human => print!("{}", crds_yaml()?),
        Output::Json => {
            let crds = [Cluster::crd(), ClusterDefinition::crd(), ClusterVersion::crd()];
            println!("{}", serde_json::to_string_pretty(&crds)?);
        }
    }
    Ok(())
}

/// Run one pipeline for `cluster` against an empty observed state.
fn build_plan(cluster: Cluster, definition: ClusterDefinition, version: ClusterVersion) -> Result<Plan> {
    cluster.validate()?;
    let mut ctx = TransformContext::new(cluster, ObservedState::new())
        .with_definition(Some(definition))
        .with_version(Some(version));
    let mut dag = Graph::new();
    Pipeline::cluster_default().run(&mut ctx, &mut dag)?;
    Ok(Executor::new().plan(&ctx, dag.seal()?)?)
}

fn cmd_plan(output: Output, cluster: &Path, definition: &Path, version: &Path) -> Result<()> {
    let plan = build_plan(load_yaml(cluster)?, load_yaml(definition)?, load_yaml(version)?)?;

    match output {
        Output::Human => {
            for step in plan.steps() {
                println!("{:<7} {}", action_label(step.action), step.key);
                for succ in plan.graph().successors(&step.key) {
                    println!("        -> {}", succ);
                }
            }
            println!(
                "{} objects: {} create, {} update, {} delete",
                plan.steps().len(),
                plan.count(Action::Create),
                plan.count(Action::Update),
                plan.count(Action::Delete)
            );
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(plan.steps())?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { workers, namespace } => cmd_run(workers, namespace).await?,
        Commands::Plan { cluster, definition, version } => cmd_plan(cli.output, &cluster, &definition, &version)?,
        Commands::Crds => cmd_crds(cli.output)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_store::fixtures;

    #[test]
    fn plan_creates_every_object_in_dependency_order() {
        let plan = build_plan(
            fixtures::cluster().unwrap(),
            fixtures::definition().unwrap(),
            fixtures::version().unwrap(),
        )
        .unwrap();
        assert_eq!(plan.count(Action::Create), plan.steps().len());
        let pos = |kind: &str, name: &str| {
            plan.steps().iter().position(|s| s.key.kind == kind && s.key.name == name).unwrap()
        };
        assert!(pos("ConfigMap", "pg-main-config") < pos("StatefulSet", "pg-main"));
        assert!(pos("StatefulSet", "pg-main") < pos("Service", "pg-main"));
    }

    #[test]
    fn plan_rejects_an_invalid_cluster() {
        let mut cluster = fixtures::cluster().unwrap();
        cluster.spec.components.clear();
        assert!(build_plan(cluster, fixtures::definition().unwrap(), fixtures::version().unwrap()).is_err());
    }

    #[test]
    fn crds_stream_carries_all_three_resources() {
        let yaml = crds_yaml().unwrap();
        let docs: Vec<serde_yaml::Value> = yaml.split("---\n").map(|d| serde_yaml::from_str(d).unwrap()).collect();
        let names: Vec<&str> = docs.iter().map(|d| d["metadata"]["name"].as_str().unwrap()).collect();
        assert_eq!(names, ["clusters.apps.cairn.io", "clusterdefinitions.apps.cairn.io", "clusterversions.apps.cairn.io"]);
        assert!(docs.iter().all(|d| d["kind"].as_str() == Some("CustomResourceDefinition")));
    }

    #[test]
    fn output_flag_is_global() {
        let cli = Cli::parse_from([
            "cairnctl", "plan", "--cluster", "c.yaml", "--definition", "d.yaml", "--version", "v.yaml", "-o", "json",
        ]);
        assert_eq!(cli.output, Output::Json);
        assert!(matches!(cli.command, Commands::Plan { .. }));
    }
}
