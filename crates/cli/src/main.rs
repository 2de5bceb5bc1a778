use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use metrics::counter;
use tokio::signal;
use tracing::{error, info, warn};
use trellis_core::{Cluster, Config};
use trellis_engine::{Actor, Deploy, PassContext, ReconcileEngine};
use trellis_kubehub::KubeStore;

#[derive(Parser, Debug)]
#[command(name = "trellisctl", version, about = "Converge a database cluster's managed objects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Override the cluster's namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run passes against the current kube context until nothing changes
    Converge {
        /// Cluster manifest (YAML)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Give up after this many passes
        #[arg(long = "max-passes", env = "TRELLIS_MAX_PASSES", default_value_t = 20)]
        max_passes: usize,
        /// Pause between passes
        #[arg(long = "pass-delay-ms", env = "TRELLIS_PASS_DELAY_MS", default_value_t = 1000)]
        pass_delay_ms: u64,
    },
    /// Print the desired objects without contacting a cluster
    Render {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Show which actions the cluster's conditions allow
    Gate {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("TRELLIS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TRELLIS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TRELLIS_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_cluster(path: &Path, namespace: Option<&str>) -> Result<Cluster> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut cluster: Cluster = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    if let Some(ns) = namespace {
        cluster.metadata.namespace = ns.to_string();
    }
    if cluster.metadata.namespace.is_empty() {
        bail!("{}: metadata.namespace is required (or pass --ns)", path.display());
    }
    Ok(cluster)
}

enum PassEnd {
    Converged,
    Changed,
    Retry,
}

/// One pass: every eligible actor once, stopping at the first that changed something.
async fn run_pass(actors: &[Box<dyn Actor>], cluster: &Cluster) -> Result<PassEnd> {
    for actor in actors.iter().filter(|a| a.handles(cluster.conditions())) {
        let (mut pass, mut signal) = PassContext::new(cluster.key());
        match actor.act(&mut pass, cluster).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                warn!(action = %actor.action_type(), error = %e, "pass failed; will retry");
                return Ok(PassEnd::Retry);
            }
            Err(e) => return Err(e).context("pass failed"),
        }
        drop(pass);
        if let Some(c) = signal.fired() {
            info!(action = %actor.action_type(), reason = %c.reason, "pass cancelled");
            return Ok(PassEnd::Changed);
        }
    }
    Ok(PassEnd::Converged)
}

/// How a converge run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Converged { passes: usize },
    /// No action is eligible under the owner's current conditions.
    Blocked,
}

impl Finish {
    fn report(self, output: Output) -> String {
        match (self, output) {
            (Finish::Converged { passes }, Output::Human) => format!("converged after {} passes", passes),
            (Finish::Blocked, Output::Human) => "blocked: no action handles the current conditions".to_string(),
            (Finish::Converged { passes }, Output::Json) => serde_json::json!({ "converged": true, "passes": passes }).to_string(),
            (Finish::Blocked, Output::Json) => serde_json::json!({ "converged": false, "blocked": true }).to_string(),
        }
    }

    fn exit_code(self) -> i32 {
        match self {
            Finish::Converged { .. } => 0,
            Finish::Blocked => 2,
        }
    }
}

async fn converge(cluster: Cluster, config: Config, max_passes: usize, delay: Duration) -> Result<Finish> {
    let store = KubeStore::try_default().await.context("connecting to cluster")?;
    let engine = Arc::new(ReconcileEngine::from_config(Arc::new(store), &config));
    let actors: Vec<Box<dyn Actor>> = vec![Box::new(Deploy::new(engine, &config.feature_gates))];

    if !actors.iter().any(|a| a.handles(cluster.conditions())) {
        warn!(cluster = %cluster.key(), "no action handles the current conditions");
        return Ok(Finish::Blocked);
    }
    for n in 1..=max_passes {
        counter!("converge_passes_total", 1u64);
        match run_pass(&actors, &cluster).await? {
            PassEnd::Converged => {
                info!(cluster = %cluster.key(), passes = n, "converged");
                return Ok(Finish::Converged { passes: n });
            }
            PassEnd::Changed | PassEnd::Retry => {}
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = signal::ctrl_c() => bail!("interrupted after {n} passes"),
        }
    }
    bail!("{} not converged after {} passes", cluster.key(), max_passes)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = Config::from_env().context("reading TRELLIS_* environment")?;

    match cli.command {
        Commands::Converge { file, max_passes, pass_delay_ms } => {
            let cluster = load_cluster(&file, cli.namespace.as_deref())?;
            info!(cluster = %cluster.key(), max_passes, "converge invoked");
            match converge(cluster, config, max_passes, Duration::from_millis(pass_delay_ms)).await {
                Ok(finish) => {
                    println!("{}", finish.report(cli.output));
                    if finish.exit_code() != 0 {
                        std::process::exit(finish.exit_code());
                    }
                }
                Err(e) => {
                    error!(error = ?e, "converge failed");
                    return Err(e);
                }
            }
        }
        Commands::Render { file } => {
            let cluster = load_cluster(&file, cli.namespace.as_deref())?;
            let rendered = Deploy::steps().render(&cluster).context("building desired objects")?;
            match cli.output {
                Output::Human => {
                    for (label, obj) in rendered {
                        println!("---");
                        match obj {
                            Some(obj) => print!("# {}\n{}", label, serde_yaml::to_string(&obj)?),
                            None => println!("# {}: skipped", label),
                        }
                    }
                }
                Output::Json => {
                    let items: Vec<_> = rendered.into_iter().filter_map(|(_, obj)| obj).collect();
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
        }
        Commands::Gate { file } => {
            let cluster = load_cluster(&file, cli.namespace.as_deref())?;
            let handles = Deploy::gate(&config.feature_gates).handles(cluster.conditions());
            match cli.output {
                Output::Human => println!("Deploy\t{}", if handles { "eligible" } else { "blocked" }),
                Output::Json => println!("{}", serde_json::json!({ "Deploy": handles })),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_run_is_not_reported_as_converged() {
        let blocked = Finish::Blocked;
        assert_eq!(blocked.report(Output::Human), "blocked: no action handles the current conditions");
        let v: serde_json::Value = serde_json::from_str(&blocked.report(Output::Json)).unwrap();
        assert_eq!(v, serde_json::json!({ "converged": false, "blocked": true }));
        assert_ne!(blocked.exit_code(), 0);

        let done = Finish::Converged { passes: 3 };
        assert_eq!(done.report(Output::Human), "converged after 3 passes");
        assert_eq!(done.exit_code(), 0);
    }
}
