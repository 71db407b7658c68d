use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::Value as Json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use yoke_apply::Pilot;
use yoke_core::{Error, ReleaseRef, Settings};
use yoke_flight::{FlightProducer, FlightRuntime, ManifestProducer, Producer, RuntimeLimits, WASMTIME_VERSION};
use yoke_kubehub::{Cluster, KubeCluster, MemoryCluster};
use yoke_persist::{RevisionStore, SqliteStore};

mod render;

#[derive(Parser, Debug)]
#[command(name = "yoke", version, about = "Deploy WebAssembly flights to Kubernetes")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the release
    #[arg(short = 'n', long = "namespace", global = true, default_value = "default")]
    namespace: String,

    /// Kubeconfig to use instead of the inferred one
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render a flight and apply it as the next revision of a release
    #[command(visible_aliases = ["up", "apply"])]
    Takeoff {
        release: String,
        /// Flight module (.wasm or .wat)
        #[arg(required_unless_present = "manifest", conflicts_with = "manifest")]
        flight: Option<PathBuf>,
        /// Apply YAML/JSON manifests (a file or a directory) instead of a flight
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Render and print the resources; the cluster and history are not touched
        #[arg(long = "test-run", action = ArgAction::SetTrue)]
        test_run: bool,
        /// Print what would change and stop
        #[arg(long = "diff-only", action = ArgAction::SetTrue)]
        diff_only: bool,
        /// Render timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Arguments for the flight
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Roll a release back to a stored revision
    #[command(visible_aliases = ["down", "restore"])]
    Descent { release: String, revision: u64 },
    /// Delete a release's resources and history
    #[command(visible_alias = "delete")]
    Mayday { release: String },
    /// Show revision history, one revision, or the diff between two
    #[command(visible_alias = "inspect")]
    Blackbox { release: String, revision: Option<u64>, other: Option<u64> },
    /// Compare live state with the active revision
    #[command(visible_alias = "drift")]
    Turbulence {
        release: String,
        /// Re-apply the active revision to undo drift
        #[arg(long, action = ArgAction::SetTrue)]
        fix: bool,
    },
    /// Print yoke and wasmtime versions
    Version,
}

/// `--debug` wins over `YOKE_LOG`; with neither, `info`.
fn log_directive(debug: bool, env: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    env.unwrap_or_else(|| "info".to_string())
}

fn init_tracing(debug: bool) {
    let env = log_directive(debug, std::env::var("YOKE_LOG").ok());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(debug).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("YOKE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid YOKE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Values piped on stdin, as YAML or JSON. `Null` when stdin is a terminal or empty.
fn read_values() -> Result<Json> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(Json::Null);
    }
    let mut raw = Vec::new();
    stdin.read_to_end(&mut raw).context("reading values from stdin")?;
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Json::Null);
    }
    serde_yaml::from_slice(&raw).context("values on stdin are neither YAML nor JSON")
}

struct Ctx {
    settings: Settings,
    kubeconfig: Option<PathBuf>,
    output: Output,
    namespace: String,
    cancel: CancellationToken,
}

impl Ctx {
    fn release(&self, name: &str) -> ReleaseRef {
        ReleaseRef::new(name, self.namespace.as_str())
    }

    async fn cluster(&self) -> Result<Arc<dyn Cluster>> {
        let cluster = KubeCluster::connect(self.kubeconfig.as_deref()).await?;
        Ok(Arc::new(cluster))
    }

    fn store(&self) -> Result<Arc<dyn RevisionStore>> {
        let store = SqliteStore::open(&self.settings.db_path)
            .with_context(|| format!("opening revision store {}", self.settings.db_path.display()))?;
        Ok(Arc::new(store))
    }

    async fn pilot(&self) -> Result<Pilot> {
        Ok(Pilot::from_settings(self.cluster().await?, self.store()?, &self.settings))
    }
}

struct TakeoffArgs {
    release: String,
    flight: Option<PathBuf>,
    manifest: Option<PathBuf>,
    test_run: bool,
    diff_only: bool,
    timeout: Option<u64>,
    args: Vec<String>,
}

async fn takeoff(ctx: &Ctx, t: TakeoffArgs) -> Result<()> {
    let release = ctx.release(&t.release);
    let mut settings = ctx.settings.clone();
    if let Some(secs) = t.timeout {
        settings.flight_timeout = Duration::from_secs(secs);
    }
    let values = read_values()?;
    // A test run sees an empty cluster: lookups answer NotFound.
    let cluster: Arc<dyn Cluster> = if t.test_run { Arc::new(MemoryCluster::new()) } else { ctx.cluster().await? };

    let producer: Box<dyn Producer> = match (t.manifest, t.flight) {
        (Some(path), _) => {
            if !values.is_null() {
                warn!("values on stdin are ignored for manifests");
            }
            Box::new(ManifestProducer::new(path))
        }
        (None, Some(path)) => {
            let runtime = FlightRuntime::new(RuntimeLimits::from(&settings));
            Box::new(FlightProducer::new(path, runtime, cluster.clone()).with_args(t.args))
        }
        (None, None) => anyhow::bail!("a flight path or --manifest is required"),
    };

    let rendered = producer.render(&release, &values, &ctx.cancel).await?;
    info!(release = %release, resources = rendered.resources.len(), lookups = rendered.lookups.len(), "rendered");
    if t.test_run {
        return render::resources(ctx.output, &rendered.resources);
    }

    let pilot = Pilot::from_settings(cluster, ctx.store()?, &settings);
    if t.diff_only {
        let plan = pilot.plan(&release, &rendered.resources).await?;
        return render::plan(ctx.output, &plan);
    }
    let report = pilot.takeoff(&release, rendered.resources, rendered.source, &ctx.cancel).await?;
    render::report(ctx.output, &report)
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let ctx = Ctx {
        settings: Settings::from_env(),
        kubeconfig: cli.kubeconfig,
        output: cli.output,
        namespace: cli.namespace,
        cancel,
    };

    match cli.command {
        Commands::Takeoff { release, flight, manifest, test_run, diff_only, timeout, args } => {
            takeoff(&ctx, TakeoffArgs { release, flight, manifest, test_run, diff_only, timeout, args }).await
        }
        Commands::Descent { release, revision } => {
            let pilot = ctx.pilot().await?;
            let report = pilot.descent(&ctx.release(&release), revision, &ctx.cancel).await?;
            render::report(ctx.output, &report)
        }
        Commands::Mayday { release } => {
            let pilot = ctx.pilot().await?;
            let report = pilot.mayday(&ctx.release(&release), &ctx.cancel).await?;
            render::report(ctx.output, &report)
        }
        Commands::Blackbox { release, revision, other } => {
            // History only; no cluster connection needed.
            let pilot = Pilot::from_settings(Arc::new(MemoryCluster::new()), ctx.store()?, &ctx.settings);
            let release = ctx.release(&release);
            match (revision, other) {
                (Some(from), Some(to)) => render::revision_diff(ctx.output, &pilot.compare(&release, from, to)?),
                (revision, _) => render::inspection(ctx.output, &pilot.blackbox(&release, revision)?),
            }
        }
        Commands::Turbulence { release, fix } => {
            let pilot = ctx.pilot().await?;
            let release = ctx.release(&release);
            if fix {
                let report = pilot.fix(&release, &ctx.cancel).await?;
                render::report(ctx.output, &report)
            } else {
                render::drift(ctx.output, &pilot.turbulence(&release).await?)
            }
        }
        Commands::Version => render::version(ctx.output, env!("CARGO_PKG_VERSION"), WASMTIME_VERSION),
    }
}

/// Print `err`; true when it is only a warning and the exit stays clean.
fn report_error(output: Output, err: &anyhow::Error) -> bool {
    match err.downcast_ref::<Error>() {
        Some(e) if e.is_warning() => {
            eprintln!("warning: {e}");
            true
        }
        Some(Error::ReconcileFailure(report)) => {
            if let Err(e) = render::report(output, report) {
                eprintln!("error: printing report: {e}");
            }
            eprintln!("error: {err}");
            false
        }
        _ => {
            eprintln!("error: {err:#}");
            false
        }
    }
}

fn watch_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    init_metrics();
    let output = cli.output;
    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());

    match run(cli, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if report_error(output, &e) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn aliases_resolve_to_commands() {
        let cli = Cli::try_parse_from(["yoke", "up", "app", "flight.wasm", "--", "--replicas", "3"]).unwrap();
        match cli.command {
            Commands::Takeoff { release, flight, args, .. } => {
                assert_eq!(release, "app");
                assert_eq!(flight, Some(PathBuf::from("flight.wasm")));
                assert_eq!(args, vec!["--replicas", "3"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(Cli::try_parse_from(["yoke", "restore", "app", "2"]).unwrap().command, Commands::Descent { revision: 2, .. }));
        assert!(matches!(Cli::try_parse_from(["yoke", "delete", "app"]).unwrap().command, Commands::Mayday { .. }));
        assert!(matches!(Cli::try_parse_from(["yoke", "drift", "app", "--fix"]).unwrap().command, Commands::Turbulence { fix: true, .. }));
        assert!(matches!(
            Cli::try_parse_from(["yoke", "inspect", "app", "1", "2"]).unwrap().command,
            Commands::Blackbox { revision: Some(1), other: Some(2), .. }
        ));
    }

    #[test]
    fn globals_apply_after_the_subcommand() {
        let cli = Cli::try_parse_from(["yoke", "takeoff", "app", "--manifest", "k8s/", "-n", "prod", "-o", "json"]).unwrap();
        assert_eq!(cli.namespace, "prod");
        assert_eq!(cli.output, Output::Json);
        assert!(matches!(cli.command, Commands::Takeoff { manifest: Some(_), flight: None, .. }));
    }

    #[test]
    fn takeoff_needs_a_source() {
        assert!(Cli::try_parse_from(["yoke", "takeoff", "app"]).is_err());
        assert!(Cli::try_parse_from(["yoke", "takeoff", "app", "f.wasm", "--manifest", "m.yaml"]).is_err());
    }

    #[test]
    fn warnings_exit_zero() {
        let warning = anyhow::Error::new(Error::Warning("nothing to do".into()));
        assert!(report_error(Output::Human, &warning));
        let failure = anyhow::Error::new(Error::RenderFailure("trap".into()));
        assert!(!report_error(Output::Human, &failure));
    }

    #[test]
    fn log_level_defaults_to_info() {
        assert_eq!(log_directive(false, None), "info");
        assert_eq!(log_directive(false, Some("yoke_apply=trace".into())), "yoke_apply=trace");
        assert_eq!(log_directive(true, Some("error".into())), "debug");
    }
}
