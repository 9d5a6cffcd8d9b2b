use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keel_core::Installation;
use keel_kubehub::{run_controller, KubeCluster, KubeEventSink, KubeRecordStore, RunnerConfig};
use keel_manifest::{FileTemplate, Manifest, TemplateSource};
use keel_reconcile::{Platforms, Reconciler};
use kube::{Client, CustomResourceExt};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel installation operator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Yaml, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator against the current kube context
    Run {
        /// Multi-document YAML with the resources to install
        #[arg(long, env = "KEEL_MANIFEST")]
        manifest: PathBuf,
        /// Only watch installations in this namespace
        #[arg(long = "ns", env = "KEEL_NAMESPACE")]
        namespace: Option<String>,
        /// Requeue converged records after this many seconds
        #[arg(long, env = "KEEL_RESYNC_SECS", default_value_t = 300)]
        resync_secs: u64,
        /// Requeue failed records after this many seconds
        #[arg(long, env = "KEEL_ERROR_REQUEUE_SECS", default_value_t = 15)]
        error_requeue_secs: u64,
        /// Version stamped into status on install
        #[arg(long = "install-version", env = "KEEL_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
        version: String,
    },
    /// Print the Installation CRD
    Crd,
    /// Print the overlay a record would install, without touching a cluster
    Render {
        /// Installation record (YAML)
        #[arg(short = 'f', long = "file")]
        record: PathBuf,
        #[arg(long, env = "KEEL_MANIFEST")]
        manifest: PathBuf,
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Yaml)]
        output: Output,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Re-reads the manifest on every SIGHUP. A broken file keeps the previous one.
fn spawn_reload_on_hangup(template: Arc<FileTemplate>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangups = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match template.reload() {
                Ok(count) => {
                    metrics::counter!("template_reloads_total", 1u64);
                    info!(path = %template.path().display(), resources = count, "manifest reloaded on SIGHUP");
                }
                Err(e) => warn!(error = %e, "manifest reload failed; keeping previous manifest"),
            }
        }
    });
    Ok(())
}

fn render(record: &Path, manifest: &Path, output: Output) -> Result<String> {
    let yaml = std::fs::read_to_string(record).with_context(|| format!("reading {}", record.display()))?;
    let mut record: Installation = serde_yaml::from_str(&yaml).context("parsing installation record")?;
    record.spec.set_defaults();
    // owner references need a uid; a record read from disk has none
    if record.metadata.uid.is_none() {
        record.metadata.uid = Some("00000000-0000-0000-0000-000000000000".to_string());
    }
    let template = Manifest::from_path(manifest)?;
    let chain = Platforms::new().transformers(&record)?;
    let overlay = template.transform(&chain)?;
    match output {
        Output::Yaml => Ok(overlay.to_yaml()?),
        Output::Json => Ok(serde_json::to_string_pretty(overlay.resources())?),
    }
}

async fn run(
    manifest: PathBuf,
    namespace: Option<String>,
    resync_secs: u64,
    error_requeue_secs: u64,
    version: String,
) -> Result<()> {
    let template = Arc::new(FileTemplate::load(&manifest)?);
    info!(path = %manifest.display(), resources = template.manifest().len(), "manifest loaded");
    spawn_reload_on_hangup(template.clone())?;

    let client = Client::try_default().await.context("building kube client")?;
    let instance = std::env::var("POD_NAME").ok();
    let reconciler = Reconciler::new(
        Arc::new(KubeRecordStore::new(client.clone())),
        Arc::new(KubeCluster::new(client.clone())),
        template,
        version,
    )
    .with_events(Arc::new(KubeEventSink::new(client.clone(), instance)));

    let config = RunnerConfig {
        namespace,
        resync: Duration::from_secs(resync_secs),
        error_requeue: Duration::from_secs(error_requeue_secs),
    };
    run_controller(client, Arc::new(reconciler), config).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { manifest, namespace, resync_secs, error_requeue_secs, version } => {
            run(manifest, namespace, resync_secs, error_requeue_secs, version).await?
        }
        Commands::Crd => print!("{}", serde_yaml::to_string(&Installation::crd())?),
        Commands::Render { record, manifest, output } => print!("{}", render(&record, &manifest, output)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn write_tmp(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("keelctl-{}-{}.yaml", std::process::id(), name));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn render_applies_record_overrides() {
        let record = write_tmp(
            "record",
            "apiVersion: operator.keel.dev/v1alpha1\nkind: Installation\nmetadata:\n  name: ks\n  namespace: knative-serving\nspec:\n  config:\n    config-logging:\n      loglevel.controller: debug\n",
        );
        let manifest = write_tmp(
            "manifest",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: config-logging\n  namespace: placeholder\ndata:\n  loglevel.controller: info\n",
        );
        let out = render(&record, &manifest, Output::Json).unwrap();
        let docs: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(docs[0]["metadata"]["namespace"], "knative-serving");
        assert_eq!(docs[0]["data"]["loglevel.controller"], "debug");
        assert_eq!(docs[0]["metadata"]["ownerReferences"][0]["name"], "ks");
        let _ = std::fs::remove_file(record);
        let _ = std::fs::remove_file(manifest);
    }
}
