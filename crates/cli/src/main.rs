use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use metrics::counter;
use recon_commit::Committer;
use recon_controller::{
    Action, AggregateError, Controller, ControllerOptions, EnqueueHandler, ReconcileContext, Reconciler,
};
use recon_core::{DynamicObject, ObjectKey};
use recon_kubehub::{dynamic_api, find_api_resource, parse_gvk_key, KubeWriter};
use recon_store::{FilteringHandler, Informer, Selector};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "reconctl", version, about = "Level-triggered reconciliation controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch a GVK and stamp an annotation on every object
    Run(RunArgs),
    /// Print the effective controller options as YAML
    Config(OptionArgs),
}

#[derive(Args, Debug)]
struct OptionArgs {
    /// YAML file with controller options
    #[arg(long = "config")]
    config: Option<std::path::PathBuf>,
    /// Controller name (queue name, log field, metric label)
    #[arg(long = "name")]
    name: Option<String>,
    #[arg(long = "workers")]
    workers: Option<usize>,
    /// Retries before a failing key is dropped
    #[arg(long = "max-requeues")]
    max_requeues: Option<u32>,
    /// Full resync interval in seconds (0 disables)
    #[arg(long = "resync-secs")]
    resync_secs: Option<u64>,
}

impl OptionArgs {
    /// File (or defaults), then `RECON_*` env, then flags.
    fn options(&self) -> Result<ControllerOptions> {
        let mut opts = match &self.config {
            Some(path) => ControllerOptions::from_yaml_file(path)?,
            None => ControllerOptions::new("reconctl"),
        }
        .with_env_overrides();
        if let Some(name) = &self.name {
            opts.name = name.clone();
        }
        if let Some(workers) = self.workers {
            opts.workers = workers;
        }
        if let Some(max) = self.max_requeues {
            opts.max_requeues = max;
        }
        if let Some(secs) = self.resync_secs {
            opts = opts.with_resync(Duration::from_secs(secs));
        }
        Ok(opts)
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// GVK key, e.g. "v1/ConfigMap" or "rbac.authorization.k8s.io/v1/ClusterRole"
    gvk: String,
    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns")]
    namespace: Option<String>,
    /// Logical cluster name recorded in object keys
    #[arg(long = "cluster", default_value = "")]
    cluster: String,
    /// Only reconcile objects carrying these labels (k=v,k2=v2)
    #[arg(long = "selector")]
    selector: Option<String>,
    /// Annotation to stamp, as key=value
    #[arg(long = "annotation", default_value = "recon.dev/reconciled=true")]
    annotation: String,
    #[command(flatten)]
    options: OptionArgs,
}

fn init_tracing() {
    let env = std::env::var("RECON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RECON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RECON_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_pair(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(anyhow!("expected key=value, got {:?}", s)),
    }
}

fn parse_selector(s: &str, namespace: Option<&str>) -> Result<Selector> {
    let mut sel = Selector { namespace: namespace.map(str::to_string), ..Selector::everything() };
    for pair in s.split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = parse_pair(pair)?;
        sel = sel.with_label(k, v);
    }
    Ok(sel)
}

/// Ensures every object carries `key: value`.
struct AnnotationStamper {
    key: String,
    value: String,
}

#[async_trait]
impl Reconciler<DynamicObject> for AnnotationStamper {
    async fn reconcile(&self, ctx: &ReconcileContext, obj: Option<&mut DynamicObject>) -> Result<Action> {
        let Some(obj) = obj else {
            debug!(key = %ctx.key, "object gone, nothing to do");
            return Ok(Action::done());
        };
        if obj.metadata.annotation(&self.key) != Some(self.value.as_str()) {
            obj.metadata.annotations.insert(self.key.clone(), self.value.clone());
            counter!("reconctl_stamped_total", 1u64);
        }
        Ok(Action::done())
    }

    async fn post_reconcile(
        &self,
        _ctx: &ReconcileContext,
        key: &ObjectKey,
        _prev: Option<&DynamicObject>,
        _cur: Option<&DynamicObject>,
        err: Option<&AggregateError>,
    ) -> Result<()> {
        if let Some(err) = err {
            debug!(key = %key, error = %err, "reconcile finished with errors");
        }
        Ok(())
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let opts = args.options.options()?;
    let (key, value) = parse_pair(&args.annotation)?;
    let selector = args.selector.as_deref().map(|s| parse_selector(s, args.namespace.as_deref())).transpose()?;

    let client = kube::Client::try_default().await?;
    let gvk = parse_gvk_key(&args.gvk)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api = dynamic_api(client.clone(), &ar, namespaced, args.namespace.as_deref());
    let committer = Arc::new(Committer::new(KubeWriter::new(client, ar, namespaced).with_field_manager(opts.name.clone())));

    let informer = Arc::new(Informer::<DynamicObject>::new());
    let builder = Controller::<DynamicObject>::builder(opts.clone(), AnnotationStamper { key, value }).committer(committer);
    let controller = match selector {
        Some(sel) => {
            let controller = builder.build_with_store(informer.store());
            let enqueue = Arc::new(EnqueueHandler::new(controller.enqueuer()));
            let handler = Arc::new(FilteringHandler::new(move |o: &DynamicObject| sel.matches(o), enqueue));
            match opts.resync_period {
                Some(period) => informer.add_handler_with_resync(handler, period),
                None => informer.add_handler(handler),
            }
            controller
        }
        None => builder.build(&informer),
    };
    info!(gvk = %args.gvk, ns = ?args.namespace, controller = %opts.name, workers = opts.workers, "reconctl started");

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(1024);
    let informer_task = tokio::spawn({
        let informer = Arc::clone(&informer);
        let cancel = cancel.clone();
        async move { informer.run(rx, cancel).await }
    });
    let watcher_task = tokio::spawn({
        let cancel = cancel.clone();
        let cluster = args.cluster.clone();
        async move {
            if let Err(e) = recon_kubehub::watch(api, cluster, tx, cancel).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });
    let controller_task = tokio::spawn({
        let controller = controller.clone();
        let cancel = cancel.clone();
        let workers = opts.workers;
        async move { controller.start(cancel, workers).await }
    });

    signal::ctrl_c().await?;
    info!("Ctrl-C received; shutting down");
    cancel.cancel();
    for (name, task) in [("controller", controller_task), ("watcher", watcher_task), ("informer", informer_task)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "task failed during shutdown");
        }
    }
    info!("reconctl stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Config(args) => {
            print!("{}", serde_yaml::to_string(&args.options()?)?);
            Ok(())
        }
    }
}
