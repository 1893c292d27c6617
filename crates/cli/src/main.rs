#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mirra_core::{InformerConfig, LabelSelector, Object, Resource};
use mirra_kubehub::KubeSource;
use mirra_store::{EventHandler, Informer};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mirractl", version, about = "Mirra CLI: list and watch any kind through a local cache")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label selector, e.g. "app=web,tier!=cache"
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    /// Resync period in seconds; 0 disables resync
    #[arg(long = "resync-secs", global = true, env = "MIRRA_RESYNC_SECS")]
    resync_secs: Option<u64>,

    /// Give up waiting for the initial listing after this many seconds
    #[arg(long = "wait-secs", global = true, env = "MIRRA_WAIT_SECS", default_value_t = 8)]
    wait_secs: u64,

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
    /// Sync the cache once and print its contents
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
    },
    /// Print the cached list, then stream add/update/delete events until Ctrl-C
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        #[arg(default_value = "apps/v1/Deployment")]
        gvk: String,
    },
}

fn init_tracing() {
    let env = std::env::var("MIRRA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MIRRA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MIRRA_METRICS_ADDR; expected host:port");
        }
    }
}

/// Prints each notification as one line on stdout.
struct Printer {
    output: Output,
}

impl Printer {
    fn line(&self, kind: &str, obj: &Object, prev_rv: Option<&str>) -> String {
        match self.output {
            Output::Human => match (kind, prev_rv) {
                ("update", Some(prev)) if prev == obj.resource_version => format!("= {} (resync)", obj.key()),
                ("update", Some(prev)) => format!("~ {} ({} -> {})", obj.key(), prev, obj.resource_version),
                ("delete", _) => format!("- {}", obj.key()),
                _ => format!("+ {}", obj.key()),
            },
            Output::Json => serde_json::json!({
                "type": kind,
                "key": obj.key().to_string(),
                "resourceVersion": obj.resource_version,
                "previousResourceVersion": prev_rv,
            })
            .to_string(),
        }
    }
}

impl EventHandler<Object> for Printer {
    fn on_add(&self, obj: &Object) -> Result<()> {
        println!("{}", self.line("add", obj, None));
        Ok(())
    }

    fn on_update(&self, old: &Object, new: &Object) -> Result<()> {
        println!("{}", self.line("update", new, Some(&old.resource_version)));
        Ok(())
    }

    fn on_delete(&self, obj: &Object) -> Result<()> {
        println!("{}", self.line("delete", obj, None));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let selector = match cli.selector.as_deref() {
        Some(s) => LabelSelector::parse(s).with_context(|| format!("parsing label selector {s:?}"))?,
        None => LabelSelector::everything(),
    };
    let mut config = InformerConfig::from_env();
    if let Some(secs) = cli.resync_secs {
        config = config.with_resync_period(Duration::from_secs(secs));
    }
    let ns = cli.namespace.as_deref();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; shutting down");
            }
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::Ls { gvk } => {
            info!(gvk = %gvk, ns = ?ns, "ls invoked");
            let source = KubeSource::connect(&gvk, ns, &selector).await?;
            let informer = Informer::new(source, config);
            let handle = informer.start(cancel.clone());

            if !wait_synced(&informer, &cancel, cli.wait_secs).await {
                warn!(wait_secs = cli.wait_secs, "cache not synced; output may be partial");
            }
            let items = snapshot(&informer, ns, &selector);
            match cli.output {
                Output::Human => {
                    println!("NAMESPACE   NAME                 AGE");
                    for item in &items {
                        let ns_col = item.namespace.as_deref().unwrap_or("-");
                        println!("{:<11} {:<20} {}", ns_col, item.name, render_age(item.creation_ts));
                    }
                }
                Output::Json => {
                    let objs: Vec<&Object> = items.iter().map(|o| o.as_ref()).collect();
                    println!("{}", serde_json::to_string_pretty(&objs)?);
                }
            }
            handle.stop().await;
        }
        Commands::Watch { gvk } => {
            info!(gvk = %gvk, ns = ?ns, "watch invoked");
            let source = KubeSource::connect(&gvk, ns, &selector).await?;
            let informer = Informer::new(source, config);
            informer.add_handler(Printer { output: cli.output });
            let handle = informer.start(cancel.clone());

            if wait_synced(&informer, &cancel, cli.wait_secs).await {
                for (idx, item) in snapshot(&informer, ns, &selector).iter().enumerate() {
                    println!("{} -> {}", idx + 1, item.name);
                }
            } else if !cancel.is_cancelled() {
                warn!(wait_secs = cli.wait_secs, "cache not synced yet; streaming anyway");
            }

            cancel.cancelled().await;
            handle.join().await;
            warn!("watch loop ended (graceful shutdown)");
        }
    }

    Ok(())
}

async fn wait_synced(informer: &Informer<KubeSource>, cancel: &CancellationToken, wait_secs: u64) -> bool {
    let synced = tokio::time::timeout(Duration::from_secs(wait_secs), informer.wait_for_initial_sync(cancel)).await;
    matches!(synced, Ok(true))
}

fn snapshot(informer: &Informer<KubeSource>, ns: Option<&str>, selector: &LabelSelector) -> Vec<Arc<Object>> {
    let lister = informer.lister();
    let mut items = match ns {
        Some(ns) => lister.namespace(ns).list(selector),
        None => lister.list(selector),
    };
    items.sort_by(|a, b| a.key().cmp(&b.key()));
    items
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 {
        return "-".to_string();
    }
    let now = chrono::Utc::now().timestamp();
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
