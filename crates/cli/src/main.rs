use std::future::pending;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use metrics::counter;
use skiff_core::{Environment, PortMapping, ServiceCatalog, Target};
use skiff_ops::{ForwardEvent, KubeOps, LogChunk, LogOptions, PodOps, SessionKind, SessionTable, StreamHandle};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

mod select;

#[derive(Parser, Debug)]
#[command(name = "skiffctl", version, about = "Find a service instance by name and environment, then tunnel to it")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Only look at this namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "SKIFF_NAMESPACE")]
    namespace: Option<String>,

    /// Where to read the pod listing from
    #[arg(long = "source", value_enum, global = true, default_value_t = SourceArg::Kubectl)]
    source: SourceArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SourceArg { Kubectl, Api }

impl From<SourceArg> for skiff_kubehub::Source {
    fn from(v: SourceArg) -> Self {
        match v {
            SourceArg::Kubectl => skiff_kubehub::Source::Kubectl,
            SourceArg::Api => skiff_kubehub::Source::Api,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List discovered services and the environments they run in
    Services,
    /// Show the pod a service/environment resolves to
    Resolve {
        service: String,
        /// Environment: dev, qa or stg
        #[arg(short = 'e', long = "env")]
        env: Environment,
        /// Also print the equivalent kubectl port-forward for LOCAL:REMOTE
        #[arg(short = 'p', long = "port")]
        port: Option<PortMapping>,
    },
    /// Open a local tunnel to a service instance (Ctrl-C to stop)
    Forward {
        service: String,
        #[arg(short = 'e', long = "env")]
        env: Environment,
        /// PORT or LOCAL:REMOTE (LOCAL 0 picks a free port)
        #[arg(short = 'p', long = "port")]
        port: PortMapping,
        /// Stream the pod's logs while the tunnel is open
        #[arg(long = "logs", action = ArgAction::SetTrue)]
        logs: bool,
        #[arg(short = 'c', long = "container")]
        container: Option<String>,
    },
    /// Stream logs from a service instance
    Logs {
        service: String,
        #[arg(short = 'e', long = "env")]
        env: Environment,
        #[arg(short = 'c', long = "container")]
        container: Option<String>,
        /// Lines of recent log to show first
        #[arg(long = "tail")]
        tail: Option<i64>,
        /// Only show logs newer than this many seconds
        #[arg(long = "since")]
        since: Option<i64>,
        /// Print what is there and exit
        #[arg(long = "no-follow", action = ArgAction::SetTrue)]
        no_follow: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("SKIFF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SKIFF_METRICS_ADDR; expected host:port");
        }
    }
}

/// `--ns ""` (or an empty `SKIFF_NAMESPACE`) means all namespaces.
fn namespace_filter(cli: &Cli) -> Option<&str> {
    cli.namespace.as_deref().filter(|ns| !ns.is_empty())
}

async fn discover(cli: &Cli) -> Result<ServiceCatalog> {
    skiff_kubehub::discover(cli.source.into(), namespace_filter(cli))
        .await
        .context("discovering services")
}

/// Next log line, or never once the stream is gone.
async fn next_line(rx: &mut Option<mpsc::Receiver<LogChunk>>) -> Option<LogChunk> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

fn print_services(catalog: &ServiceCatalog, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<32} {:<14} NAMESPACE", "SERVICE", "ENVIRONMENTS");
            for (name, bindings) in catalog.iter() {
                let envs: Vec<&str> = bindings.keys().map(|e| e.as_str()).collect();
                let mut namespaces: Vec<&str> = bindings.values().map(|r| r.namespace.as_str()).collect();
                namespaces.sort_unstable();
                namespaces.dedup();
                println!("{:<32} {:<14} {}", name, envs.join(","), namespaces.join(","));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(catalog)?),
    }
    Ok(())
}

async fn run_forward(target: &Target, ports: PortMapping, logs: bool, container: Option<&str>) -> Result<()> {
    let ops = KubeOps::new();
    let mut sessions = SessionTable::new();

    let tunnel = sessions.open(SessionKind::Tunnel, target.to_string());
    let StreamHandle { rx: mut pf_rx, cancel } = ops
        .target_port_forward(target, ports)
        .await
        .with_context(|| format!("port-forward to {}", target))?;
    sessions.attach_cancel(tunnel, cancel)?;
    counter!("cli_tunnels_opened_total", 1);

    let mut log_rx = None;
    let mut log_session = None;
    if logs {
        let id = sessions.open(SessionKind::Logs, target.to_string());
        let StreamHandle { rx, cancel } = ops.target_logs(target, container, LogOptions::default()).await?;
        sessions.attach_cancel(id, cancel)?;
        sessions.activate(id)?;
        log_rx = Some(rx);
        log_session = Some(id);
    }

    loop {
        tokio::select! {
            ev = pf_rx.recv() => {
                match ev {
                    Some(ForwardEvent::Ready(addr)) => {
                        sessions.activate(tunnel)?;
                        println!("Forwarding {} -> {}:{} ({})", addr, target.pod_name(), ports.remote, target.namespace());
                    }
                    Some(ForwardEvent::Connected(peer)) => info!(peer = %peer, "connection accepted"),
                    Some(ForwardEvent::Error(e)) => warn!(error = %e, "port-forward error"),
                    Some(ForwardEvent::Closed) | None => {
                        warn!("port-forward closed");
                        break;
                    }
                }
            }
            line = next_line(&mut log_rx), if log_session.is_some() => {
                match line {
                    Some(chunk) => println!("{}", chunk.line),
                    None => {
                        if let Some(id) = log_session.take() {
                            let _ = sessions.dispose(id);
                        }
                        info!("log stream ended");
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; closing sessions");
                break;
            }
        }
    }
    sessions.dispose_all();
    Ok(())
}

async fn run_logs(target: &Target, container: Option<&str>, opts: LogOptions) -> Result<()> {
    let ops = KubeOps::new();
    let mut sessions = SessionTable::new();
    let id = sessions.open(SessionKind::Logs, target.to_string());
    let StreamHandle { mut rx, cancel } = ops
        .target_logs(target, container, opts)
        .await
        .with_context(|| format!("logs for {}", target))?;
    sessions.attach_cancel(id, cancel)?;
    sessions.activate(id)?;
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(chunk) => println!("{}", chunk.line),
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping log stream");
                break;
            }
        }
    }
    sessions.dispose(id)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Services => {
            info!(ns = ?cli.namespace, source = ?cli.source, "services invoked");
            let catalog = discover(&cli).await?;
            print_services(&catalog, cli.output)?;
        }
        Commands::Resolve { service, env, port } => {
            info!(service = %service, env = %env, "resolve invoked");
            let catalog = discover(&cli).await?;
            let target = select::select_target(&catalog, service, *env)?;
            match cli.output {
                Output::Human => {
                    println!("{}", target.pod_name());
                    println!("namespace: {}", target.namespace());
                    println!("discriminator: {}", target.instance.discriminator_id);
                    if let Some(ports) = port {
                        println!("kubectl {}", target.port_forward_args(*ports).join(" "));
                    }
                    println!("kubectl {}", target.logs_args(true).join(" "));
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Resolved<'a> { pod: String, target: &'a Target }
                    println!("{}", serde_json::to_string_pretty(&Resolved { pod: target.pod_name(), target: &target })?);
                }
            }
        }
        Commands::Forward { service, env, port, logs, container } => {
            info!(service = %service, env = %env, port = %port, logs, "forward invoked");
            let catalog = discover(&cli).await?;
            let target = select::select_target(&catalog, service, *env)?;
            run_forward(&target, *port, *logs, container.as_deref()).await?;
        }
        Commands::Logs { service, env, container, tail, since, no_follow } => {
            info!(service = %service, env = %env, "logs invoked");
            let catalog = discover(&cli).await?;
            let target = select::select_target(&catalog, service, *env)?;
            let opts = LogOptions { follow: !*no_follow, tail_lines: *tail, since_seconds: *since };
            run_logs(&target, container.as_deref(), opts).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_namespace_flag_means_all_namespaces() {
        let cli = Cli::try_parse_from(["skiffctl", "--ns", "", "services"]).expect("parse");
        assert_eq!(namespace_filter(&cli), None);
        let cli = Cli::try_parse_from(["skiffctl", "--ns", "team-a", "services"]).expect("parse");
        assert_eq!(namespace_filter(&cli), Some("team-a"));
    }
}
