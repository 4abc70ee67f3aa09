//! kube-service-tunnel - Kubernetes services on stable local names
//!
//! Port-forwards cluster services to the local machine and makes each one
//! reachable as `http://<service>.<namespace>` through a local reverse proxy
//! and a managed section of the hosts file.

mod api;
mod error;
mod hosts;
mod k8s;
mod pipe;
mod portforward;
mod ports;
mod proxy;
mod tunnel;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use hosts::{HostsEditor, HostsFile, DEFAULT_HOSTS_PATH};
use k8s::{ClusterClient, K8sClient};
use proxy::{ReverseProxy, RouteProxy};
use tunnel::{build_dns_name, pick_http_port, TunnelManager, TunnelManagerConfig, TunnelStatus};

/// Kubernetes service tunnel
///
/// Makes cluster services reachable from the local machine as
/// http://<service>.<namespace> without a VPN.
#[derive(Parser, Debug)]
#[command(name = "kube-service-tunnel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the kubeconfig (defaults to KUBECONFIG or ~/.kube/config)
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubernetes context to use. If not specified, uses current context.
    #[arg(short = 'c', long, global = true)]
    context: Option<String>,

    /// Hosts file holding the managed section
    #[arg(long, default_value = DEFAULT_HOSTS_PATH, global = true)]
    hosts_file: PathBuf,

    /// Port for the local reverse proxy
    #[arg(long, default_value = "80", global = true)]
    proxy_port: u16,

    /// First local port used for port-forwards
    #[arg(long, default_value = "40000", global = true)]
    port_base: u16,

    /// Port for the HTTP status API (0 to disable)
    #[arg(long, default_value = "0", global = true)]
    http: u16,

    /// Log level for kube-service-tunnel (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Log level for libraries (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    lib_log_level: String,

    /// Show source file and line number in log messages
    #[arg(long, default_value = "false", global = true)]
    log_source: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List kubeconfig contexts
    Contexts,

    /// List namespaces that have tunnelable services
    Namespaces,

    /// List tunnelable services in a namespace
    Services {
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },

    /// Register tunnels and serve them until interrupted
    Up {
        /// Register every eligible service in the context
        #[arg(long, conflicts_with = "services")]
        all: bool,

        /// Services to register, as NAMESPACE/SERVICE
        services: Vec<String>,
    },

    /// Remove the managed hosts section left behind by an earlier run
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging with separate levels for app and libraries
    let app_level = args.log_level.to_lowercase();
    let lib_level = args.lib_log_level.to_lowercase();

    let filter = EnvFilter::new(format!("{lib_level},kube_service_tunnel={app_level}"));

    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(args.log_source)
        .with_line_number(args.log_source)
        .compact()
        .init();

    if let Command::Clean = args.command {
        return clean(&args).await;
    }

    let cluster: Arc<dyn ClusterClient> = Arc::new(K8sClient::new(args.kubeconfig.as_deref())?);
    let hosts = Arc::new(HostsFile::new(&args.hosts_file));
    let config = TunnelManagerConfig {
        port_base: args.port_base,
        proxy_port: args.proxy_port,
        ..Default::default()
    };
    let manager = Arc::new(TunnelManager::new(
        cluster,
        Arc::new(ReverseProxy::new()) as Arc<dyn RouteProxy>,
        Arc::clone(&hosts) as Arc<dyn HostsEditor>,
        config,
    ));

    match &args.command {
        Command::Contexts => print_contexts(&manager).await,
        Command::Namespaces => {
            let context = resolve_context(&args, &manager).await?;
            for ns in manager.namespaces_with_services(&context).await? {
                println!("{}", ns);
            }
            Ok(())
        }
        Command::Services { namespace } => {
            let context = resolve_context(&args, &manager).await?;
            print_services(&manager, &context, namespace).await
        }
        Command::Up { all, services } => {
            if !*all && services.is_empty() {
                bail!("Specify --all or at least one NAMESPACE/SERVICE");
            }
            hosts
                .check_writable()
                .context("Hosts file pre-check failed")?;
            let context = resolve_context(&args, &manager).await?;
            up(&args, manager, &context, *all, services).await
        }
        Command::Clean => Ok(()),
    }
}

async fn resolve_context(args: &Args, manager: &TunnelManager) -> Result<String> {
    if let Some(context) = &args.context {
        return Ok(context.clone());
    }
    manager
        .current_context()
        .await?
        .context("No current context in kubeconfig; pass --context")
}

async fn clean(args: &Args) -> Result<()> {
    let hosts = HostsFile::new(&args.hosts_file);
    hosts
        .check_writable()
        .context("Hosts file pre-check failed")?;

    let entries = hosts.entries().await?;
    hosts.clear_all_entries().await?;
    info!(
        "Removed {} managed entries from {}",
        entries.len(),
        hosts.path().display()
    );
    for entry in entries {
        println!("{}", entry);
    }
    Ok(())
}

async fn print_contexts(manager: &TunnelManager) -> Result<()> {
    let current = manager.current_context().await?;
    println!("{:<2} {:<32} {:<32} NAMESPACE", "", "NAME", "CLUSTER");
    for ctx in manager.list_contexts().await? {
        let marker = if current.as_deref() == Some(ctx.name.as_str()) {
            "*"
        } else {
            ""
        };
        println!(
            "{:<2} {:<32} {:<32} {}",
            marker,
            ctx.name,
            ctx.cluster,
            ctx.namespace.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn print_services(manager: &TunnelManager, context: &str, namespace: &str) -> Result<()> {
    println!("{:<32} {:<16} {:<24} URL", "NAME", "CLUSTER-IP", "PORTS");
    for svc in manager.list_services(context, namespace).await? {
        let ports = svc
            .ports
            .iter()
            .map(|p| p.port.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let url = pick_http_port(&svc)
            .map(|p| format!("http://{}", build_dns_name(&svc.name, &svc.namespace, p.port)))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:<16} {:<24} {}",
            svc.name,
            svc.cluster_ip.as_deref().unwrap_or(""),
            ports,
            url
        );
    }
    Ok(())
}

fn print_tunnels(tunnels: &[TunnelStatus]) {
    println!(
        "{:<48} {:<40} {:<8} STATE",
        "URL", "POD", "LOCAL"
    );
    for status in tunnels {
        let t = &status.tunnel;
        println!(
            "{:<48} {:<40} {:<8} {}",
            format!("http://{}", t.dns_name),
            format!("{}/{}:{}", t.namespace, t.pod, t.remote_port),
            t.local_port,
            t.state
        );
    }
}

async fn up(
    args: &Args,
    manager: Arc<TunnelManager>,
    context: &str,
    all: bool,
    services: &[String],
) -> Result<()> {
    info!("Starting kube-service-tunnel in context {}", context);

    if all {
        if let Err(e) = manager.register_all_for_context(context).await {
            manager.cleanup().await.ok();
            return Err(e).context("Failed to register services");
        }
    } else {
        for target in services {
            let Some((namespace, service)) = target.split_once('/') else {
                error!("Invalid service '{}', expected NAMESPACE/SERVICE", target);
                continue;
            };
            if let Err(e) = manager.register_tunnel(context, namespace, service).await {
                error!("Failed to register {}: {}", target, e);
            }
        }
    }

    let tunnels = manager.tunnels();
    if tunnels.is_empty() {
        manager.cleanup().await.ok();
        bail!("No tunnels registered");
    }
    print_tunnels(&tunnels);

    let api_handle = (args.http > 0).then(|| {
        let manager = Arc::clone(&manager);
        let port = args.http;
        tokio::spawn(async move {
            if let Err(e) = api::start_server(port, manager).await {
                error!("API server error: {}", e);
            }
        })
    });

    if args.http > 0 {
        info!("API server available at:");
        info!(
            "  GET    http://localhost:{}/tunnels         - Registered tunnels",
            args.http
        );
        info!(
            "  DELETE http://localhost:{}/tunnels/<name>  - Remove a tunnel",
            args.http
        );
        info!(
            "  GET    http://localhost:{}/events          - Real-time updates (SSE)",
            args.http
        );
    }
    info!("Press Ctrl+C to stop.");

    let mut sig_int = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;
    let mut sig_term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;

    select! {
        _ = sig_int.recv() => info!("Received SIGINT (Ctrl+C)"),
        _ = sig_term.recv() => info!("Received SIGTERM"),
    }
    info!("Shutting down...");

    if let Some(handle) = api_handle {
        handle.abort();
    }

    if let Err(e) = manager.cleanup().await {
        warn!("Cleanup incomplete: {}", e);
        return Err(e.into());
    }

    info!("kube-service-tunnel stopped");
    Ok(())
}
