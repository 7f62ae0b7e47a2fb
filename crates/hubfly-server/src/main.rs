use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hubfly_model::{Protocol, SiteSpec, StreamSpec};
use hubfly_server::{
    render, CertbotClient, ControlPlane, JobRecord, JobState, NginxEngine, Reconciler,
    ServerConfig,
};

/// Hubfly control plane - manages proxied sites, streams and certificates
#[derive(Parser, Debug)]
#[command(name = "hubfly")]
#[command(about = "Reverse-proxy appliance control plane")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "hubfly.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage HTTP sites
    Site {
        #[command(subcommand)]
        command: SiteCommand,
    },

    /// Manage Layer-4 streams
    Stream {
        #[command(subcommand)]
        command: StreamCommand,
    },

    /// Repair drift between records and live configuration
    Reconcile {
        /// Keep running on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
    },

    /// Print configuration as it would be applied, without applying it
    Render {
        #[command(subcommand)]
        target: RenderTarget,
    },
}

#[derive(Subcommand, Debug)]
enum SiteCommand {
    /// Create a site from a JSON file or from flags
    Create {
        /// JSON site definition; flags are ignored when given
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        domain: Option<String>,

        /// Upstream address (repeatable; only the first is proxied to)
        #[arg(long = "upstream")]
        upstreams: Vec<String>,

        /// Request a certificate and serve HTTPS
        #[arg(long)]
        ssl: bool,

        /// Redirect HTTP to HTTPS once the certificate is in place
        #[arg(long)]
        force_ssl: bool,

        /// Template name (repeatable)
        #[arg(long = "template")]
        templates: Vec<String>,
    },

    /// Replace a site's definition
    Update {
        id: String,
        #[arg(long)]
        file: PathBuf,
    },

    Get {
        id: String,
    },

    List,

    /// Remove a site and its configuration
    Delete {
        id: String,
        /// Revoke the certificate before deleting
        #[arg(long)]
        revoke_cert: bool,
    },

    /// Re-run provisioning for a site
    Retry {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum StreamCommand {
    /// Create a stream from a JSON file or from flags
    Create {
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long)]
        id: Option<String>,

        /// Upstream host:port
        #[arg(long)]
        upstream: Option<String>,

        /// Listen port (assigned from the configured range if omitted)
        #[arg(long)]
        port: Option<u16>,

        /// tcp or udp
        #[arg(long, default_value = "tcp")]
        protocol: String,

        /// TLS server name to route on
        #[arg(long)]
        domain: Option<String>,
    },

    Update {
        id: String,
        #[arg(long)]
        file: PathBuf,
    },

    Get {
        id: String,
    },

    List,

    Delete {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum RenderTarget {
    /// Render a stored site
    Site { id: String },

    /// Render the listener for a stream port
    Port { port: u16 },
}

/// Record plus the jobs that settled it
#[derive(Serialize)]
struct Outcome<T: Serialize> {
    record: T,
    jobs: Vec<JobRecord>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hubfly_server=info".parse()?)
                .add_directive("hubfly_common=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::debug!("Using config: {}", cli.config);

    let config = ServerConfig::load_and_resolve(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;

    let engine = Arc::new(NginxEngine::from_config(&config));
    let ca = Arc::new(CertbotClient::from_config(&config));
    let control = ControlPlane::from_config(&config, engine, ca)
        .context("Failed to initialize control plane")?;

    match cli.command {
        Commands::Site { command } => run_site(&control, command).await,
        Commands::Stream { command } => run_stream(&control, command).await,
        Commands::Reconcile { watch } => {
            let reconciler = Reconciler::new(control.provisioner().clone());
            if watch {
                let cancel = CancellationToken::new();
                let stop = cancel.clone();
                tokio::spawn(async move {
                    shutdown_signal().await;
                    stop.cancel();
                });
                reconciler.run(config.reconcile_interval, cancel).await;
                tracing::info!("Shutdown complete");
                Ok(())
            } else {
                let report = reconciler.run_once().await.context("Reconcile failed")?;
                print_json(&report)
            }
        }
        Commands::Render { target } => match target {
            RenderTarget::Site { id } => {
                let text = control
                    .render_site(&id)
                    .with_context(|| format!("Failed to render site {}", id))?;
                print!("{}", text);
                Ok(())
            }
            RenderTarget::Port { port } => {
                let streams = control
                    .provisioner()
                    .store()
                    .streams_on_port(port)
                    .context("Failed to read streams")?;
                match render::render_port(port, &streams)? {
                    Some(text) => print!("{}", text),
                    None => eprintln!("No streams on port {}", port),
                }
                Ok(())
            }
        },
    }
}

async fn run_site(control: &Arc<ControlPlane>, command: SiteCommand) -> Result<()> {
    match command {
        SiteCommand::Create {
            file,
            id,
            domain,
            upstreams,
            ssl,
            force_ssl,
            templates,
        } => {
            let spec = match file {
                Some(path) => read_json(&path)?,
                None => SiteSpec {
                    id,
                    domain: domain.context("--domain is required without --file")?,
                    upstreams,
                    ssl,
                    force_ssl,
                    templates,
                    ..Default::default()
                },
            };
            let accepted = control.create_site(spec)?;
            let id = accepted.record.id.clone();
            let (_, jobs) = accepted.settle().await;
            report(control.get_site(&id)?, jobs)
        }
        SiteCommand::Update { id, file } => {
            let spec: SiteSpec = read_json(&file)?;
            let (_, jobs) = control.update_site(&id, spec)?.settle().await;
            report(control.get_site(&id)?, jobs)
        }
        SiteCommand::Get { id } => print_json(&control.get_site(&id)?),
        SiteCommand::List => print_json(&control.list_sites()?),
        SiteCommand::Delete { id, revoke_cert } => {
            let site = control.delete_site(&id, revoke_cert).await?;
            tracing::info!("Deleted site {}", site.id);
            print_json(&site)
        }
        SiteCommand::Retry { id } => {
            let (_, jobs) = control.retry_site(&id)?.settle().await;
            report(control.get_site(&id)?, jobs)
        }
    }
}

async fn run_stream(control: &Arc<ControlPlane>, command: StreamCommand) -> Result<()> {
    match command {
        StreamCommand::Create {
            file,
            id,
            upstream,
            port,
            protocol,
            domain,
        } => {
            let spec = match file {
                Some(path) => read_json(&path)?,
                None => StreamSpec {
                    id,
                    listen_port: port,
                    upstream: upstream.context("--upstream is required without --file")?,
                    protocol: parse_protocol(&protocol)?,
                    domain,
                },
            };
            let accepted = control.create_stream(spec)?;
            let id = accepted.record.id.clone();
            let (_, jobs) = accepted.settle().await;
            report(control.get_stream(&id)?, jobs)
        }
        StreamCommand::Update { id, file } => {
            let spec: StreamSpec = read_json(&file)?;
            let (_, jobs) = control.update_stream(&id, spec)?.settle().await;
            report(control.get_stream(&id)?, jobs)
        }
        StreamCommand::Get { id } => print_json(&control.get_stream(&id)?),
        StreamCommand::List => print_json(&control.list_streams()?),
        StreamCommand::Delete { id } => {
            let (stream, jobs) = control.delete_stream(&id)?.settle().await;
            report(stream, jobs)
        }
    }
}

fn parse_protocol(value: &str) -> Result<Protocol> {
    match value {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        _ => anyhow::bail!("Invalid protocol: {}. Use 'tcp' or 'udp'", value),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn report<T: Serialize>(record: T, jobs: Vec<JobRecord>) -> Result<()> {
    let failed = jobs.iter().find(|job| job.state == JobState::Failed).cloned();
    print_json(&Outcome { record, jobs })?;
    if let Some(job) = failed {
        anyhow::bail!(
            "Job {} for {} failed: {}",
            job.id,
            job.resource,
            job.message.unwrap_or_default()
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
