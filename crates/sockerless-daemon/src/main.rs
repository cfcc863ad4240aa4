use anyhow::{Context, Result};
use clap::Parser;
use sockerless_backend::{create_router, AppState, BackendDescriptor, BackendServer, ListenAddr};
use sockerless_core::process::ProcessFactory;
use sockerless_core::{recover, Config, ContainerFilter, JobJournal, Runtime, SystemProcessFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sockerless-backend")]
#[command(author, version, about, long_about = None)]
pub struct DaemonArgs {
    /// Configuration file (default: /etc/sockerless/backend.toml).
    #[arg(long, env = "SOCKERLESS_CONFIG")]
    pub config: Option<PathBuf>,

    /// TCP listen address, e.g. 127.0.0.1:9100.
    #[arg(long)]
    pub listen: Option<String>,

    /// Unix socket path. Takes precedence over --listen.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Instance id used to tag and recover managed jobs.
    #[arg(long)]
    pub instance_id: Option<String>,

    /// Run workloads as host processes instead of in the sandbox.
    #[arg(long)]
    pub synthetic: bool,

    /// Journal file used to restore containers across restarts.
    #[arg(long)]
    pub journal: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonArgs::parse();
    let config = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sockerless={}", config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(config).await
}

fn load_config(args: &DaemonArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };
    if let Some(listen) = &args.listen {
        config.listen_addr.clone_from(listen);
    }
    if let Some(socket) = &args.socket {
        config.socket_path = Some(socket.clone());
    }
    if let Some(instance_id) = &args.instance_id {
        config.instance_id = Some(instance_id.clone());
    }
    if args.synthetic {
        config.synthetic = true;
    }
    if let Some(journal) = &args.journal {
        config.journal_path = Some(journal.clone());
    }
    if let Some(cloud) = &config.cloud {
        cloud.validate().context("Invalid cloud configuration")?;
    }
    Ok(config)
}

fn build_factory(config: &Config) -> Option<Arc<dyn ProcessFactory>> {
    match config.process.driver.as_str() {
        "none" => {
            warn!("No process factory configured; start and exec are unavailable");
            None
        }
        driver => {
            if driver != "system" {
                warn!(driver, "Unknown process driver, using system");
            }
            if config.synthetic {
                info!("Synthetic mode: workloads run as host processes");
            } else {
                info!("Sandbox runtime unavailable, workloads run as host processes");
            }
            Some(Arc::new(SystemProcessFactory::new()))
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Starting sockerless backend...");

    let instance_id = config.resolved_instance_id();
    let factory = build_factory(&config);
    let runtime = Arc::new(Runtime::new(factory, config.lifecycle_config()));

    let journal = config.journal_path.clone().map(JobJournal::new);
    match (&journal, &config.cloud) {
        (Some(journal), _) => restore(journal, &runtime, &instance_id).await,
        (None, Some(cloud)) => warn!(
            provider = %cloud.provider,
            "No job inventory for cloud provider; skipping registry recovery"
        ),
        (None, None) => {}
    }

    let descriptor =
        BackendDescriptor::from_host(&config.descriptor, runtime.driver_name(), &instance_id);
    info!(
        instance_id = %instance_id,
        driver = %descriptor.driver,
        "Runtime initialized"
    );

    let addr = config
        .socket_path
        .clone()
        .map_or_else(|| ListenAddr::Tcp(config.listen_addr.clone()), ListenAddr::Unix);
    let app = create_router(AppState::new(Arc::clone(&runtime), descriptor));
    let server = BackendServer::new(addr, app);

    let shutdown = CancellationToken::new();
    let mut server_handle = tokio::spawn(server.run(shutdown.clone()));

    tokio::select! {
        () = shutdown_signal() => info!("Shutdown signal received"),
        result = &mut server_handle => {
            runtime.shutdown().await;
            persist(journal.as_ref(), &runtime, &instance_id);
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("Backend server failed"),
                Err(e) => Err(e).context("Backend server task failed"),
            };
        }
    }

    info!("Shutting down...");
    shutdown.cancel();
    let _ = server_handle.await;
    runtime.shutdown().await;
    persist(journal.as_ref(), &runtime, &instance_id);
    info!("Shutdown complete");
    Ok(())
}

async fn restore(journal: &JobJournal, runtime: &Runtime, instance_id: &str) {
    let report = recover(journal, runtime.containers(), instance_id).await;
    info!(
        path = %journal.path().display(),
        recovered = report.recovered.len(),
        skipped = report.skipped.len(),
        "Registry restored from journal"
    );
}

fn persist(journal: Option<&JobJournal>, runtime: &Runtime, instance_id: &str) {
    let Some(journal) = journal else {
        return;
    };
    let containers = runtime
        .containers()
        .list(&ContainerFilter::default(), true, None);
    match journal.save(instance_id, &containers) {
        Ok(()) => info!(containers = containers.len(), "Journal saved"),
        Err(e) => warn!(path = %journal.path().display(), error = %e, "Failed to save journal"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
