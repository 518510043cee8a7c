use std::io;
use std::path::PathBuf;

use clap::Parser;
use log::{error, info, warn};
use tokio::sync::watch;

use document_service::config::{AppConfig, ConfigOverrides, WORKER_CONFIG_ENV};
use document_service::logging::{init_bootstrap_logging, init_logging, LogRole};
use document_service::server::run_worker;
use document_service::supervisor::{Coordinator, ProcessLauncher, SupervisorSettings};

/// Clustered HTTP document gateway
#[derive(Parser, Debug)]
#[command(name = "document-service", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(long, env = "DOCSVC_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Run one worker process per CPU under a coordinator
    #[arg(long, conflicts_with = "no_cluster")]
    cluster: bool,

    /// Run a single worker in the foreground
    #[arg(long)]
    no_cluster: bool,

    /// Remote configuration host
    #[arg(long, env = "DOCSVC_ETCD_HOST")]
    etcd_host: Option<String>,

    /// Remote configuration port
    #[arg(long, env = "DOCSVC_ETCD_PORT")]
    etcd_port: Option<u16>,

    /// Set by the coordinator on the processes it forks
    #[arg(long, hide = true)]
    worker_index: Option<usize>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        let cluster = match (self.cluster, self.no_cluster) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        ConfigOverrides {
            port: self.port,
            cluster,
            ..Default::default()
        }
    }
}

fn config_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

async fn resolve_config(cli: &Cli) -> io::Result<AppConfig> {
    let mut config = AppConfig::load(&cli.config).map_err(config_error)?;
    config.set_remote_endpoint(cli.etcd_host.clone(), cli.etcd_port);
    Ok(config.resolve(cli.overrides()).await)
}

fn log_startup(role: LogRole) {
    info!(
        "Starting {} v{} as {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        role
    );
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run_coordinator(config: AppConfig) -> io::Result<()> {
    let worker_config = config.to_yaml().map_err(config_error)?;
    let launcher = ProcessLauncher::current_exe()?.env(WORKER_CONFIG_ENV, worker_config);
    let settings = SupervisorSettings::from_server(&config.server, config.worker_count());
    let coordinator = Coordinator::new(launcher, settings);

    let (stop, stopped) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        let _ = stop.send(true);
    });

    let report = coordinator.run(stopped).await?;
    info!(
        "Coordinator stopped: {} workers launched, {} exited, {} respawned",
        report.launched, report.exited, report.respawned
    );
    Ok(())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let cli = Cli::parse();
    let bootstrap = init_bootstrap_logging();

    if let Some(index) = cli.worker_index {
        let config = match AppConfig::from_worker_env().map_err(config_error)? {
            Some(config) => config,
            None => resolve_config(&cli).await?,
        };
        init_logging(&config.logs, LogRole::Worker(index), bootstrap);
        log_startup(LogRole::Worker(index));
        return run_worker(config, index).await;
    }

    let config = resolve_config(&cli).await?;
    if config.server.cluster {
        init_logging(&config.logs, LogRole::Coordinator, bootstrap);
        log_startup(LogRole::Coordinator);
        run_coordinator(config).await
    } else {
        init_logging(&config.logs, LogRole::Single, bootstrap);
        log_startup(LogRole::Single);
        run_worker(config, 1).await
    }
}
