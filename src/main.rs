//! Ephemera - ephemeral browser sandboxes with HTTP API.
//!
//! Usage:
//!   ephemera serve [--listen 0.0.0.0:3000] [--auth-secret <secret>]
//!   ephemera status [--db-path containers.db]

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use ephemera::config::{Args, Commands, RuntimeKind, ServeArgs};
use ephemera::http_server;
use ephemera::ports::PortAllocator;
use ephemera::runtime::docker::DockerRuntime;
use ephemera::runtime::memory::InMemoryRuntime;
use ephemera::runtime::{with_timeout, ContainerRuntime};
use ephemera::state::AppState;
use ephemera::store::{RecordStore, SqliteRecordStore};
use ephemera::{ContainerState, LifecycleManager};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => serve(serve_args).await,
        Commands::Status { db_path } => status(&db_path),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let template = args.template()?;
    let config = args.lifecycle_config()?;
    let range = args.port_range()?;
    let auth = args.auth();

    let store = SqliteRecordStore::open(&args.db_path)
        .with_context(|| format!("opening store at {}", args.db_path.display()))?;

    let runtime: Arc<dyn ContainerRuntime> = match args.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntime::connect(
            args.docker_host.as_deref(),
            args.runtime_timeout_secs,
        )?),
        RuntimeKind::Memory => {
            warn!("Using in-memory runtime, containers are simulated");
            Arc::new(InMemoryRuntime::new())
        }
    };
    with_timeout("ping", config.runtime_timeout, runtime.ping())
        .await
        .context("container runtime unreachable")?;

    let allocator = PortAllocator::new(range, args.max_probe_attempts);
    let manager = LifecycleManager::new(Arc::new(store), runtime, allocator, template, config);
    manager
        .reconcile()
        .await
        .context("reconciling persisted containers")?;
    let sweeper = manager.spawn_sweeper();

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    http_server::run_server(
        listener,
        AppState::new(Arc::clone(&manager), auth),
        shutdown_signal(),
    )
    .await?;

    sweeper.abort();
    manager.shutdown();
    info!("Server stopped");
    Ok(())
}

fn status(db_path: &Path) -> anyhow::Result<()> {
    let store = SqliteRecordStore::open(db_path)
        .with_context(|| format!("opening store at {}", db_path.display()))?;
    let records = store.list_active()?;
    let now = Utc::now();

    if records.is_empty() {
        println!("No active containers");
        return Ok(());
    }
    for record in &records {
        let note = match record.state {
            ContainerState::Expiring if record.is_expired_at(now) => "  <- stuck, needs attention",
            ContainerState::Deleting => "  <- teardown in progress or interrupted",
            _ => "",
        };
        println!(
            "{:<16} {:<9} ports={:?} expires={}{}",
            &record.id[..record.id.len().min(16)],
            record.state,
            record.ports,
            record.expires_at.to_rfc3339(),
            note
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
