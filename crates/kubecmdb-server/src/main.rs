//! kubecmdb Server - Kubernetes to CMDB synchronizer

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use kameo::prelude::*;
use kubecmdb_server::api;
use kubecmdb_server::cache::ClusterCache;
use kubecmdb_server::clients::{
    ClusterRegistry, ClusterStateSource, CmdbStore, GatewayClusterState, HttpClusterRegistry, HttpCmdbClient,
};
use kubecmdb_server::config::Config;
use kubecmdb_server::directory::replicas::resolve_ordinal;
use kubecmdb_server::directory::{DirectoryResolver, ReplicaSource, ShardCoordinator};
use kubecmdb_server::dispatch::{DispatchPolicy, EventDispatcher};
use kubecmdb_server::engine::ReconciliationEngine;
use kubecmdb_server::observability::{
    init_metrics, init_tracing, shutdown_tracing, RestartPolicy, TracingConfig,
};
use kubecmdb_server::supervisor::WorkerSupervisor;
use kubecmdb_server::synchronizer::{EventWorker, FullSyncWorker, Synchronizer, EVENT_POOL, FULL_SYNC_POOL};
use kubecmdb_server::topology::{AmqpBroker, ChannelTopology};
use kubecmdb_server::version;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "kubecmdb-server")]
#[command(about = "Keeps CMDB in sync with the live state of Kubernetes clusters")]
#[command(version = version::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the synchronizer (default)
    Run(RunArgs),
    /// Print build information
    Version,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// YAML configuration file
    #[arg(long, env = "KUBECMDB_CONFIG")]
    config: Option<PathBuf>,

    /// Address for the probe and metrics server
    #[arg(long, env = "BIND_ADDR")]
    bind_addr: Option<String>,

    /// This replica's ordinal; derived from HOSTNAME when unset
    #[arg(long)]
    ordinal: Option<usize>,

    /// Static replica count
    #[arg(long)]
    replicas: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Version) => {
            println!("{}", version::build_info());
            Ok(())
        }
        Some(Commands::Run(args)) => run(args).await,
        None => run(cli.run).await,
    }
}

fn load_config(args: &RunArgs) -> anyhow::Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(bind_addr) = &args.bind_addr {
        config.http.bind_addr = bind_addr.clone();
    }
    if let Some(ordinal) = args.ordinal {
        config.replicas.ordinal = Some(ordinal);
    }
    if let Some(replicas) = args.replicas {
        config.replicas.count = replicas;
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(TracingConfig::from_env())?;
    info!(version = %version::full_version(), "Starting kubecmdb-server");

    let config = load_config(&args)?;
    let ordinal = resolve_ordinal(&config.replicas)?;
    info!(
        ordinal,
        source_exchange = %config.broker.source_exchange,
        bind_addr = %config.http.bind_addr,
        "Configuration loaded"
    );

    let metrics_state = match init_metrics() {
        Ok(state) => Some(Arc::new(state)),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
            None
        }
    };

    let registry: Arc<dyn ClusterRegistry> = Arc::new(HttpClusterRegistry::new(&config.registry)?);
    let store = CmdbStore::new(Arc::new(HttpCmdbClient::new(&config.cmdb)?), config.cmdb.page_size);
    let state: Arc<dyn ClusterStateSource> = Arc::new(GatewayClusterState::new(config.gateway.clone()));
    let replicas = ReplicaSource::from_config(&config.replicas)
        .await
        .context("replica count source")?;

    let broker = Arc::new(AmqpBroker::new(&config.broker));
    broker.connect().await.context("broker connection")?;
    let topology = ChannelTopology::new(broker, config.broker.headers_exchange());
    topology.ensure_exchange().await?;

    let engine = ReconciliationEngine::new(store.clone(), state);
    let clusters = Arc::new(ClusterCache::new(
        registry.clone(),
        store,
        config.sync.cluster_cache_ttl(),
    ));
    let dispatcher = Arc::new(EventDispatcher::new(
        engine.clone(),
        clusters.clone(),
        topology.clone(),
        DispatchPolicy::from(&config.sync),
    ));

    let synchronizer = Arc::new(Synchronizer::new(
        DirectoryResolver::new(registry, &config.sync.allow_list, &config.sync.deny_list),
        replicas,
        ShardCoordinator::spawn(ShardCoordinator::new(ordinal)),
        clusters.clone(),
        WorkerSupervisor::new(
            EVENT_POOL,
            EventWorker::new(topology.clone(), dispatcher),
            RestartPolicy::default(),
            config.sync.worker_grace(),
        ),
        WorkerSupervisor::new(
            FULL_SYNC_POOL,
            FullSyncWorker::new(engine, clusters),
            RestartPolicy::never(),
            config.sync.worker_grace(),
        ),
        config.sync.full_sync_interval(),
    ));

    let cancel = CancellationToken::new();

    let app = api::create_router(api::AppState::new(synchronizer.clone(), metrics_state));
    let listener = tokio::net::TcpListener::bind(&config.http.bind_addr).await?;
    info!(bind_addr = %config.http.bind_addr, "Starting API server");
    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        })
    };

    let sync_loop = {
        let synchronizer = synchronizer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { synchronizer.run(cancel).await })
    };

    shutdown_signal().await;
    info!("Shutdown signal received");
    cancel.cancel();

    if let Err(e) = sync_loop.await {
        warn!(error = %e, "Synchronizer loop ended abnormally");
    }
    synchronizer.shutdown().await;
    if let Err(e) = topology.close().await {
        warn!(error = %e, "Broker close failed");
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "API server error"),
        Err(e) => warn!(error = %e, "API server task failed"),
    }

    info!("kubecmdb-server stopped");
    shutdown_tracing();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
