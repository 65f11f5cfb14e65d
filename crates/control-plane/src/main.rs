//! pg-dd Control Plane Server
//!
//! Dispatches database dump workers and waits for their callbacks.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pg_dd_control_plane::{
    build_router,
    config::{load_contract, AppConfig, ArchiveKind, DatabaseConfig, LauncherKind},
    db::{create_pool, PgRunArchive},
    dispatch::{ComputeLauncher, KubernetesLauncher, KubernetesSettings, ProcessLauncher},
    engine::{Coordinator, MemoryArchive, RunArchive, RunEventPublisher, Sinks},
    nats::NatsPublisher,
    state::AppState,
    ResultExt,
};

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,pg_dd_control_plane=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Build the compute launcher selected by `PG_DD_LAUNCHER`.
async fn build_launcher(config: &AppConfig) -> anyhow::Result<Arc<dyn ComputeLauncher>> {
    match config.launcher {
        LauncherKind::Kubernetes => {
            let settings = KubernetesSettings::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load Kubernetes settings, using defaults");
                KubernetesSettings::default()
            });
            tracing::info!(
                namespace = %settings.namespace,
                image = %settings.image,
                "Using Kubernetes launcher"
            );
            Ok(Arc::new(KubernetesLauncher::connect(settings).await?))
        }
        LauncherKind::Process => {
            tracing::info!(program = %config.worker_program, "Using process launcher");
            Ok(Arc::new(ProcessLauncher::new(&config.worker_program)))
        }
    }
}

/// Build the run archive selected by `PG_DD_ARCHIVE`.
async fn build_archive(config: &AppConfig) -> anyhow::Result<Arc<dyn RunArchive>> {
    match config.archive {
        ArchiveKind::Memory => Ok(Arc::new(MemoryArchive::new())),
        ArchiveKind::Postgres => {
            let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load database config, using defaults");
                DatabaseConfig::default()
            });
            let pool = create_pool(&db_config).await?;
            Ok(Arc::new(PgRunArchive::connect(pool).await?))
        }
    }
}

/// Connect the run event publisher if NATS is configured.
async fn connect_nats(config: &AppConfig) -> Option<Arc<dyn RunEventPublisher>> {
    let Some(ref nats_url) = config.nats_url else {
        tracing::info!("NATS not configured, run notifications disabled");
        return None;
    };

    let publisher = NatsPublisher::connect(
        nats_url,
        config.nats_subject.as_deref(),
        config.nats_stream.as_deref(),
        &config.server_name,
    )
    .await
    .log_warn("connecting to NATS, continuing without it")
    .ok()?;

    Some(Arc::new(publisher))
}

/// Periodically drop settled runs from memory.
fn spawn_sweeper(coordinator: Coordinator, config: &AppConfig) {
    let every = config.sweep_interval();
    let retention = config.terminal_retention();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            coordinator.prune_terminal(retention).await;
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Failed to load app config ({e}), using defaults");
        AppConfig::default()
    });

    init_tracing(app_config.log_json);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting pg-dd Control Plane"
    );
    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        launcher = ?app_config.launcher,
        archive = ?app_config.archive,
        callback_timeout_secs = app_config.callback_timeout_secs,
        "Configuration loaded"
    );

    let default_contract = match &app_config.contract_file {
        Some(path) => {
            let contract = load_contract(path).log("loading default worker contract")?;
            tracing::info!(
                path = %path.display(),
                databases = contract.databases.len(),
                "Default worker contract loaded"
            );
            Some(contract)
        }
        None => None,
    };

    let launcher = build_launcher(&app_config).await?;
    let archive = build_archive(&app_config).await?;
    let publisher = connect_nats(&app_config).await;
    let nats_enabled = publisher.is_some();

    let coordinator = Coordinator::new(
        launcher,
        app_config.dispatch_settings(),
        Sinks {
            archive: Some(archive),
            publisher,
        },
    );
    spawn_sweeper(coordinator.clone(), &app_config);

    let mut state = AppState::new(coordinator, app_config.clone()).with_nats(nats_enabled);
    if let Some(contract) = default_contract {
        state = state.with_default_contract(contract);
    }

    let app = build_router(state);

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
