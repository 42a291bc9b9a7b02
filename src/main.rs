use {
    clap::{Parser, Subcommand},
    royalty_sync::{
        AppState,
        adapters::{
            circuit_breaker::ProviderBreakers,
            registry::{AdapterFactory, HttpAdapterFactory},
            webhook,
        },
        config::{AppConfig, ConfigError},
        domain::error::ChargeError,
        infra::{postgres::PgStore, store::Store},
        services::{
            notifier::TracingListener,
            reconciliation::ReconciliationEngine,
            sweep::{Sweeper, run_sweeper},
        },
    },
    sqlx::postgres::PgPoolOptions,
    std::{process::ExitCode, sync::Arc, time::Duration},
    thiserror::Error,
    tokio::{signal, sync::watch},
};

#[derive(Parser)]
#[command(name = "royalty-sync")]
#[command(about = "Royalty charge issuing and payment reconciliation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Default)]
enum Command {
    /// Webhook server with the sweep loop running in-process
    #[default]
    Serve,
    /// Run a single reconciliation sweep and exit
    Sweep,
}

#[derive(Debug, Error)]
enum FatalError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Charge(#[from] ChargeError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("no active gateway credentials configured")]
    NoCredentials,
}

struct Runtime {
    config: AppConfig,
    engine: Arc<ReconciliationEngine>,
    adapters: Arc<dyn AdapterFactory>,
    sweeper: Arc<Sweeper>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let result = match cli.command.unwrap_or_default() {
        Command::Serve => serve().await,
        Command::Sweep => sweep().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn bootstrap() -> Result<Runtime, FatalError> {
    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(3))
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let engine = Arc::new(ReconciliationEngine::new(
        store,
        Arc::new(TracingListener),
        config.reconciliation_settings(),
    ));
    let adapters: Arc<dyn AdapterFactory> =
        Arc::new(HttpAdapterFactory::new(config.adapter_settings()));
    let sweeper = Arc::new(Sweeper::new(
        Arc::clone(&engine),
        Arc::clone(&adapters),
        ProviderBreakers::new(config.breaker_config()),
        config.sweep_settings(),
    ));

    Ok(Runtime {
        config,
        engine,
        adapters,
        sweeper,
    })
}

async fn serve() -> Result<(), FatalError> {
    let Runtime {
        config,
        engine,
        adapters,
        sweeper,
    } = bootstrap().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_loop = tokio::spawn(run_sweeper(sweeper, config.sweep_interval, shutdown_rx));

    let state = AppState {
        engine,
        adapters,
        webhook_secrets: Arc::new(config.webhook_secrets.clone()),
    };
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, secrets = ?config.webhook_secrets, "listening");

    axum::serve(listener, webhook::router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Err(e) = sweep_loop.await {
        tracing::error!(error = %e, "sweep loop panicked");
    }
    Ok(())
}

async fn sweep() -> Result<(), FatalError> {
    let Runtime {
        engine, sweeper, ..
    } = bootstrap().await?;

    if engine.store().active_credential_count().await? == 0 {
        return Err(FatalError::NoCredentials);
    }
    let report = sweeper.sweep_once().await?;
    tracing::info!(?report, "sweep complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl+c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
