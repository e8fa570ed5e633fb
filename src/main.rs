use std::{process, sync::Arc};

use quire::{
    application::{
        articles::ArticleService,
        error::AppError,
        repos::{MemoryRepository, Repository},
    },
    cache::{CacheBackend, CacheConfig, CacheState, MemoryStore, RedisStore, ResponseStore},
    config::{self, Settings, StoreBackend},
    domain::articles::Article,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
    invalidation::{
        BusConnection, InvalidationConsumer, InvalidationPublisher, SignalBus,
        register_signal_hooks,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Subscribe(_) => run_subscribe(settings).await,
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let bus = Arc::new(BusConnection::from_settings(&settings.bus));
    let publisher = Arc::new(InvalidationPublisher::new(Arc::clone(&bus)));
    if bus.is_enabled()
        && let Err(err) = publisher.connect().await
    {
        warn!(
            target = "quire::bus",
            error = %err,
            "broker unreachable at startup; invalidations will retry on send"
        );
    }

    let signals = Arc::new(SignalBus::new());
    register_signal_hooks(
        &signals,
        Arc::clone(&publisher),
        settings.bus.invalidate_before_commit,
    );

    let repo: Arc<dyn Repository<Article>> = Arc::new(MemoryRepository::new(signals));
    let articles = Arc::new(ArticleService::new(repo));

    let cache_config = CacheConfig::from(&settings);
    let backend = open_backend(&settings).await?;
    let consumer_handle = spawn_in_process_consumer(&settings, &bus, &backend, &shutdown_rx);

    let cache = cache_config.enabled.then(|| {
        CacheState::new(cache_config, backend).with_publisher(Arc::clone(&publisher))
    });

    let registrations = cache.clone();
    let state = HttpState {
        articles,
        bus: Arc::clone(&bus),
        cache,
    };
    let result = serve_http(&settings, state, shutdown_rx).await;

    if let Some(cache) = registrations {
        let grace = settings.server.graceful_shutdown;
        if tokio::time::timeout(grace, cache.flush_registrations())
            .await
            .is_err()
        {
            warn!(
                target = "quire::serve",
                "pending dependency registrations dropped at shutdown"
            );
        }
    }
    if let Some(handle) = consumer_handle {
        let _ = handle.await;
    }
    publisher.disconnect().await;
    info!(target = "quire::serve", "shutdown complete");

    result
}

async fn run_subscribe(settings: Settings) -> Result<(), AppError> {
    let bus = BusConnection::from_settings(&settings.bus);
    let Some(connector) = bus.connector().cloned() else {
        return Err(AppError::from(InfraError::configuration(
            "subscribe requires bus.host to be configured",
        )));
    };
    if settings.store.backend == StoreBackend::Memory {
        warn!(
            target = "quire::subscribe",
            "evicting from a process-local store; only this process's cache is affected"
        );
    }

    let backend = open_backend(&settings).await?;
    let consumer = Arc::new(
        InvalidationConsumer::new(backend).with_retention(settings.bus.registration_retention),
    );

    info!(
        target = "quire::subscribe",
        broker = %connector.describe(),
        topic = bus.topic(),
        "starting invalidation subscriber"
    );
    consumer
        .run(connector, bus.topic().to_string(), wait_for_signal())
        .await;
    Ok(())
}

async fn open_backend(settings: &Settings) -> Result<CacheBackend, AppError> {
    let store: Arc<dyn ResponseStore> = match settings.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(settings.store.memory_capacity)),
        StoreBackend::Redis => {
            let url = settings.store.redis_url.as_deref().ok_or_else(|| {
                AppError::from(InfraError::configuration("store.redis_url is not configured"))
            })?;
            let store =
                RedisStore::open(url).map_err(|err| AppError::from(InfraError::from(err)))?;
            match tokio::time::timeout(settings.store.timeout, store.warm_up()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    target = "quire::serve",
                    error = %err,
                    "redis unavailable at startup; serving uncached until it answers"
                ),
                Err(_) => warn!(
                    target = "quire::serve",
                    timeout_ms = settings.store.timeout.as_millis() as u64,
                    "redis did not answer at startup; serving uncached until it does"
                ),
            }
            Arc::new(store)
        }
    };
    Ok(CacheBackend::new(store, settings.store.timeout))
}

/// Evict from the local store on every broadcast when this process owns it.
fn spawn_in_process_consumer(
    settings: &Settings,
    bus: &BusConnection,
    backend: &CacheBackend,
    shutdown: &watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    if !settings.bus.subscribe_in_process || settings.store.backend != StoreBackend::Memory {
        return None;
    }
    let connector = bus.connector().cloned()?;

    let consumer = Arc::new(
        InvalidationConsumer::new(backend.clone())
            .with_retention(settings.bus.registration_retention),
    );
    let topic = bus.topic().to_string();
    let shutdown = wait_for_shutdown(shutdown.clone());
    Some(tokio::spawn(consumer.run(connector, topic, shutdown)))
}

async fn serve_http(
    settings: &Settings,
    state: HttpState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(target = "quire::serve", addr = %settings.server.addr, "listening");

    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()));

    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        wait_for_shutdown(shutdown).await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = deadline => {
            warn!(
                target = "quire::serve",
                grace_secs = grace.as_secs(),
                "graceful shutdown timed out; dropping open connections"
            );
        }
    }

    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
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
    info!(target = "quire::serve", "shutdown signal received");
}
