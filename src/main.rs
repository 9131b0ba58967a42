use std::{net::SocketAddr, sync::Arc};

use dotenvy::dotenv;
use ifr_clearance::{
    app::{self, AppState},
    config::Config,
    datastore::Datastore,
    logging::{CaptureLayer, LevelControl, LogBuffer},
    login_store::LoginStore,
    poller::HttpUpstream,
};
use tokio::{
    net::TcpListener,
    signal::{self, ctrl_c},
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // RUST_LOG pins the filter; otherwise the stored logLevel setting takes
    // over once settings are loaded.
    let pinned = std::env::var("RUST_LOG").is_ok();
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let (filter, filter_handle) = reload::Layer::new(
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&default_level))
            .unwrap_or_else(|_| EnvFilter::new("info")),
    );
    let logs = Arc::new(LogBuffer::default());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(CaptureLayer::new(logs.clone()))
        .init();
    let log_level = if pinned {
        LevelControl::default()
    } else {
        LevelControl::new(filter_handle)
    };

    let config = Config::from_env()?;

    let datastore = match &config.database_url {
        Some(url) => match connect(url, config.database_max_connections).await {
            Ok(store) => Some(store),
            Err(error) => {
                warn!(%error, "Datastore unavailable, continuing in memory only");
                None
            }
        },
        None => {
            info!("DATABASE_URL not set, running in memory only");
            None
        }
    };

    let upstream = Arc::new(HttpUpstream::new(&config)?);
    let login_store = LoginStore::new(datastore.as_ref().map(|store| store.connection().clone()));
    let addr = SocketAddr::new(config.bind_addr, config.port);

    let state = AppState::build(config, datastore, upstream)
        .await
        .with_logging(logs, log_level);
    let level = state.settings.system().log_level;
    match state.log_level.apply(&level) {
        Ok(true) => info!(%level, "Applied stored log level"),
        Ok(false) => {}
        Err(error) => warn!(%error, "Stored log level rejected"),
    }
    let background = state.start_background(&login_store);
    let cache = state.cache.clone();

    let app = app::router(state, login_store);
    let listener = TcpListener::bind(addr).await?;
    info!("Server running on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    cache.stop();
    for task in background {
        task.abort();
    }
    info!("Server shut down");

    Ok(())
}

async fn connect(url: &str, max_connections: u32) -> Result<Datastore, Box<dyn std::error::Error>> {
    let store = Datastore::connect(url, max_connections).await?;
    store.migrate().await?;
    info!("Connected to datastore");
    Ok(store)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = ctrl_c().await {
            warn!(%error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(error) => {
                warn!(%error, "Failed to install terminate handler");
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
}
