//! Broker server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::broker::{Broker, BrokerSettings, handler::broker_routes};
use crate::config::{Config, StorageBackend};
use crate::storage::{FileStorage, MemoryStorage, Storage};
use crate::{Error, Result};

/// Broker HTTP server
pub struct Server {
    /// Configuration
    config: Config,
    /// The broker behind the routes
    broker: Arc<Broker>,
}

impl Server {
    /// Create a server, opening the configured storage engine
    pub fn new(config: Config) -> Result<Self> {
        let storage = open_storage(&config)?;
        let broker = Arc::new(Broker::new(storage, BrokerSettings::from(&config)));
        Ok(Self { config, broker })
    }

    /// The broker this server fronts
    #[must_use]
    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    /// Router with the standard middleware stack
    #[must_use]
    pub fn router(&self) -> Router {
        broker_routes(
            Arc::clone(&self.broker),
            self.config.server.resolve_scheduler_token(),
        )
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            self.config.server.request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until ctrl-c or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            storage = ?self.config.storage.backend,
            revoke_failure = ?self.config.lease.revoke_failure,
            "Broker ready"
        );
        if self.config.server.scheduler_token.is_none() {
            warn!("No scheduler token configured - lease callbacks are open to all callers");
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}

/// Open the storage engine named in the configuration
pub fn open_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage - configuration and roles are lost on restart");
            Ok(Arc::new(MemoryStorage::new()))
        }
        StorageBackend::File => {
            let path = config.storage.resolve_path()?;
            info!(path = %path.display(), "Using file storage");
            Ok(Arc::new(FileStorage::new(path)?))
        }
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
