use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use log::{error, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api;
use crate::entity::Entity;
use crate::error::CutoverError;
use crate::events::{FixerConsumer, Subscription};
use crate::scheduler::Scheduler;

/// Serves the control routes for one migrated table and runs its fixer
/// consumer alongside.
pub struct WebServer<T: Entity> {
    host: String,
    port: u16,
    prefix: String,
    scheduler: Arc<Scheduler<T>>,
}

impl<T: Entity> WebServer<T> {
    pub fn new(host: String, port: u16, prefix: String, scheduler: Arc<Scheduler<T>>) -> Self {
        Self {
            host,
            port,
            prefix,
            scheduler,
        }
    }

    pub async fn start(
        &self,
        consumer: FixerConsumer<T>,
        subscription: Subscription,
    ) -> Result<(), CutoverError> {
        let app = self.create_router();

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| CutoverError::Error(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CutoverError::Error(format!("Failed to bind to {}: {}", addr, e)))?;

        println!("Cutover control server listening on http://{}{}", addr, self.prefix);

        // Fixer consumer runs until shutdown
        let consumer_cancel = CancellationToken::new();
        let consumer_handle = tokio::spawn({
            let cancel = consumer_cancel.clone();
            let mut subscription = subscription;
            async move { consumer.consume(&mut subscription, cancel).await }
        });

        info!("Server ready to handle requests");

        let scheduler = Arc::clone(&self.scheduler);
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                info!("Shutdown signal received, stopping validations...");
                println!("\nShutdown signal received - stopping server gracefully...");

                scheduler.shutdown().await;
                info!("Server shutdown complete");
            })
            .await
            .map_err(|e| CutoverError::Error(format!("Server error: {}", e)));

        // Let in-flight fixes land before the process exits
        consumer_cancel.cancel();
        match tokio::time::timeout(Duration::from_secs(5), consumer_handle).await {
            Ok(Ok(stats)) => info!("Fixer consumer stopped: {:?}", stats),
            Ok(Err(e)) => error!("Fixer consumer ended abnormally: {}", e),
            Err(_) => error!("Fixer consumer did not stop within 5s"),
        }

        println!("   Server stopped");
        served
    }

    fn create_router(&self) -> Router {
        api::create_router(Arc::clone(&self.scheduler), &self.prefix)
            .route("/health", get(health_check))
    }
}

async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Waits for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
