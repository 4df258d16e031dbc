use std::sync::Arc;

use studyhall_core::ProvisioningController;
use studyhall_core::store::{SqliteStore, StoreError};
use studyhall_server::{
    config::Config,
    handlers::{StatusState, status_routes},
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing; `log` records from studyhall_core are forwarded too
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "studyhall_server=debug,studyhall_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Studyhall Provisioning Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Database path: {:?}", config.database_path);

    let store = match SqliteStore::open(&config.database_path) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(password) = &config.admin_password {
        match store.create_account(&config.admin_username, password) {
            Ok(_) => info!("Created admin account {}", config.admin_username),
            Err(StoreError::AccountExists(_)) => {}
            Err(e) => {
                error!("Failed to create admin account: {}", e);
                std::process::exit(1);
            }
        }
    }

    let controller = match ProvisioningController::new(
        Arc::new(store.clone()),
        Arc::new(store),
        config.provisioning(),
    ) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Invalid provisioning configuration: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let status_state = StatusState {
        health: controller.health(),
    };
    let controller_task = tokio::spawn({
        let controller = controller.clone();
        let cancel = cancel.clone();
        async move { controller.run(&cancel).await }
    });

    let app = status_routes(status_state).layer(TraceLayer::new_for_http());

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            cancel.cancel();
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    cancel.cancel();
    match controller_task.await {
        Ok(Ok(stats)) => info!(
            processed = stats.processed,
            failed = stats.failed,
            last_seq = stats.last_seq,
            "Provisioning controller stopped"
        ),
        Ok(Err(e)) => warn!("Provisioning controller had already failed: {}", e),
        Err(e) => error!("Provisioning controller task panicked: {}", e),
    }

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
