use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use socap_session::auth::AuthOrchestrator;
use socap_session::backend::BackendClient;
use socap_session::clock::SystemClock;
use socap_session::config::{self, Config, LogFormat, StoreBackend};
use socap_session::identity::FirebaseIdentityProvider;
use socap_session::metrics::SessionMetrics;
use socap_session::routes::{self, AppState};
use socap_session::store::{
    log_observer, MemoryBackend, SecureStore, SqliteBackend, StoreFailure, StoreObserver,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Check if interactive setup is needed (no .env and missing required values)
    if config::needs_interactive_setup() {
        let interactive_config = config::run_interactive_setup()?;

        // Set environment variables from interactive config so Config::load() can use them
        std::env::set_var("AGENT_API_KEY", &interactive_config.agent_api_key);
        std::env::set_var("FIREBASE_API_KEY", &interactive_config.firebase_api_key);
        std::env::set_var("BACKEND_URL", &interactive_config.backend_url);
        std::env::set_var("SESSION_STORE", &interactive_config.session_store);
        std::env::set_var("SERVER_PORT", &interactive_config.server_port);
    }

    // Load configuration first (for log level)
    let config = Config::load()?;
    init_tracing(&config);
    config.validate()?;

    tracing::info!("SoCap session agent starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    let metrics = Arc::new(SessionMetrics::new());

    let store = Arc::new(build_store(&config, metrics.clone())?);
    tracing::info!("Credential store: {}", store.backend_name());

    let identity = Arc::new(FirebaseIdentityProvider::new(
        config.firebase_api_key.clone(),
        config.identity_url.clone(),
        config.secure_token_url.clone(),
        config.http_connect_timeout,
        config.http_request_timeout,
    )?);

    let backend = Arc::new(BackendClient::new(
        config.backend_url.clone(),
        config.http_connect_timeout,
        config.http_request_timeout,
        config.http_max_retries,
    )?);
    tracing::info!("Backend client initialized for {}", config.backend_url);

    let orchestrator = AuthOrchestrator::new(
        config.session_settings(),
        store,
        identity,
        backend,
        Arc::new(SystemClock),
        metrics.clone(),
    );
    orchestrator.start();

    // Offline bootstrap, then an opportunistic profile refresh
    match orchestrator.restore().await {
        Some(user) => {
            tracing::info!("Restored session for {}", user.email);
            if let Err(e) = orchestrator.refresh_user().await {
                tracing::warn!("Profile refresh at startup failed: {}", e);
            }
        }
        None => tracing::info!("No session to restore, waiting for sign-in"),
    }

    let app_state = AppState {
        agent_api_key: config.agent_api_key.clone(),
        orchestrator: orchestrator.clone(),
        metrics,
    };

    let app = routes::build_app(app_state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    print_startup_banner(&config);

    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Initialize logging with the configured level and format
fn init_tracing(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Build the secure store; failures are logged and counted
fn build_store(config: &Config, metrics: Arc<SessionMetrics>) -> Result<SecureStore> {
    let log = log_observer();
    let observer: StoreObserver = Arc::new(move |failure: &StoreFailure| {
        log(failure);
        metrics.record_store_failure(failure);
    });

    let store = match config.store_backend {
        StoreBackend::Keyring => keyring_store(config, observer)?,
        StoreBackend::Sqlite => SecureStore::with_observer(
            SqliteBackend::open(&config.sqlite_path).with_context(|| {
                format!("Failed to open {}", config.sqlite_path.display())
            })?,
            observer,
        ),
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory credential store, sessions will not survive a restart");
            SecureStore::with_observer(MemoryBackend::new(), observer)
        }
    };
    Ok(store)
}

#[cfg(feature = "system-keyring")]
fn keyring_store(_config: &Config, observer: StoreObserver) -> Result<SecureStore> {
    use socap_session::store::KeyringBackend;
    Ok(SecureStore::with_observer(KeyringBackend::new(), observer))
}

#[cfg(not(feature = "system-keyring"))]
fn keyring_store(config: &Config, observer: StoreObserver) -> Result<SecureStore> {
    tracing::warn!(
        "Built without keychain support, falling back to {}",
        config.sqlite_path.display()
    );
    let backend = SqliteBackend::open(&config.sqlite_path)
        .with_context(|| format!("Failed to open {}", config.sqlite_path.display()))?;
    Ok(SecureStore::with_observer(backend, observer))
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    println!();
    println!("  SoCap session agent");
    println!("  Version:      {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:       http://{}:{}",
        config.server_host, config.server_port
    );
    println!("  Store:        {:?}", config.store_backend);
    println!("  Idle timeout: {}s", config.idle_timeout);
    println!("  Log Level:    {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
