//! Pressfed - ActivityPub federation for a single-site publishing platform
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inbox, actor and followers endpoints                     │
//! │  - WebFinger / host-meta / NodeInfo                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Publish fan-out                                          │
//! │  - Delivery worker lifecycle                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Identity & HTTP Signatures                               │
//! │  - Inbox dispatch                                           │
//! │  - Durable delivery queue                                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): followers, queue                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Federation service used by the binary and publishers
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Federation service, `None` when federation is disabled or the key
    /// could not be loaded
    pub federation: Option<Arc<service::Federation>>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the HTTP client
    /// 3. Load the federation identity
    ///
    /// # Errors
    /// Returns error if the configuration is invalid (including account
    /// paths that would clash in the router) or the database or HTTP
    /// client cannot be set up. A missing or invalid key only disables
    /// federation.
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        config.validate()?;

        let db = Arc::new(data::Database::connect(&config.database.path).await?);

        let http_client = reqwest::Client::builder()
            .user_agent(config.activitypub.user_agent.clone())
            .timeout(federation::REQUEST_TIMEOUT)
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let federation = if config.activitypub.enabled {
            match federation::FederationIdentity::load(&config) {
                Ok(identity) => {
                    tracing::info!(
                        accounts = config.accounts.len(),
                        "Federation identity loaded"
                    );
                    Some(Arc::new(service::Federation::new(
                        &config,
                        identity,
                        Arc::clone(&db),
                        http_client,
                    )))
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to load federation key, federation disabled");
                    None
                }
            }
        } else {
            tracing::info!("Federation disabled by configuration");
            None
        };

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            federation,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments. Federation routes are only
/// mounted when federation is active.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    let mut router = Router::new().route("/health", axum::routing::get(health_check));

    if let Some(federation) = &state.federation {
        router = router
            .merge(api::wellknown_router())
            .merge(api::activitypub_router(federation.identity()));
    }

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
