use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{Config, StorageBackend};
use crate::db::{MemoryStore, Store};
use crate::repository::{SessionRepository, TimerRepository, UserRepository};
use crate::services::{
    AuthService, CredentialStore, DefaultAuthService, SessionManager, SyncService, TimerEngine,
};

pub mod auth;
mod error;
mod extract;
mod observability;
pub mod sync;
mod system;
mod timers;
mod types;

pub use auth::{SESSION_COOKIE, extract_session_token};
pub use error::ApiError;
pub use types::*;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,

    pub auth: Arc<dyn AuthService>,

    pub timers: Arc<TimerEngine>,

    pub sync: Arc<SyncService>,

    pub start_time: std::time::Instant,

    pub prometheus_handle: Option<PrometheusHandle>,
}

/// Wires the services over one storage backend.
pub fn create_app_state<S>(
    store: Arc<S>,
    config: Config,
    prometheus_handle: Option<PrometheusHandle>,
) -> Arc<AppState>
where
    S: UserRepository + SessionRepository + TimerRepository + 'static,
{
    let credentials = CredentialStore::new(store.clone(), config.security.clone());
    let sessions = SessionManager::new(store.clone(), config.security.session_ttl_hours);
    let auth = Arc::new(DefaultAuthService::new(
        store.clone(),
        credentials,
        sessions,
    ));

    let timers = Arc::new(TimerEngine::new(store));
    let sync = Arc::new(SyncService::new(timers.clone(), &config.sync));

    Arc::new(AppState {
        config,
        auth,
        timers,
        sync,
        start_time: std::time::Instant::now(),
        prometheus_handle,
    })
}

pub async fn create_app_state_from_config(
    config: Config,
    prometheus_handle: Option<PrometheusHandle>,
) -> anyhow::Result<Arc<AppState>> {
    let state = match config.storage.backend {
        StorageBackend::Sqlite => {
            let store = Store::with_pool_options(
                &config.storage.database_path,
                config.storage.max_db_connections,
                config.storage.min_db_connections,
            )
            .await?;
            create_app_state(Arc::new(store), config, prometheus_handle)
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage; data is lost on restart");
            create_app_state(Arc::new(MemoryStore::new()), config, prometheus_handle)
        }
    };

    Ok(state)
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors_origins = &state.config.server.cors_allowed_origins;

    let cors_layer = if cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> =
            cors_origins.iter().filter_map(|s| s.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_credentials(true)
    };

    Router::new()
        .merge(create_protected_router(state.clone()))
        .route("/signup", post(auth::signup))
        .route("/login", post(auth::login))
        .route("/logout", get(auth::logout))
        .route("/health", get(system::health))
        .route("/metrics", get(observability::get_metrics))
        .with_state(state)
        .layer(cors_layer)
        .layer(middleware::from_fn(observability::logging_middleware))
        .layer(TraceLayer::new_for_http())
}

fn create_protected_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/me", get(auth::get_current_user))
        .route(
            "/api/timers",
            get(timers::list_timers).post(timers::create_timer),
        )
        .route("/api/timers/{id}/stop", post(timers::stop_timer))
        .merge(sync::router())
        .route_layer(middleware::from_fn_with_state(state, auth::auth_middleware))
}
