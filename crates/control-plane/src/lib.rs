//! pg-dd control plane.
//!
//! Starts one containerized database dump worker per request and waits for
//! it to report back:
//!
//! - **Contract**: validates the worker contract into an immutable
//!   descriptor and renders the worker environment
//! - **Provisioning**: derives a least-privilege capability grant per run
//! - **Dispatch**: launches exactly one worker with a one-time callback token
//! - **Coordination**: races success, failure and heartbeat callbacks against
//!   a deadline so each run reaches exactly one terminal state
//! - **Output store**: run-partitioned object layout and bucket policy
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables and YAML
//! - [`contract`]: Worker contract, descriptor and environment
//! - [`provisioner`]: Capability grants
//! - [`dispatch`]: Compute launchers and callback tokens
//! - [`engine`]: Run state machine and completion coordinator
//! - [`store`]: Output layout, bucket policy and versioned store model
//! - [`db`]: Postgres run archive
//! - [`nats`]: Run notifications on NATS JetStream
//! - [`handlers`]: HTTP route handlers
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pg_dd_control_plane::{
//!     build_router,
//!     config::AppConfig,
//!     dispatch::ProcessLauncher,
//!     engine::{Coordinator, Sinks},
//!     state::AppState,
//! };
//!
//! let config = AppConfig::from_env()?;
//! let launcher = Arc::new(ProcessLauncher::new(&config.worker_program));
//! let coordinator = Coordinator::new(launcher, config.dispatch_settings(), Sinks::default());
//! let app = build_router(AppState::new(coordinator, config));
//! ```

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod contract;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod nats;
pub mod provisioner;
pub mod result_ext;
pub mod sanitize;
pub mod state;
pub mod store;
pub mod template;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;

use state::AppState;

/// Build the application router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/health", get(handlers::api_health))
        .with_state(state.clone());

    let run_routes = Router::new()
        .route(
            "/api/runs",
            post(handlers::runs::dispatch).get(handlers::runs::list),
        )
        .route("/api/runs/{run_id}", get(handlers::runs::get))
        .route("/api/runs/{run_id}/wait", get(handlers::runs::wait))
        .route("/api/runs/{run_id}/cancel", post(handlers::runs::cancel))
        .with_state(state.clone());

    let callback_routes = Router::new()
        .route(
            "/api/callbacks/success",
            post(handlers::callbacks::success),
        )
        .route(
            "/api/callbacks/failure",
            post(handlers::callbacks::failure),
        )
        .route(
            "/api/callbacks/heartbeat",
            post(handlers::callbacks::heartbeat),
        )
        .with_state(state.clone());

    let store_routes = Router::new()
        .route("/api/store/policy", get(handlers::store::policy))
        .with_state(state);

    Router::new()
        .merge(health_routes)
        .merge(run_routes)
        .merge(callback_routes)
        .merge(store_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
