use std::sync::Arc;

use axum::{http::StatusCode, routing::get, Router};
use tower_http::cors::CorsLayer;

use crate::monitor::MonitorScheduler;
use crate::policy::ConfigStore;

pub mod error;
pub mod routes;

pub use error::AppError;

use routes::monitor_routes::monitor_router;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<MonitorScheduler>,
    pub store: Arc<dyn ConfigStore>,
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub fn create_axum_router(
    scheduler: Arc<MonitorScheduler>,
    store: Arc<dyn ConfigStore>,
) -> Router {
    let app_state = Arc::new(AppState { scheduler, store });

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/v1/monitor", monitor_router())
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}
