use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::web::{AppError, AppState};

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AccountStateResponse {
    pub id: i64,
    pub name: String,
    pub region: String,
    pub state: &'static str,
}

/// Acknowledges enqueueing only; the pass outcome surfaces through the
/// audit log and notification channel.
async fn trigger_account(
    State(app_state): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    app_state
        .scheduler
        .trigger_now(account_id)
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "queued" })),
    ))
}

async fn list_account_states(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<Vec<AccountStateResponse>>, AppError> {
    let accounts = app_state.store.list_accounts().await?;
    let states = accounts
        .into_iter()
        .map(|account| {
            let state = if app_state.scheduler.is_running(account.id) {
                "running"
            } else {
                "suspended"
            };
            AccountStateResponse {
                id: account.id,
                name: account.name,
                region: account.region,
                state,
            }
        })
        .collect();
    Ok(Json(states))
}

pub fn monitor_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/trigger/{account_id}", post(trigger_account))
        .route("/accounts", get(list_account_states))
}
