use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::store::LedgerStore;

/// Health check endpoint handler
///
/// Probes the store with a cheap read so a dead database shows up as 503.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let store_ok = state.store.find_wallet("health-probe").await.is_ok();
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if store_ok { "healthy" } else { "degraded" },
            "service": "storefront-rs",
            "version": env!("CARGO_PKG_VERSION"),
            "store": if store_ok { "up" } else { "down" },
        })),
    )
}
