//! # Health Check
//!
//! `GET /healthz`, served without authentication. Reports liveness only and
//! never touches a model slot beyond reading its status.

use crate::runtime::SlotStatus;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let loaded: Vec<String> = state
        .registry
        .status()
        .into_iter()
        .filter(|report| report.status == SlotStatus::Ready)
        .map(|report| report.kind.to_string())
        .collect();

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "device": state.device,
        "loaded_models": loaded,
    }))
}
