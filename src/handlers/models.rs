//! # Model Status Handler
//!
//! `GET /v1/models/status` reports every slot without loading or
//! downloading anything.
//!
//! ## Response:
//! ```json
//! {
//!   "ttl_seconds": 300,
//!   "download_mode": "lazy",
//!   "models": [
//!     {
//!       "kind": "asr",
//!       "status": "ready",
//!       "loaded": true,
//!       "downloaded": true,
//!       "idle_seconds": 12.5,
//!       "precision": "full",
//!       "use_half": false,
//!       "fallback_enabled": true,
//!       "load_count": 1,
//!       "pins": 0
//!     }
//!   ]
//! }
//! ```

use crate::config::DownloadMode;
use crate::error::AppResult;
use crate::runtime::SlotReport;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ModelStatusResponse {
    pub timestamp: String,
    pub ttl_seconds: u64,
    pub reaper_interval_seconds: u64,
    pub download_mode: DownloadMode,
    pub models: Vec<SlotReport>,
}

pub async fn models_status(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let models = &state.config.models;
    Ok(HttpResponse::Ok().json(ModelStatusResponse {
        timestamp: chrono::Utc::now().to_rfc3339(),
        ttl_seconds: models.ttl_seconds,
        reaper_interval_seconds: models.reaper_interval().as_secs(),
        download_mode: models.download_mode,
        models: state.registry.status(),
    }))
}
