//! Axum JSON API for duplicate checks.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dupscan_core::{DuplicateFinding, DuplicateType, FindingStatus, SimilarityThresholds};
use dupscan_engine::{
    DetectError, DetectionReport, DetectionRequest, DetectorConfig, DuplicateDetector,
    MISSING_IDS_MESSAGE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "dupscan-web";

pub const NOT_FOUND_MESSAGE: &str = "Document not found";
pub const INTERNAL_ERROR_MESSAGE: &str = "Failed to check for duplicates";

#[derive(Clone)]
pub struct AppState {
    pub detector: DuplicateDetector,
    pub default_thresholds: SimilarityThresholds,
}

impl AppState {
    pub fn new(detector: DuplicateDetector, default_thresholds: SimilarityThresholds) -> Self {
        Self {
            detector,
            default_thresholds,
        }
    }
}

/// Member-wise overrides of the configured thresholds.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ThresholdsOverride {
    pub name: Option<f64>,
    pub address: Option<f64>,
    pub signature: Option<f64>,
}

impl ThresholdsOverride {
    pub fn apply(&self, base: SimilarityThresholds) -> SimilarityThresholds {
        SimilarityThresholds {
            name: self.name.unwrap_or(base.name),
            address: self.address.unwrap_or(base.address),
            signature: self.signature.unwrap_or(base.signature),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectDuplicatesRequest {
    pub document_id: Option<String>,
    pub batch_id: Option<String>,
    pub check_cross_batch: Option<bool>,
    pub thresholds: Option<ThresholdsOverride>,
}

impl DetectDuplicatesRequest {
    pub fn into_detection_request(self, defaults: SimilarityThresholds) -> DetectionRequest {
        DetectionRequest::new(
            self.document_id.unwrap_or_default(),
            self.batch_id.unwrap_or_default(),
        )
        .cross_batch(self.check_cross_batch.unwrap_or(false))
        .thresholds(self.thresholds.unwrap_or_default().apply(defaults))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateFieldsView {
    pub name_score: f64,
    pub address_score: f64,
    pub source_name: String,
    pub duplicate_name: String,
    pub source_address: String,
    pub duplicate_address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateView {
    pub id: String,
    pub duplicate_document_id: String,
    pub duplicate_type: DuplicateType,
    pub similarity_score: f64,
    pub status: FindingStatus,
    pub duplicate_fields: DuplicateFieldsView,
}

impl From<DuplicateFinding> for DuplicateView {
    fn from(f: DuplicateFinding) -> Self {
        Self {
            id: f.id.to_string(),
            duplicate_document_id: f.candidate_document_id,
            duplicate_type: f.duplicate_type,
            similarity_score: f.similarity_score,
            status: f.status,
            duplicate_fields: DuplicateFieldsView {
                name_score: f.field_scores.name,
                address_score: f.field_scores.address,
                source_name: f.source_key.name,
                duplicate_name: f.candidate_key.name,
                source_address: f.source_key.address,
                duplicate_address: f.candidate_key.address,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectDuplicatesResponse {
    pub success: bool,
    pub duplicates: Vec<DuplicateView>,
    pub total_checked: usize,
    pub total_duplicates: usize,
    pub persisted: usize,
    pub failed_emissions: Vec<String>,
    pub truncated: bool,
}

impl From<DetectionReport> for DetectDuplicatesResponse {
    fn from(report: DetectionReport) -> Self {
        let duplicates = report
            .findings
            .into_iter()
            .map(DuplicateView::from)
            .collect::<Vec<_>>();
        Self {
            success: true,
            total_duplicates: duplicates.len(),
            duplicates,
            total_checked: report.total_checked,
            persisted: report.persisted,
            failed_emissions: report
                .failures
                .into_iter()
                .map(|f| f.candidate_document_id)
                .collect(),
            truncated: report.truncated,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DetectError> for ApiError {
    fn from(err: DetectError) -> Self {
        match err {
            DetectError::Validation(msg) => Self::BadRequest(msg),
            DetectError::NotFound(id) => Self::NotFound(id),
            DetectError::Store(err) => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(id) => {
                info!(document_id = %id, "duplicate check for unknown document");
                (StatusCode::NOT_FOUND, NOT_FOUND_MESSAGE.to_string())
            }
            Self::Internal(detail) => {
                error!(error = %detail, "duplicate check failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_ERROR_MESSAGE.to_string(),
                )
            }
        };
        (
            status,
            Json(serde_json::json!({
                "success": false,
                "error": message,
            })),
        )
            .into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/duplicates/detect", post(detect_duplicates_handler))
        .route("/healthz", get(healthz_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("DUPSCAN_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = DetectorConfig::from_env()?;
    let detector = DuplicateDetector::from_config(&config).await?;
    let state = AppState::new(detector, config.thresholds);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, max_candidates = config.max_candidates, "duplicate check API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn detect_duplicates_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DetectDuplicatesRequest>, JsonRejection>,
) -> Result<Json<DetectDuplicatesResponse>, ApiError> {
    let Json(payload) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "rejected duplicate check body");
        ApiError::BadRequest(MISSING_IDS_MESSAGE.to_string())
    })?;
    let request = payload.into_detection_request(state.default_thresholds);
    let report = state.detector.detect(&request).await?;
    Ok(Json(DetectDuplicatesResponse::from(report)))
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
