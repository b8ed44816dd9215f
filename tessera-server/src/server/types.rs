use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_core::{IngestionProgress, PartitionKey, PartitionStatus, TesseraError};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Error surfaced to HTTP callers with a status matching its kind.
#[derive(Debug)]
pub struct ApiError(pub TesseraError);

impl From<TesseraError> for ApiError {
    fn from(error: TesseraError) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            TesseraError::NotFound(_) => StatusCode::NOT_FOUND,
            TesseraError::PartitionUnavailable { .. } | TesseraError::PartitionNotHosted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            TesseraError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            TesseraError::InvalidRequest(_) | TesseraError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub node_id: String,
    pub advertise_url: String,
    pub status: String,
    pub partitions: usize,
    pub ready_partitions: usize,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PartitionView {
    pub partition: PartitionKey,
    #[serde(flatten)]
    pub status: PartitionStatus,
    pub consuming: bool,
    pub progress: Option<IngestionProgress>,
}

/// Body of the local change-log append endpoint. `value: null` is a delete.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendRecordRequest {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendRecordResponse {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}
