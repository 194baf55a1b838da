//! Dashboard view of a single analysis.

use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::errors::{ApiResponse, AppError};
use crate::models::analysis::Analysis;
use crate::AppState;

/// GET /analysis/{id} — the record a commit status links to.
pub async fn show(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Analysis>>, AppError> {
    let analysis = state
        .store
        .analysis(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Analysis not found".to_string()))?;
    Ok(ApiResponse::success(analysis))
}
