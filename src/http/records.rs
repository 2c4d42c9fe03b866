use axum::{
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use bytes::Bytes;
use tracing::info;

use super::error::{AppError, AppResult};
use crate::{state::AppState, util::Identifier};

pub async fn put(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let id = Identifier::new(identifier);
    state.service.publish(&id, &body).await?;
    info!(%id, "record published");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> AppResult<impl IntoResponse> {
    let id = Identifier::new(identifier);
    let response = state.service.get(&id).await?;
    let headers = [(header::CONTENT_TYPE, "application/octet-stream")];
    Ok((headers, response.to_bytes()))
}

pub async fn missing_identifier() -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, Some("missing identifier"))
}
