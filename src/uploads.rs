use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::instrument;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Public image serving. Anyone holding a filename can fetch the bytes;
/// references are the only capability, there is no authorization here.
pub fn uploads_router() -> Router<AppState> {
    Router::new().route("/uploads/:filename", get(serve_image))
}

#[instrument(skip(state))]
async fn serve_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    // Reject anything that could escape the uploads directory. Stored names
    // are bare timestamps, so a separator can only mean traversal.
    if !is_safe_filename(&filename) {
        return Err(ApiError::NotFound("File not found".into()));
    }

    let Some(bytes) = state.images.read(&filename).await? else {
        return Err(ApiError::NotFound("File not found".into()));
    };

    let mime = mime_guess::from_path(&filename)
        .first_or_octet_stream()
        .to_string();

    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

fn is_safe_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}
