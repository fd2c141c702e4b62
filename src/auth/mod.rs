use axum::Router;

use crate::state::AppState;

pub(crate) mod dto;
pub mod extractors;
pub mod handlers;
pub mod jwt;
pub mod password;

pub fn router() -> Router<AppState> {
    handlers::auth_routes()
}
