use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    routing::get,
    Json, Router,
};
use tracing::{info, instrument};
use uuid::Uuid;

use super::dto::{DeleteResponse, UpdateForm, UpdateResponse};
use super::repo::{User, UserChanges};
use crate::auth::extractors::{AdminUser, AuthUser};
use crate::auth::password::hash_password;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::storage::{remove_best_effort, remove_rejected_upload, MAX_UPLOAD_BYTES};

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users))
        .route(
            "/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

/// Ids are opaque; anything that does not parse cannot name a record, so it
/// reports the same way as an absent one (and stays a JSON error body).
fn parse_user_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound("User not found".into()))
}

/// Any authenticated caller may list; the hash is skipped on serialization.
#[instrument(skip(state))]
async fn list_users(
    State(state): State<AppState>,
    _caller: AuthUser,
) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(User::list_all(&state.db).await?))
}

#[instrument(skip(state))]
async fn get_user(
    State(state): State<AppState>,
    caller: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<User>> {
    let id = parse_user_id(&id)?;
    let Some(user) = User::find_by_id(&state.db, id).await? else {
        return Err(ApiError::NotFound("User not found".into()));
    };

    // A record is visible to its owner and to admins only.
    if !caller.role.is_admin() && caller.id != user.id {
        return Err(ApiError::Forbidden(
            "Access denied. You can only view your own profile.".into(),
        ));
    }

    Ok(Json(user))
}

#[instrument(skip(state, multipart))]
async fn update_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    multipart: Multipart,
) -> ApiResult<Json<UpdateResponse>> {
    let id = parse_user_id(&id)?;
    let mut form = UpdateForm::from_multipart(multipart).await?;

    let Some(existing) = User::find_by_id(&state.db, id).await? else {
        return Err(ApiError::NotFound("User not found".into()));
    };

    // A blank password field means "keep the current one".
    let password_hash = match form.password.take() {
        Some(p) if !p.is_empty() => Some(hash_password(&p)?),
        _ => None,
    };

    let new_image = match form.image.take() {
        Some(img) => Some(state.images.save(img.body, &img.original_name).await?),
        None => None,
    };

    let changes = UserChanges {
        name: form.name,
        email: form.email.map(|e| e.trim().to_lowercase()),
        password_hash,
        phone: form.phone,
        city: form.city,
        state: form.state,
        country: form.country,
        pincode: form.pincode,
        address: form.address,
        profile_image: new_image.clone(),
        role: form.role,
    };

    let updated = match User::update_fields(&state.db, id, &changes).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            remove_rejected_upload(&state.images, new_image).await;
            return Err(ApiError::NotFound("User not found".into()));
        }
        Err(e) => {
            remove_rejected_upload(&state.images, new_image).await;
            return Err(e.into());
        }
    };

    // The new file is referenced now; retire the one it replaced.
    if new_image.is_some() {
        if let Some(old) = existing.profile_image {
            tokio::spawn(remove_best_effort(state.images.clone(), old));
        }
    }

    info!(user_id = %updated.id, admin_id = %admin.id, "user updated");
    Ok(Json(UpdateResponse {
        message: "User updated successfully".into(),
        user: updated,
    }))
}

#[instrument(skip(state))]
async fn delete_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    let id = parse_user_id(&id)?;
    let Some(user) = User::delete(&state.db, id).await? else {
        return Err(ApiError::NotFound("User not found".into()));
    };

    if let Some(image) = user.profile_image {
        tokio::spawn(remove_best_effort(state.images.clone(), image));
    }

    info!(user_id = %user.id, admin_id = %admin.id, "user deleted");
    Ok(Json(DeleteResponse {
        message: "User deleted successfully".into(),
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use jsonwebtoken::{encode, Header};
    use time::OffsetDateTime;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::app::build_app;
    use crate::auth::jwt::{Claims, JwtKeys};
    use crate::state::AppState;
    use crate::users::repo::Role;

    fn test_app() -> (tempfile::TempDir, AppState, axum::Router) {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState::fake(dir.path());
        let app = build_app(state.clone());
        (dir, state, app)
    }

    fn keys_for(state: &AppState) -> JwtKeys {
        JwtKeys::new(
            &state.config.jwt.secret,
            Duration::from_secs(state.config.jwt.ttl_hours as u64 * 3600),
        )
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    fn request(method: &str, uri: &str, auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn list_without_token_is_unauthorized() {
        let (_dir, _state, app) = test_app();
        let response = app.oneshot(request("GET", "/api/users", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn list_with_garbage_token_is_unauthorized() {
        let (_dir, _state, app) = test_app();
        let response = app
            .oneshot(request("GET", "/api/users", Some("Bearer not.a.jwt")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn list_with_non_bearer_scheme_is_unauthorized() {
        let (_dir, _state, app) = test_app();
        let response = app
            .oneshot(request("GET", "/api/users", Some("Basic dXNlcjpwdw==")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn expired_token_is_unauthorized_on_protected_routes() {
        let (_dir, state, app) = test_app();
        let keys = keys_for(&state);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            id: Uuid::new_v4(),
            role: Role::Admin,
            iat: (now - 7200) as usize,
            exp: (now - 3600) as usize,
        };
        let token = encode(&Header::default(), &claims, &keys.encoding).unwrap();

        let response = app
            .oneshot(request("GET", "/api/users", Some(&bearer(&token))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn plain_user_cannot_delete_anyone_including_self() {
        let (_dir, state, app) = test_app();
        let keys = keys_for(&state);
        let own_id = Uuid::new_v4();
        let token = keys.sign(own_id, Role::User).unwrap();

        let uri = format!("/api/users/{}", own_id);
        let response = app
            .oneshot(request("DELETE", &uri, Some(&bearer(&token))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn plain_user_cannot_update_anyone_including_self() {
        let (_dir, state, app) = test_app();
        let keys = keys_for(&state);
        let own_id = Uuid::new_v4();
        let token = keys.sign(own_id, Role::User).unwrap();

        let uri = format!("/api/users/{}", own_id);
        let req = Request::builder()
            .method("PUT")
            .uri(uri)
            .header(header::AUTHORIZATION, bearer(&token))
            .header(
                header::CONTENT_TYPE,
                "multipart/form-data; boundary=test-boundary",
            )
            .body(Body::from("--test-boundary--\r\n"))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn malformed_id_reads_as_missing_record() {
        let (_dir, state, app) = test_app();
        let keys = keys_for(&state);
        let token = keys.sign(Uuid::new_v4(), Role::Admin).unwrap();

        let response = app
            .oneshot(request(
                "DELETE",
                "/api/users/not-a-uuid",
                Some(&bearer(&token)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn update_without_token_is_unauthorized_not_forbidden() {
        let (_dir, _state, app) = test_app();
        let uri = format!("/api/users/{}", Uuid::new_v4());
        let response = app.oneshot(request("PUT", &uri, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
