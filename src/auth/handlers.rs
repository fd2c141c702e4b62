use axum::{
    extract::{DefaultBodyLimit, FromRef, Multipart, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};

use super::dto::{LoginRequest, LoginResponse, RegisterForm, RegisterResponse};
use super::jwt::JwtKeys;
use super::password::{hash_password, verify_password};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::storage::{remove_rejected_upload, MAX_UPLOAD_BYTES};
use crate::users::repo::{NewUser, User};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

#[instrument(skip(state, multipart))]
async fn register(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let mut form = RegisterForm::from_multipart(multipart).await?;
    form.email = form.email.trim().to_lowercase();

    if form.name.trim().is_empty() || form.email.is_empty() || form.password.is_empty() {
        return Err(ApiError::Validation("Name, email, password required.".into()));
    }
    if !is_valid_email(&form.email) {
        warn!(email = %form.email, "registration with invalid email");
        return Err(ApiError::Validation("Invalid email".into()));
    }

    // Pre-check for the common case; the unique constraint still backstops
    // two registrations racing past it.
    if User::find_by_email(&state.db, &form.email).await?.is_some() {
        warn!(email = %form.email, "email already registered");
        return Err(ApiError::Conflict("Email already registered".into()));
    }

    let password_hash = hash_password(&form.password)?;

    let profile_image = match form.image.take() {
        Some(img) => Some(state.images.save(img.body, &img.original_name).await?),
        None => None,
    };

    let new_user = NewUser {
        name: form.name,
        email: form.email,
        password_hash,
        phone: form.phone,
        city: form.city,
        state: form.state,
        country: form.country,
        pincode: form.pincode,
        address: form.address,
        profile_image: profile_image.clone(),
        role: form.role.unwrap_or_default(),
    };

    let user = match User::create(&state.db, &new_user).await {
        Ok(user) => user,
        Err(e) => {
            remove_rejected_upload(&state.images, profile_image).await;
            return Err(e.into());
        }
    };

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered successfully".into(),
            user,
        }),
    ))
}

#[instrument(skip(state, payload))]
async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let email = payload
        .email
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    let password = payload.password.unwrap_or_default();
    if email.is_empty() || password.is_empty() {
        return Err(ApiError::Validation("Email and password required".into()));
    }

    // Unknown email and wrong password produce the same response, so the
    // API never confirms whether an address is registered.
    let Some(user) = User::find_by_email(&state.db, &email).await? else {
        warn!("login with unknown email");
        return Err(ApiError::Validation("Invalid credentials".into()));
    };

    if !verify_password(&password, &user.password_hash)? {
        warn!(user_id = %user.id, "login with wrong password");
        return Err(ApiError::Validation("Invalid credentials".into()));
    }

    let keys = JwtKeys::from_ref(&state);
    let token = keys.sign(user.id, user.role)?;

    info!(user_id = %user.id, "user logged in");
    Ok(Json(LoginResponse {
        token,
        id: user.id,
        name: user.name,
        email: user.email,
        role: user.role,
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    use crate::app::build_app;
    use crate::state::AppState;

    const BOUNDARY: &str = "test-boundary";

    fn multipart_body(fields: &[(&str, &str)]) -> String {
        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            ));
        }
        body.push_str(&format!("--{}--\r\n", BOUNDARY));
        body
    }

    fn register_request(fields: &[(&str, &str)]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/auth/register")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(fields)))
            .unwrap()
    }

    fn test_app() -> (tempfile::TempDir, axum::Router) {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState::fake(dir.path());
        (dir, build_app(state))
    }

    #[test]
    fn email_shape_check() {
        assert!(super::is_valid_email("alice@example.com"));
        assert!(!super::is_valid_email("alice"));
        assert!(!super::is_valid_email("alice@example"));
        assert!(!super::is_valid_email("a lice@example.com"));
    }

    #[tokio::test]
    async fn register_without_required_fields_is_rejected() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(register_request(&[("name", "Alice")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_with_blank_password_is_rejected() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(register_request(&[
                ("name", "Alice"),
                ("email", "alice@example.com"),
                ("password", ""),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_with_bad_email_is_rejected() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(register_request(&[
                ("name", "Alice"),
                ("email", "not-an-email"),
                ("password", "s3cretpass"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_with_unknown_role_is_rejected() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(register_request(&[
                ("name", "Alice"),
                ("email", "alice@example.com"),
                ("password", "s3cretpass"),
                ("role", "superuser"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn login_without_credentials_is_rejected() {
        let (_dir, app) = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"email":"","password":""}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
