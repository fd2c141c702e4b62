use axum::extract::multipart::Field;
use axum::extract::Multipart;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::storage::UploadedImage;
use crate::users::repo::{Role, User};

/// Request body for login. Presence is checked in the handler so a missing
/// field maps to the API's own validation message.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

/// Response returned after a successful login.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

/// Response returned after a successful registration.
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub message: String,
    pub user: User,
}

/// Fields of the multipart registration form.
#[derive(Default)]
pub struct RegisterForm {
    pub name: String,
    pub email: String,
    pub password: String,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub pincode: Option<String>,
    pub address: Option<String>,
    pub role: Option<Role>,
    pub image: Option<UploadedImage>,
}

impl RegisterForm {
    pub async fn from_multipart(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = RegisterForm::default();
        while let Some(field) = multipart.next_field().await.map_err(malformed)? {
            let Some(name) = field.name().map(|s| s.to_string()) else {
                continue;
            };
            match name.as_str() {
                "name" => form.name = text(field).await?,
                "email" => form.email = text(field).await?,
                "password" => form.password = text(field).await?,
                "phone" => form.phone = Some(text(field).await?),
                "city" => form.city = Some(text(field).await?),
                "state" => form.state = Some(text(field).await?),
                "country" => form.country = Some(text(field).await?),
                "pincode" => form.pincode = Some(text(field).await?),
                "address" => form.address = Some(text(field).await?),
                "role" => {
                    let value = text(field).await?;
                    if !value.is_empty() {
                        form.role = Some(
                            value
                                .parse()
                                .map_err(|_| ApiError::Validation("Invalid role".into()))?,
                        );
                    }
                }
                "profile_image" => form.image = image(field).await?,
                _ => {}
            }
        }
        Ok(form)
    }
}

pub(crate) async fn text(field: Field<'_>) -> Result<String, ApiError> {
    field.text().await.map_err(malformed)
}

/// Reads a file field; an empty part (no file picked) counts as no image.
pub(crate) async fn image(field: Field<'_>) -> Result<Option<UploadedImage>, ApiError> {
    let original_name = field.file_name().unwrap_or("upload").to_string();
    let body = field.bytes().await.map_err(malformed)?;
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(UploadedImage {
        body,
        original_name,
    }))
}

pub(crate) fn malformed(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::Validation(format!("Malformed form data: {}", err))
}
