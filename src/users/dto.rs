use axum::extract::Multipart;
use serde::Serialize;

use crate::auth::dto::{image, malformed, text};
use crate::error::ApiError;
use crate::storage::UploadedImage;
use crate::users::repo::{Role, User};

/// Response returned after a successful update.
#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub message: String,
    pub user: User,
}

/// Confirmation body for deletions.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: String,
}

/// Fields of the multipart update form; everything is optional and an
/// absent field leaves the stored value untouched.
#[derive(Default)]
pub struct UpdateForm {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub pincode: Option<String>,
    pub address: Option<String>,
    pub role: Option<Role>,
    pub image: Option<UploadedImage>,
}

impl UpdateForm {
    pub async fn from_multipart(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = UpdateForm::default();
        while let Some(field) = multipart.next_field().await.map_err(malformed)? {
            let Some(name) = field.name().map(|s| s.to_string()) else {
                continue;
            };
            match name.as_str() {
                "name" => form.name = Some(text(field).await?),
                "email" => form.email = Some(text(field).await?),
                "password" => form.password = Some(text(field).await?),
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
