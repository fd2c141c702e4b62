use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

/// Role carried by every user record and embedded in issued tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Full user record. The password hash never leaves the server: it is
/// skipped on serialization, so rows can be returned to clients directly.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub pincode: Option<String>,
    pub address: Option<String>,
    pub profile_image: Option<String>,
    pub role: Role,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Fields for inserting a new record.
#[derive(Debug)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub pincode: Option<String>,
    pub address: Option<String>,
    pub profile_image: Option<String>,
    pub role: Role,
}

/// Partial update; `None` leaves the stored value untouched.
#[derive(Debug, Default)]
pub struct UserChanges {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub pincode: Option<String>,
    pub address: Option<String>,
    pub profile_image: Option<String>,
    pub role: Option<Role>,
}

const USER_COLUMNS: &str = "id, name, email, password_hash, phone, city, state, country, \
                            pincode, address, profile_image, role, created_at, updated_at";

impl User {
    pub async fn find_by_email(db: &PgPool, email: &str) -> sqlx::Result<Option<User>> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE email = $1",
            USER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(db)
        .await
    }

    pub async fn find_by_id(db: &PgPool, id: Uuid) -> sqlx::Result<Option<User>> {
        sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_all(db: &PgPool) -> sqlx::Result<Vec<User>> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users ORDER BY created_at",
            USER_COLUMNS
        ))
        .fetch_all(db)
        .await
    }

    /// Inserts a record. A duplicate email trips the unique constraint,
    /// which the error layer reports as a conflict.
    pub async fn create(db: &PgPool, new: &NewUser) -> sqlx::Result<User> {
        sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users \
                 (name, email, password_hash, phone, city, state, country, \
                  pincode, address, profile_image, role) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {}",
            USER_COLUMNS
        ))
        .bind(&new.name)
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(&new.phone)
        .bind(&new.city)
        .bind(&new.state)
        .bind(&new.country)
        .bind(&new.pincode)
        .bind(&new.address)
        .bind(&new.profile_image)
        .bind(new.role)
        .fetch_one(db)
        .await
    }

    /// Applies the supplied fields, leaving the rest as stored. Returns
    /// `None` when no record exists at `id`.
    pub async fn update_fields(
        db: &PgPool,
        id: Uuid,
        changes: &UserChanges,
    ) -> sqlx::Result<Option<User>> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET \
                 name = COALESCE($2, name), \
                 email = COALESCE($3, email), \
                 password_hash = COALESCE($4, password_hash), \
                 phone = COALESCE($5, phone), \
                 city = COALESCE($6, city), \
                 state = COALESCE($7, state), \
                 country = COALESCE($8, country), \
                 pincode = COALESCE($9, pincode), \
                 address = COALESCE($10, address), \
                 profile_image = COALESCE($11, profile_image), \
                 role = COALESCE($12, role), \
                 updated_at = now() \
             WHERE id = $1 \
             RETURNING {}",
            USER_COLUMNS
        ))
        .bind(id)
        .bind(&changes.name)
        .bind(&changes.email)
        .bind(&changes.password_hash)
        .bind(&changes.phone)
        .bind(&changes.city)
        .bind(&changes.state)
        .bind(&changes.country)
        .bind(&changes.pincode)
        .bind(&changes.address)
        .bind(&changes.profile_image)
        .bind(changes.role)
        .fetch_optional(db)
        .await
    }

    /// Removes a record, returning it so the caller can clean up the
    /// associated image file. `None` when no record exists at `id`.
    pub async fn delete(db: &PgPool, id: Uuid) -> sqlx::Result<Option<User>> {
        sqlx::query_as::<_, User>(&format!(
            "DELETE FROM users WHERE id = $1 RETURNING {}",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(db)
        .await
    }
}
