use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{NewRefreshToken, RefreshTokenRecord, User};

/// Persistence for refresh tokens.
///
/// `claim` is the only way a refresh token may be consumed: it must find an
/// active row by hash and deactivate it in one conditional write, so that of
/// two concurrent callers presenting the same token exactly one gets the row.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord>;

    /// Atomically deactivate the active row matching `token_hash` and return it.
    async fn claim(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>>;

    /// Look up a row by hash regardless of state.
    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>>;

    async fn revoke_family(&self, family: Uuid) -> Result<u64>;

    async fn revoke_user(&self, user_id: Uuid) -> Result<u64>;

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn create(&self, email: &str, password_hash: &str, role: &str) -> Result<User>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const TOKEN_COLUMNS: &str = "id, user_id, token_hash, token_family, issued_at, expires_at, is_active";

#[async_trait]
impl RefreshTokenStore for SqliteStore {
    async fn insert(&self, token: NewRefreshToken) -> Result<RefreshTokenRecord> {
        let record = sqlx::query_as::<_, RefreshTokenRecord>(&format!(
            r#"
            INSERT INTO refresh_tokens (id, user_id, token_hash, token_family, issued_at, expires_at, is_active)
            VALUES (?, ?, ?, ?, ?, ?, TRUE)
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(token.token_family)
        .bind(token.issued_at)
        .bind(token.expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn claim(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>> {
        let record = sqlx::query_as::<_, RefreshTokenRecord>(&format!(
            r#"
            UPDATE refresh_tokens
            SET is_active = FALSE
            WHERE token_hash = ? AND is_active = TRUE
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>> {
        let record = sqlx::query_as::<_, RefreshTokenRecord>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token_hash = ?"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn revoke_family(&self, family: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET is_active = FALSE WHERE token_family = ? AND is_active = TRUE",
        )
        .bind(family)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn revoke_user(&self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET is_active = FALSE WHERE user_id = ? AND is_active = TRUE",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET is_active = FALSE WHERE expires_at <= ? AND is_active = TRUE",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    async fn create(&self, email: &str, password_hash: &str, role: &str) -> Result<User> {
        let now = Utc::now();
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, password_hash, role, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, TRUE, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(password_hash)
        .bind(role)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }
}
