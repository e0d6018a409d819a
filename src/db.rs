pub use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use crate::error::Result;
use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    log::info!("Creating database pool for: {}", database_url);

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    // An in-memory database lives and dies with its connection, so keep exactly one alive.
    let in_memory = database_url.contains(":memory:");
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_options
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(options)
        .await
        .map_err(|e| {
            log::error!("Failed to create database pool: {}", e);
            e
        })?;

    log::info!("Database pool created successfully");

    Ok(pool)
}

/// Create the users and refresh_tokens tables if they do not exist yet.
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    let queries = [
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BLOB PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'user' CHECK(role IN ('user', 'moderator', 'admin')),
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS refresh_tokens (
            id BLOB PRIMARY KEY,
            user_id BLOB NOT NULL,
            token_hash TEXT NOT NULL UNIQUE,
            token_family BLOB NOT NULL,
            issued_at DATETIME NOT NULL,
            expires_at DATETIME NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_refresh_tokens_family ON refresh_tokens(token_family)",
        "CREATE INDEX IF NOT EXISTS idx_refresh_tokens_user_id ON refresh_tokens(user_id)",
        "CREATE INDEX IF NOT EXISTS idx_refresh_tokens_expires_at ON refresh_tokens(expires_at)",
    ];

    for query in queries {
        sqlx::query(query).execute(pool).await.map_err(|e| {
            log::error!("Failed to execute schema query: {}", e);
            e
        })?;
    }

    log::info!("Database tables ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn test_create_tables_is_idempotent() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        create_tables(&pool).await.unwrap();
        create_tables(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'refresh_tokens')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 2);
    }
}
