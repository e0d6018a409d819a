//! Access/refresh token issuance and rotation.
//!
//! Access tokens are short-lived HS256 JWTs that are never stored. Refresh
//! tokens are opaque random secrets; only their SHA-256 hash is persisted,
//! together with the family id shared by every token descended from one login.
//! Presenting a refresh token that is no longer active revokes its whole family.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, ErrorCode, Result};
use crate::models::{NewRefreshToken, User};
use crate::services::store::{RefreshTokenStore, UserStore};

/// Raw refresh token entropy in bytes (hex-encoded to twice as many chars).
pub const REFRESH_TOKEN_BYTES: usize = 64;
pub const REFRESH_TOKEN_LEN: usize = REFRESH_TOKEN_BYTES * 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

/// A freshly issued token pair. The refresh token is the raw secret and
/// must only ever leave the process inside an httpOnly cookie.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_family: Uuid,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub tokens: TokenPair,
    pub user: User,
}

struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

pub struct TokenService {
    keys: Option<SigningKeys>,
    tokens: Arc<dyn RefreshTokenStore>,
    users: Arc<dyn UserStore>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

/// Generate a new opaque refresh token: 64 bytes from the OS CSPRNG, lowercase hex.
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash token using SHA-256
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn is_well_formed_refresh_token(token: &str) -> bool {
    token.len() == REFRESH_TOKEN_LEN
        && token.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Short prefix of a token hash, safe to put in logs.
fn log_ref(token_hash: &str) -> &str {
    &token_hash[..token_hash.len().min(12)]
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AppError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AppError::Auth(ErrorCode::TokenExpired),
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => AppError::Auth(ErrorCode::TokenMalformed),
        _ => AppError::Auth(ErrorCode::TokenInvalid),
    }
}

impl TokenService {
    pub fn new(
        config: &Config,
        tokens: Arc<dyn RefreshTokenStore>,
        users: Arc<dyn UserStore>,
    ) -> Self {
        let keys = config.jwt_secret.as_deref().map(|secret| SigningKeys {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        });

        if keys.is_none() {
            log::error!("JWT_SECRET is not set; token issuance will fail");
        }

        Self {
            keys,
            tokens,
            users,
            access_ttl: Duration::minutes(config.access_token_ttl_minutes),
            refresh_ttl: Duration::days(config.refresh_token_ttl_days),
        }
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    fn keys(&self) -> Result<&SigningKeys> {
        self.keys
            .as_ref()
            .ok_or_else(|| AppError::Configuration("JWT signing secret is not configured".into()))
    }

    fn validation(validate_exp: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;
        validation
    }

    fn sign_access_token(&self, user_id: Uuid, email: &str, role: &str) -> Result<(String, DateTime<Utc>)> {
        let keys = self.keys()?;
        let now = Utc::now();
        let expires_at = now + self.access_ttl;

        let claims = Claims {
            user_id,
            email: email.to_string(),
            role: role.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding).map_err(|e| {
            log::error!("Token generation error: {}", e);
            AppError::Internal("Token generation failed".into())
        })?;

        Ok((token, expires_at))
    }

    /// Issue a new pair for a fresh login, starting a new token family.
    pub async fn generate_token_pair(&self, user_id: Uuid, email: &str, role: &str) -> Result<TokenPair> {
        self.issue_pair(user_id, email, role, Uuid::new_v4()).await
    }

    async fn issue_pair(&self, user_id: Uuid, email: &str, role: &str, family: Uuid) -> Result<TokenPair> {
        let (access_token, access_expires_at) = self.sign_access_token(user_id, email, role)?;

        let refresh_token = generate_refresh_token();
        let issued_at = Utc::now();
        let refresh_expires_at = issued_at + self.refresh_ttl;

        // The pair only exists once the hash is persisted; on failure the signed JWT is dropped here.
        self.tokens
            .insert(NewRefreshToken {
                user_id,
                token_hash: hash_token(&refresh_token),
                token_family: family,
                issued_at,
                expires_at: refresh_expires_at,
            })
            .await
            .map_err(|e| {
                log::error!("Failed to persist refresh token for user {}: {}", user_id, e);
                e
            })?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_family: family,
            access_expires_at,
            refresh_expires_at,
        })
    }

    /// Verify signature and expiry of an access token.
    pub fn decode_access_token(&self, token: &str) -> Result<Claims> {
        let keys = self.keys()?;
        decode::<Claims>(token, &keys.decoding, &Self::validation(true))
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    /// Verify the signature of an access token while tolerating expiry.
    pub fn decode_access_token_allow_expired(&self, token: &str) -> Result<Claims> {
        let keys = self.keys()?;
        decode::<Claims>(token, &keys.decoding, &Self::validation(false))
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    /// Full access token check: signature, expiry, and agreement with the live user record.
    pub async fn verify_access_token(&self, token: &str) -> Result<(Claims, User)> {
        let claims = self.decode_access_token(token)?;

        let user = self
            .users
            .find_by_id(claims.user_id)
            .await?
            .ok_or(AppError::Auth(ErrorCode::UserInvalid))?;

        if !user.is_active {
            log::warn!("Access token presented for inactive user {}", user.id);
            return Err(AppError::Forbidden(ErrorCode::AccountInactive));
        }

        if user.role != claims.role || user.email != claims.email {
            log::warn!("Stale access token for user {} (claims no longer match account)", user.id);
            return Err(AppError::Auth(ErrorCode::TokenStale));
        }

        Ok((claims, user))
    }

    /// Rotate a refresh token.
    ///
    /// The presented token is claimed (found and deactivated in one write). A
    /// miss means the token was already rotated out or never issued, and the
    /// whole family it belongs to is revoked.
    pub async fn refresh_access_token(&self, presented: Option<&str>) -> Result<RefreshOutcome> {
        let presented = match presented {
            Some(token) if !token.is_empty() => token,
            _ => return Err(AppError::Auth(ErrorCode::TokenMissing)),
        };

        if !is_well_formed_refresh_token(presented) {
            return Err(AppError::Auth(ErrorCode::TokenInvalid));
        }

        // Fail before consuming the token if we could not issue a replacement anyway.
        self.keys()?;

        let token_hash = hash_token(presented);

        let record = match self.tokens.claim(&token_hash).await? {
            Some(record) => record,
            None => {
                self.handle_reuse(&token_hash).await?;
                return Err(AppError::Auth(ErrorCode::TokenReused));
            }
        };

        if record.is_expired_at(Utc::now()) {
            log::info!(
                "Expired refresh token presented for user {} (family {})",
                record.user_id,
                record.token_family
            );
            return Err(AppError::Auth(ErrorCode::TokenExpired));
        }

        let user = match self.users.find_by_id(record.user_id).await? {
            Some(user) if user.is_active => user,
            _ => {
                log::warn!("Refresh rejected for missing or inactive user {}", record.user_id);
                return Err(AppError::Auth(ErrorCode::UserInvalid));
            }
        };

        let tokens = self
            .issue_pair(user.id, &user.email, &user.role, record.token_family)
            .await?;

        log::debug!("Rotated refresh token for user {} (family {})", user.id, record.token_family);

        Ok(RefreshOutcome { tokens, user })
    }

    async fn handle_reuse(&self, token_hash: &str) -> Result<()> {
        match self.tokens.find_by_hash(token_hash).await? {
            Some(record) => {
                let revoked = self.tokens.revoke_family(record.token_family).await?;
                log::warn!(
                    "Refresh token reuse detected for user {} (family {}, ref {}); revoked {} active token(s)",
                    record.user_id,
                    record.token_family,
                    log_ref(token_hash),
                    revoked
                );
            }
            None => {
                log::warn!("Unknown refresh token presented (ref {})", log_ref(token_hash));
            }
        }
        Ok(())
    }

    /// Revoke the family the presented refresh token belongs to (logout).
    pub async fn revoke_token_family(&self, presented: &str) -> Result<u64> {
        if !is_well_formed_refresh_token(presented) {
            return Ok(0);
        }

        match self.tokens.find_by_hash(&hash_token(presented)).await? {
            Some(record) => self.tokens.revoke_family(record.token_family).await,
            None => Ok(0),
        }
    }

    /// Deactivate every refresh token the user holds, across all families.
    pub async fn revoke_all_user_tokens(&self, user_id: Uuid) -> Result<u64> {
        let revoked = self.tokens.revoke_user(user_id).await?;
        log::info!("Revoked {} refresh token(s) for user {}", revoked, user_id);
        Ok(revoked)
    }

    /// Deactivate refresh tokens past their expiry.
    pub async fn cleanup_expired_tokens(&self) -> Result<u64> {
        let deactivated = self.tokens.deactivate_expired(Utc::now()).await?;
        if deactivated > 0 {
            log::info!("Deactivated {} expired refresh token(s)", deactivated);
        }
        Ok(deactivated)
    }
}
