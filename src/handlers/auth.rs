use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use bcrypt::{hash, verify};
use serde::Deserialize;

use crate::cookies::{REFRESH_COOKIE, SESSION_COOKIE};
use crate::error::{AppError, ErrorCode, Result};
use crate::middleware::{AuthenticatedUser, CsrfToken, RefreshedSession};
use crate::models::{UserProfile, ROLE_USER};
use crate::routes::AppState;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

fn validate_registration(body: &RegisterRequest) -> Result<()> {
    if !body.email.contains('@') {
        return Err(AppError::Validation("A valid email address is required".into()));
    }
    if body.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn user_body(profile: UserProfile) -> serde_json::Value {
    serde_json::json!({ "user": profile })
}

pub async fn register(state: web::Data<AppState>, body: web::Json<RegisterRequest>) -> Result<HttpResponse> {
    validate_registration(&body)?;

    let users = state.tokens.users();
    let email = body.email.trim().to_lowercase();

    if users.find_by_email(&email).await?.is_some() {
        return Err(AppError::Validation("Email already registered".into()));
    }

    let password_hash = hash(&body.password, state.config.bcrypt_cost)?;
    let user = users.create(&email, &password_hash, ROLE_USER).await?;

    log::info!("Registered user {}", user.id);
    Ok(HttpResponse::Created().json(user_body(UserProfile::from(&user))))
}

pub async fn login(state: web::Data<AppState>, body: web::Json<LoginRequest>) -> Result<HttpResponse> {
    let email = body.email.trim().to_lowercase();

    let Some(user) = state.tokens.users().find_by_email(&email).await? else {
        log::info!("Login failed: unknown email");
        return Err(AppError::Auth(ErrorCode::UserInvalid));
    };

    if !verify(&body.password, &user.password_hash).unwrap_or(false) {
        log::info!("Login failed for user {}: bad password", user.id);
        return Err(AppError::Auth(ErrorCode::UserInvalid));
    }

    if !user.is_active {
        log::warn!("Login refused for inactive user {}", user.id);
        return Err(AppError::Forbidden(ErrorCode::AccountInactive));
    }

    let tokens = state.tokens.generate_token_pair(user.id, &user.email, &user.role).await?;

    let mut response = HttpResponse::Ok().json(user_body(UserProfile::from(&user)));
    state.cookies.set_token_cookies(&mut response, &tokens);

    log::info!("User {} logged in", user.id);
    Ok(response)
}

/// Rotate the refresh token. If auto-refresh already rotated it during this
/// request, the cookies are on their way and the old token is spent, so
/// report that rotation instead of claiming again.
pub async fn refresh(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse> {
    let already_refreshed = req.extensions().get::<RefreshedSession>().cloned();
    if let Some(session) = already_refreshed {
        return Ok(HttpResponse::Ok().json(user_body(session.user)));
    }

    let presented = req.cookie(REFRESH_COOKIE).map(|c| c.value().to_string());
    let outcome = state.tokens.refresh_access_token(presented.as_deref()).await?;

    let mut response = HttpResponse::Ok().json(user_body(UserProfile::from(&outcome.user)));
    state.cookies.set_token_cookies(&mut response, &outcome.tokens);
    Ok(response)
}

pub async fn logout(state: web::Data<AppState>, user: AuthenticatedUser, req: HttpRequest) -> Result<HttpResponse> {
    let presented = match req.extensions().get::<RefreshedSession>() {
        Some(session) => Some(session.tokens.refresh_token.clone()),
        None => req.cookie(REFRESH_COOKIE).map(|c| c.value().to_string()),
    };

    if let Some(token) = presented.filter(|t| !t.is_empty()) {
        let revoked = state.tokens.revoke_token_family(&token).await?;
        log::info!("User {} logged out, revoked {} refresh token(s)", user.id, revoked);
    }

    if let Some(session) = req.cookie(SESSION_COOKIE) {
        state.csrf.end_session(session.value()).await;
    }

    let mut response = HttpResponse::Ok().json(serde_json::json!({ "message": "Logged out" }));
    state.cookies.clear_token_cookies(&mut response);
    if let Err(e) = response.add_cookie(&state.cookies.removal(SESSION_COOKIE)) {
        log::error!("Failed to clear session cookie: {}", e);
    }
    Ok(response)
}

pub async fn me(user: AuthenticatedUser) -> HttpResponse {
    HttpResponse::Ok().json(user_body(UserProfile {
        id: user.id,
        email: user.email,
        role: user.role,
    }))
}

pub async fn csrf_token(token: CsrfToken) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "csrfToken": token.0 }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_validation() {
        let ok = RegisterRequest { email: "a@b.c".into(), password: "long-enough".into() };
        assert!(validate_registration(&ok).is_ok());

        let no_at = RegisterRequest { email: "nobody".into(), password: "long-enough".into() };
        assert_eq!(validate_registration(&no_at).unwrap_err().code(), ErrorCode::ValidationError);

        let short = RegisterRequest { email: "a@b.c".into(), password: "short".into() };
        assert_eq!(validate_registration(&short).unwrap_err().code(), ErrorCode::ValidationError);
    }
}
