use actix_web::{web, HttpResponse};
use uuid::Uuid;

use crate::error::Result;
use crate::middleware::AuthenticatedUser;
use crate::routes::AppState;

/// Revoke every refresh token held by a user, forcing them to log in again.
pub async fn revoke_user_tokens(
    state: web::Data<AppState>,
    admin: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    let revoked = state.tokens.revoke_all_user_tokens(user_id).await?;

    log::info!("Admin {} revoked {} refresh token(s) of user {}", admin.id, revoked, user_id);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "revoked": revoked })))
}

pub async fn cleanup_tokens(state: web::Data<AppState>, admin: AuthenticatedUser) -> Result<HttpResponse> {
    let deactivated = state.tokens.cleanup_expired_tokens().await?;

    log::info!("Admin {} ran token cleanup, {} deactivated", admin.id, deactivated);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "deactivated": deactivated })))
}
