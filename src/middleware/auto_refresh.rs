//! Opportunistic rotation of access tokens that are about to expire.
//!
//! Runs on every request, never rejects one. When the `auth-token` cookie is
//! within the threshold of its expiry and a `refresh-token` cookie is present,
//! the pair is rotated and the new cookies ride on the response.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use chrono::{Duration, Utc};
use futures::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;

use crate::cookies::{CookieSettings, ACCESS_COOKIE, REFRESH_COOKIE};
use crate::middleware::fail_open;
use crate::models::UserProfile;
use crate::services::token::{TokenPair, TokenService};

/// Tokens minted by auto-refresh during this request.
#[derive(Debug, Clone)]
pub struct RefreshedSession {
    pub tokens: TokenPair,
    pub user: UserProfile,
}

pub struct AutoRefresh {
    tokens: Arc<TokenService>,
    threshold: Duration,
    cookies: CookieSettings,
}

impl AutoRefresh {
    pub fn new(tokens: Arc<TokenService>, threshold_secs: i64, cookies: CookieSettings) -> Self {
        Self {
            tokens,
            threshold: Duration::seconds(threshold_secs),
            cookies,
        }
    }
}

/// The refresh cookie, if the access cookie is close enough to expiry to rotate.
fn refresh_candidate(req: &ServiceRequest, tokens: &TokenService, threshold: Duration) -> Option<String> {
    let access = req.cookie(ACCESS_COOKIE)?;
    let refresh = req.cookie(REFRESH_COOKIE)?;
    if access.value().is_empty() || refresh.value().is_empty() {
        return None;
    }

    // Only tokens we signed are worth rotating for.
    let claims = match tokens.decode_access_token_allow_expired(access.value()) {
        Ok(claims) => claims,
        Err(e) => {
            log::debug!("Skipping auto-refresh, access token unusable: {}", e);
            return None;
        }
    };

    let remaining = claims.exp - Utc::now().timestamp();
    if remaining > threshold.num_seconds() {
        return None;
    }

    Some(refresh.value().to_string())
}

impl<S, B> Transform<S, ServiceRequest> for AutoRefresh
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = AutoRefreshMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AutoRefreshMiddleware {
            service: Rc::new(service),
            tokens: Arc::clone(&self.tokens),
            threshold: self.threshold,
            cookies: self.cookies,
        }))
    }
}

pub struct AutoRefreshMiddleware<S> {
    service: Rc<S>,
    tokens: Arc<TokenService>,
    threshold: Duration,
    cookies: CookieSettings,
}

impl<S, B> Service<ServiceRequest> for AutoRefreshMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let tokens = Arc::clone(&self.tokens);
        let threshold = self.threshold;
        let cookies = self.cookies;

        Box::pin(async move {
            let mut refreshed = None;

            if let Some(refresh_token) = refresh_candidate(&req, &tokens, threshold) {
                let rotation = tokens.refresh_access_token(Some(&refresh_token));
                if let Some(outcome) = fail_open::guard_async("Auto-refresh", rotation).await {
                    log::debug!("Auto-refreshed session for user {}", outcome.user.id);
                    req.extensions_mut().insert(RefreshedSession {
                        tokens: outcome.tokens.clone(),
                        user: UserProfile::from(&outcome.user),
                    });
                    refreshed = Some(outcome.tokens);
                }
            }

            let mut res = service.call(req).await?;

            if let Some(tokens) = refreshed {
                for cookie in cookies.token_cookies(&tokens) {
                    if let Err(e) = res.response_mut().add_cookie(&cookie) {
                        log::error!("Failed to attach refreshed {} cookie: {}", cookie.name(), e);
                    }
                }
            }

            Ok(res)
        })
    }
}
