use actix_web::{
    body::EitherBody,
    dev::{self, forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::Method,
    web, Error, HttpMessage,
};
use base64::{engine::general_purpose, Engine as _};
use futures::future::LocalBoxFuture;
use rand::RngCore;
use std::collections::HashMap;
use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cookies::{CookieSettings, SESSION_COOKIE};
use crate::error::{AppError, ErrorCode, Result as AppResult};

pub const CSRF_HEADER: &str = "X-CSRF-Token";
pub const CSRF_BODY_FIELD: &str = "_csrf";

/// The CSRF token bound to the caller's session, available to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken(pub String);

struct SessionEntry {
    token: String,
    expires_at: Instant,
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Server-side store of per-session CSRF tokens.
///
/// The token is random and held only here, so it cannot be derived from any
/// cookie the browser would send automatically.
pub struct CsrfGuard {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    ttl: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CsrfGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            sweeper: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn new_session_id() -> String {
        random_token()
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        self.stored_token(session_id).await.is_some()
    }

    /// The session's token, generated on first use. Stable for the session's lifetime.
    pub async fn token_for_session(&self, session_id: &str) -> String {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;

        match sessions.get(session_id) {
            Some(entry) if entry.expires_at > now => entry.token.clone(),
            _ => {
                let token = random_token();
                sessions.insert(
                    session_id.to_string(),
                    SessionEntry { token: token.clone(), expires_at: now + self.ttl },
                );
                token
            }
        }
    }

    async fn stored_token(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.token.clone())
    }

    /// Double-submit check of a presented token against the session's token.
    pub async fn validate(&self, session_id: Option<&str>, presented: Option<&str>) -> AppResult<()> {
        let presented = match presented {
            Some(token) if !token.is_empty() => token,
            _ => return Err(AppError::Forbidden(ErrorCode::CsrfTokenMissing)),
        };

        let expected = match session_id {
            Some(id) => self.stored_token(id).await,
            None => None,
        };
        let Some(expected) = expected else {
            return Err(AppError::Forbidden(ErrorCode::CsrfTokenInvalid));
        };

        if presented.len() != expected.len() {
            return Err(AppError::Forbidden(ErrorCode::CsrfTokenLengthMismatch));
        }

        if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(AppError::Forbidden(ErrorCode::CsrfTokenInvalid))
        }
    }

    pub async fn end_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn cleanup_old_tokens(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        before - sessions.len()
    }

    pub fn start_sweeper(self: &Arc<Self>, period: Duration) {
        let guard: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(live) = guard.upgrade() else { break };
                let removed = live.cleanup_old_tokens().await;
                if removed > 0 {
                    log::debug!("Dropped {} expired CSRF sessions", removed);
                }
            }
        });

        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(previous) = sweeper.replace(handle) {
                previous.abort();
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
        self.sessions.write().await.clear();
    }
}

impl Drop for CsrfGuard {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn bytes_to_payload(buf: web::Bytes) -> dev::Payload {
    let (_, mut pl) = actix_http::h1::Payload::create(true);
    pl.unread_data(buf);
    dev::Payload::from(pl)
}

/// Read `_csrf` from a JSON or urlencoded body, putting the body back for the handler.
async fn body_token(req: &mut ServiceRequest) -> Option<String> {
    let content_type = req.content_type().to_ascii_lowercase();
    let is_json = content_type.ends_with("json");
    let is_form = content_type == "application/x-www-form-urlencoded";
    if !is_json && !is_form {
        return None;
    }

    let bytes = req.extract::<web::Bytes>().await.ok()?;
    req.set_payload(bytes_to_payload(bytes.clone()));

    if is_json {
        let body: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        body.get(CSRF_BODY_FIELD)?.as_str().map(str::to_string)
    } else {
        let fields: HashMap<String, String> = serde_urlencoded::from_bytes(&bytes).ok()?;
        fields.get(CSRF_BODY_FIELD).cloned()
    }
}

async fn presented_token(req: &mut ServiceRequest) -> Option<String> {
    let header = req
        .headers()
        .get(CSRF_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    match header {
        Some(token) => Some(token),
        None => body_token(req).await,
    }
}

/// CSRF middleware. Every state-changing request must echo the session's
/// token; there are no exempt routes.
pub struct CsrfProtection {
    guard: Arc<CsrfGuard>,
    cookies: CookieSettings,
}

impl CsrfProtection {
    pub fn new(guard: Arc<CsrfGuard>, cookies: CookieSettings) -> Self {
        Self { guard, cookies }
    }
}

impl<S, B> Transform<S, ServiceRequest> for CsrfProtection
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = CsrfMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(CsrfMiddleware {
            service: Rc::new(service),
            guard: Arc::clone(&self.guard),
            cookies: self.cookies,
        }))
    }
}

pub struct CsrfMiddleware<S> {
    service: Rc<S>,
    guard: Arc<CsrfGuard>,
    cookies: CookieSettings,
}

impl<S, B> Service<ServiceRequest> for CsrfMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let guard = Arc::clone(&self.guard);
        let cookies = self.cookies;

        Box::pin(async move {
            let mut existing = req.cookie(SESSION_COOKIE).map(|c| c.value().to_string());
            if let Some(id) = &existing {
                if !guard.has_session(id).await {
                    existing = None;
                }
            }

            if !is_safe_method(req.method()) {
                let presented = presented_token(&mut req).await;
                if let Err(e) = guard.validate(existing.as_deref(), presented.as_deref()).await {
                    log::warn!("CSRF check failed for {} {}: {}", req.method(), req.path(), e.code());
                    return Ok(req.error_response(e).map_into_right_body());
                }
            }

            let is_new = existing.is_none();
            let session_id = existing.unwrap_or_else(CsrfGuard::new_session_id);
            let token = guard.token_for_session(&session_id).await;
            req.extensions_mut().insert(CsrfToken(token));

            let mut res = service.call(req).await?;

            if is_new {
                let max_age = guard.ttl().as_secs() as i64;
                let cookie = cookies.build(SESSION_COOKIE, session_id, max_age);
                if let Err(e) = res.response_mut().add_cookie(&cookie) {
                    log::error!("Failed to set session cookie: {}", e);
                }
            }

            Ok(res.map_into_left_body())
        })
    }
}

// Extractor for the session CSRF token
impl actix_web::FromRequest for CsrfToken {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &actix_web::HttpRequest, _: &mut dev::Payload) -> Self::Future {
        match req.extensions().get::<CsrfToken>() {
            Some(token) => ready(Ok(token.clone())),
            None => ready(Err(AppError::Internal("CSRF middleware not installed".into()).into())),
        }
    }
}
