use actix_web::{web, HttpResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::cookies::CookieSettings;
use crate::handlers::{admin, auth};
use crate::middleware::rate_limit::user_key;
use crate::middleware::{
    Authenticate, AutoRefresh, CsrfGuard, CsrfProtection, RateLimit, RateLimitOptions, RateLimitStore, RequireRole,
};
use crate::models::ROLE_ADMIN;
use crate::services::{start_token_cleanup_service, SqliteStore, TokenService};

/// Everything the handlers and middleware share across workers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub tokens: Arc<TokenService>,
    pub csrf: Arc<CsrfGuard>,
    pub rate_limits: Arc<RateLimitStore>,
    pub auth_rate_limits: Arc<RateLimitStore>,
    pub cookies: CookieSettings,
}

impl AppState {
    pub fn new(config: Config, store: SqliteStore) -> Self {
        let tokens = TokenService::new(&config, Arc::new(store.clone()), Arc::new(store));

        Self {
            cookies: CookieSettings::new(config.secure_cookies),
            csrf: Arc::new(CsrfGuard::new(Duration::from_secs(config.session_ttl_secs))),
            rate_limits: Arc::new(RateLimitStore::new()),
            auth_rate_limits: Arc::new(RateLimitStore::new()),
            tokens: Arc::new(tokens),
            config: Arc::new(config),
        }
    }

    /// Start the sweepers and the expired-token cleanup job.
    pub fn start_background_jobs(&self) -> JoinHandle<()> {
        let sweep = Duration::from_secs(self.config.rate_limit_sweep_secs.max(1));
        self.rate_limits.start_sweeper(sweep);
        self.auth_rate_limits.start_sweeper(sweep);
        self.csrf.start_sweeper(sweep);

        start_token_cleanup_service(
            Arc::clone(&self.tokens),
            Duration::from_secs(self.config.token_cleanup_interval_secs.max(1)),
        )
    }

    pub async fn shutdown(&self) {
        self.rate_limits.shutdown().await;
        self.auth_rate_limits.shutdown().await;
        self.csrf.shutdown().await;
    }
}

pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "session-guard",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Register routes and the security middleware stack.
///
/// Outer to inner: RateLimit, CsrfProtection, AutoRefresh, then per-scope
/// Authenticate / RequireRole. CORS and request logging wrap the whole app.
pub fn configure(cfg: &mut web::ServiceConfig, state: &AppState) {
    let config = &state.config;

    let trust_proxy = config.trust_proxy_headers;
    let general_limit = RateLimitOptions::new(config.rate_limit_max_requests, config.rate_limit_window_ms)
        .trust_proxy_headers(trust_proxy);
    let login_limit = RateLimitOptions::new(config.auth_rate_limit_max_requests, config.auth_rate_limit_window_ms)
        .trust_proxy_headers(trust_proxy);
    let admin_limit = RateLimitOptions::new(config.rate_limit_max_requests, config.rate_limit_window_ms)
        .key_generator(user_key(trust_proxy));

    cfg.app_data(web::Data::new(state.clone()))
        .route("/health", web::get().to(health_check))
        .service(
            web::scope("/api")
                .wrap(AutoRefresh::new(
                    Arc::clone(&state.tokens),
                    config.auto_refresh_threshold_secs,
                    state.cookies,
                ))
                .wrap(CsrfProtection::new(Arc::clone(&state.csrf), state.cookies))
                .wrap(RateLimit::new(Arc::clone(&state.rate_limits), general_limit))
                .route("/csrf-token", web::get().to(auth::csrf_token))
                .service(
                    web::scope("/auth")
                        .service(
                            web::resource("/login")
                                .wrap(RateLimit::new(Arc::clone(&state.auth_rate_limits), login_limit))
                                .route(web::post().to(auth::login)),
                        )
                        .route("/register", web::post().to(auth::register))
                        .route("/refresh", web::post().to(auth::refresh))
                        .service(
                            web::scope("")
                                .wrap(Authenticate::new(Arc::clone(&state.tokens)))
                                .route("/logout", web::post().to(auth::logout))
                                .route("/me", web::get().to(auth::me)),
                        ),
                )
                .service(
                    web::scope("/admin")
                        .wrap(RateLimit::new(Arc::clone(&state.rate_limits), admin_limit))
                        .wrap(RequireRole::new(&[ROLE_ADMIN]))
                        .wrap(Authenticate::new(Arc::clone(&state.tokens)))
                        .route("/users/{id}/revoke-tokens", web::post().to(admin::revoke_user_tokens))
                        .route("/tokens/cleanup", web::post().to(admin::cleanup_tokens)),
                ),
        );
}
