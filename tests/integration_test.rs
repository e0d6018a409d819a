use actix_web::{
    body::MessageBody,
    cookie::Cookie,
    dev::{Service, ServiceResponse},
    http::StatusCode,
    test, App,
};
use session_guard::services::{SqliteStore, UserStore};
use session_guard::{db, routes, AppState, Config};

const PASSWORD: &str = "correct horse battery";

fn test_config() -> Config {
    Config {
        jwt_secret: Some("integration-test-secret".to_string()),
        secure_cookies: false,
        bcrypt_cost: 4,
        ..Config::default()
    }
}

async fn setup(config: Config) -> (AppState, SqliteStore) {
    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    db::create_tables(&pool).await.unwrap();
    let store = SqliteStore::new(pool);
    (AppState::new(config, store.clone()), store)
}

fn cookie<B>(resp: &ServiceResponse<B>, name: &str) -> Option<Cookie<'static>> {
    resp.response()
        .cookies()
        .find(|c| c.name() == name)
        .map(|c| Cookie::new(name.to_string(), c.value().to_string()))
}

struct Session {
    session: Cookie<'static>,
    csrf: String,
}

async fn csrf_session<S, B>(app: &S) -> Session
where
    S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let resp = test::call_service(app, test::TestRequest::get().uri("/api/csrf-token").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let session = cookie(&resp, "session-id").unwrap();
    let body: serde_json::Value = test::read_body_json(resp).await;
    Session { session, csrf: body["csrfToken"].as_str().unwrap().to_string() }
}

fn post(uri: &str, session: &Session) -> test::TestRequest {
    test::TestRequest::post()
        .uri(uri)
        .cookie(session.session.clone())
        .insert_header(("X-CSRF-Token", session.csrf.clone()))
}

async fn create_user(store: &SqliteStore, email: &str, role: &str) {
    let hash = bcrypt::hash(PASSWORD, 4).unwrap();
    store.create(email, &hash, role).await.unwrap();
}

/// Log in and return the (auth-token, refresh-token) cookies.
async fn login<S, B>(app: &S, session: &Session, email: &str) -> (Cookie<'static>, Cookie<'static>)
where
    S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let req = post("/api/auth/login", session)
        .set_json(serde_json::json!({ "email": email, "password": PASSWORD }))
        .to_request();
    let resp = test::call_service(app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    (cookie(&resp, "auth-token").unwrap(), cookie(&resp, "refresh-token").unwrap())
}

#[actix_rt::test]
async fn test_health() {
    let (state, _) = setup(test_config()).await;
    let app = test::init_service(App::new().configure(|cfg| routes::configure(cfg, &state))).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_rt::test]
async fn test_register_then_login_and_me() {
    let (state, _) = setup(test_config()).await;
    let app = test::init_service(App::new().configure(|cfg| routes::configure(cfg, &state))).await;
    let session = csrf_session(&app).await;

    let req = post("/api/auth/register", &session)
        .set_json(serde_json::json!({ "email": "New@Example.com", "password": PASSWORD }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["user"]["email"], "new@example.com");
    assert_eq!(body["user"]["role"], "user");
    assert!(body["user"].get("password_hash").is_none());

    let req = post("/api/auth/register", &session)
        .set_json(serde_json::json!({ "email": "short@example.com", "password": "short" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (access, _) = login(&app, &session, "new@example.com").await;

    let req = test::TestRequest::get().uri("/api/auth/me").cookie(access).to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["user"]["email"], "new@example.com");

    let req = test::TestRequest::get().uri("/api/auth/me").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "TOKEN_MISSING");
}

#[actix_rt::test]
async fn test_login_rejections() {
    let (state, store) = setup(test_config()).await;
    create_user(&store, "dormant@example.com", "user").await;
    sqlx::query("UPDATE users SET is_active = FALSE WHERE email = ?")
        .bind("dormant@example.com")
        .execute(store.pool())
        .await
        .unwrap();

    let app = test::init_service(App::new().configure(|cfg| routes::configure(cfg, &state))).await;
    let session = csrf_session(&app).await;

    let req = post("/api/auth/login", &session)
        .set_json(serde_json::json!({ "email": "nobody@example.com", "password": PASSWORD }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "USER_INVALID");

    let req = post("/api/auth/login", &session)
        .set_json(serde_json::json!({ "email": "dormant@example.com", "password": PASSWORD }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ACCOUNT_INACTIVE");
}

#[actix_rt::test]
async fn test_refresh_token_reuse_locks_out_family() {
    let (state, store) = setup(test_config()).await;
    create_user(&store, "victim@example.com", "user").await;
    let app = test::init_service(App::new().configure(|cfg| routes::configure(cfg, &state))).await;
    let session = csrf_session(&app).await;

    let (_, first) = login(&app, &session, "victim@example.com").await;

    let resp = test::call_service(&app, post("/api/auth/refresh", &session).cookie(first.clone()).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let second = cookie(&resp, "refresh-token").unwrap();
    assert_ne!(first.value(), second.value());

    // Replaying the spent token is reuse
    let resp = test::call_service(&app, post("/api/auth/refresh", &session).cookie(first).to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "TOKEN_REUSED");

    // ...and it took the legitimate newest token down with it
    let resp = test::call_service(&app, post("/api/auth/refresh", &session).cookie(second).to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "TOKEN_REUSED");

    let resp = test::call_service(&app, post("/api/auth/refresh", &session).to_request()).await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "TOKEN_MISSING");
}

#[actix_rt::test]
async fn test_admin_routes_require_csrf_and_role() {
    let (state, store) = setup(test_config()).await;
    create_user(&store, "root@example.com", "admin").await;
    create_user(&store, "plain@example.com", "user").await;
    let app = test::init_service(App::new().configure(|cfg| routes::configure(cfg, &state))).await;
    let session = csrf_session(&app).await;

    let (admin_access, _) = login(&app, &session, "root@example.com").await;
    let (user_access, _) = login(&app, &session, "plain@example.com").await;

    // A valid auth cookie alone does not pass the CSRF check
    let req = test::TestRequest::post()
        .uri("/api/admin/tokens/cleanup")
        .cookie(session.session.clone())
        .cookie(admin_access.clone())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "CSRF_TOKEN_MISSING");

    let req = post("/api/admin/tokens/cleanup", &session).cookie(user_access).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "INSUFFICIENT_ROLE");

    let req = post("/api/admin/tokens/cleanup", &session).cookie(admin_access.clone()).to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["deactivated"], 0);

    let plain = store.find_by_email("plain@example.com").await.unwrap().unwrap();
    let req = post(&format!("/api/admin/users/{}/revoke-tokens", plain.id), &session)
        .cookie(admin_access)
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["revoked"], 1);
}

#[actix_rt::test]
async fn test_logout_revokes_family() {
    let (state, store) = setup(test_config()).await;
    create_user(&store, "leaving@example.com", "user").await;
    let app = test::init_service(App::new().configure(|cfg| routes::configure(cfg, &state))).await;
    let session = csrf_session(&app).await;

    let (access, refresh) = login(&app, &session, "leaving@example.com").await;

    let req = post("/api/auth/logout", &session)
        .cookie(access)
        .cookie(refresh.clone())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(cookie(&resp, "auth-token").unwrap().value(), "");

    // The CSRF session ended too, so a fresh one is needed
    let session = csrf_session(&app).await;
    let resp = test::call_service(&app, post("/api/auth/refresh", &session).cookie(refresh).to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_rt::test]
async fn test_auto_refresh_rotates_once_per_request() {
    // A one-minute access token is always inside the five-minute threshold
    let config = Config { access_token_ttl_minutes: 1, ..test_config() };
    let (state, store) = setup(config).await;
    create_user(&store, "busy@example.com", "user").await;
    let app = test::init_service(App::new().configure(|cfg| routes::configure(cfg, &state))).await;
    let session = csrf_session(&app).await;

    let (access, first) = login(&app, &session, "busy@example.com").await;

    let req = test::TestRequest::get()
        .uri("/api/auth/me")
        .cookie(access.clone())
        .cookie(first.clone())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let access = cookie(&resp, "auth-token").unwrap();
    let second = cookie(&resp, "refresh-token").unwrap();
    assert_ne!(first.value(), second.value());

    // Explicit refresh alongside a near-expiry access token rotates exactly once
    let req = post("/api/auth/refresh", &session).cookie(access).cookie(second).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let third = cookie(&resp, "refresh-token").unwrap();

    let resp = test::call_service(&app, post("/api/auth/refresh", &session).cookie(third).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_rt::test]
async fn test_login_rate_limit() {
    let (state, store) = setup(test_config()).await;
    create_user(&store, "target@example.com", "user").await;
    let app = test::init_service(App::new().configure(|cfg| routes::configure(cfg, &state))).await;
    let session = csrf_session(&app).await;

    for _ in 0..5 {
        let req = post("/api/auth/login", &session)
            .set_json(serde_json::json!({ "email": "target@example.com", "password": "wrong password" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key("x-ratelimit-remaining"));
    }

    let req = post("/api/auth/login", &session)
        .set_json(serde_json::json!({ "email": "target@example.com", "password": PASSWORD }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "0");
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");

    // Other endpoints are on the general limiter
    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/csrf-token").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_rt::test]
async fn test_login_rate_limit_ignores_spoofed_forwarded_for() {
    let (state, store) = setup(test_config()).await;
    create_user(&store, "spoofed@example.com", "user").await;
    let app = test::init_service(App::new().configure(|cfg| routes::configure(cfg, &state))).await;
    let session = csrf_session(&app).await;

    let mut statuses = Vec::new();
    for i in 0..20 {
        let req = post("/api/auth/login", &session)
            .peer_addr("198.51.100.20:52000".parse().unwrap())
            .insert_header(("X-Forwarded-For", format!("10.0.0.{}", i)))
            .set_json(serde_json::json!({ "email": "spoofed@example.com", "password": "wrong password" }))
            .to_request();
        statuses.push(test::call_service(&app, req).await.status());
    }

    assert!(statuses[..5].iter().all(|s| *s == StatusCode::UNAUTHORIZED));
    assert!(statuses[5..].iter().all(|s| *s == StatusCode::TOO_MANY_REQUESTS));
}
