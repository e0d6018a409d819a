use actix_cors::Cors;
use actix_web::{http::header, middleware::Logger, App, HttpServer};
use session_guard::{db, routes, AppState, Config};
use std::io;

fn startup_error(context: &str, e: impl std::fmt::Display) -> io::Error {
    log::error!("{}: {}", context, e);
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", context, e))
}

fn cors_for(config: &Config) -> Cors {
    let cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
        .allowed_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION])
        .allowed_header("X-CSRF-Token")
        .expose_headers(vec!["X-RateLimit-Limit", "X-RateLimit-Remaining", "X-RateLimit-Reset"])
        .supports_credentials()
        .max_age(3600);

    match &config.cors_origin {
        Some(origin) => cors.allowed_origin(origin),
        None => cors,
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env();
    if config.jwt_secret.is_none() {
        log::warn!("JWT_SECRET is not set; login and refresh will fail until it is configured");
    }

    let pool = db::create_pool(&config.database_url)
        .await
        .map_err(|e| startup_error("Failed to create database pool", e))?;
    db::create_tables(&pool)
        .await
        .map_err(|e| startup_error("Failed to create tables", e))?;

    let bind = (config.server_host.clone(), config.server_port);
    let state = AppState::new(config, session_guard::services::SqliteStore::new(pool));
    let cleanup_job = state.start_background_jobs();

    log::info!("Server starting on http://{}:{}", bind.0, bind.1);

    let app_state = state.clone();
    let result = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(cors_for(&app_state.config))
            .configure(|cfg| routes::configure(cfg, &app_state))
    })
    .bind(bind)?
    .run()
    .await;

    log::info!("Server stopped, shutting down background jobs");
    cleanup_job.abort();
    state.shutdown().await;

    result
}
