pub mod config;
pub mod cookies;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

pub use config::Config;
pub use error::{AppError, ErrorCode, Result};
pub use routes::AppState;
