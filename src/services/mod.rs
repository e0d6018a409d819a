pub mod store;
pub mod token;
pub mod token_cleanup;

pub use store::{RefreshTokenStore, SqliteStore, UserStore};
pub use token::{TokenPair, TokenService};
pub use token_cleanup::start_token_cleanup_service;
