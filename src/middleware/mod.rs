pub mod auth;
pub mod auto_refresh;
pub mod csrf;
pub mod fail_open;
pub mod rate_limit;

pub use auth::{AuthenticatedUser, Authenticate, RequireRole};
pub use auto_refresh::{AutoRefresh, RefreshedSession};
pub use csrf::{CsrfGuard, CsrfProtection, CsrfToken};
pub use rate_limit::{RateLimit, RateLimitOptions, RateLimitStore};
