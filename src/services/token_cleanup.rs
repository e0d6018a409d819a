use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use crate::services::token::TokenService;

/// Background job that deactivates expired refresh tokens on a fixed period.
pub fn start_token_cleanup_service(tokens: Arc<TokenService>, period: Duration) -> JoinHandle<()> {
    log::info!("Starting refresh token cleanup service (every {}s)", period.as_secs());

    tokio::spawn(async move {
        let mut interval = interval(period);

        loop {
            interval.tick().await;

            match tokens.cleanup_expired_tokens().await {
                Ok(0) => log::debug!("Token cleanup: nothing to deactivate"),
                Ok(n) => log::info!("Token cleanup: deactivated {} expired refresh token(s)", n),
                Err(e) => log::error!("Token cleanup failed: {}", e),
            }
        }
    })
}
