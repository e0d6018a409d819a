use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    /// HMAC signing secret for access tokens. Never defaulted.
    pub jwt_secret: Option<String>,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_days: i64,
    pub auto_refresh_threshold_secs: i64,
    pub server_host: String,
    pub server_port: u16,
    pub secure_cookies: bool,
    pub cors_origin: Option<String>,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,
    pub auth_rate_limit_window_ms: u64,
    pub auth_rate_limit_max_requests: u32,
    pub rate_limit_sweep_secs: u64,
    pub session_ttl_secs: u64,
    pub token_cleanup_interval_secs: u64,
    pub bcrypt_cost: u32,
    /// Take the client IP from `Forwarded` / `X-Forwarded-For`. Only safe behind a proxy that sets them.
    pub trust_proxy_headers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:session_guard.db?mode=rwc".to_string(),
            jwt_secret: None,
            access_token_ttl_minutes: 15,
            refresh_token_ttl_days: 7,
            auto_refresh_threshold_secs: 300, // 5 minutes
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            secure_cookies: true,
            cors_origin: None,
            rate_limit_window_ms: 15 * 60 * 1000,
            rate_limit_max_requests: 100,
            auth_rate_limit_window_ms: 15 * 60 * 1000,
            auth_rate_limit_max_requests: 5,
            rate_limit_sweep_secs: 60,
            session_ttl_secs: 86400, // 24 hours
            token_cleanup_interval_secs: 3600,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            trust_proxy_headers: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if !secret.trim().is_empty() {
                config.jwt_secret = Some(secret);
            }
        }

        if let Ok(host) = std::env::var("SERVER_HOST") {
            config.server_host = host;
        }

        if let Ok(origin) = std::env::var("CORS_ORIGIN") {
            config.cors_origin = Some(origin);
        }

        override_parsed("ACCESS_TOKEN_TTL_MINUTES", &mut config.access_token_ttl_minutes);
        override_parsed("REFRESH_TOKEN_TTL_DAYS", &mut config.refresh_token_ttl_days);
        override_parsed("AUTO_REFRESH_THRESHOLD_SECS", &mut config.auto_refresh_threshold_secs);
        override_parsed("SERVER_PORT", &mut config.server_port);
        override_parsed("SECURE_COOKIES", &mut config.secure_cookies);
        override_parsed("RATE_LIMIT_WINDOW_MS", &mut config.rate_limit_window_ms);
        override_parsed("RATE_LIMIT_MAX_REQUESTS", &mut config.rate_limit_max_requests);
        override_parsed("AUTH_RATE_LIMIT_WINDOW_MS", &mut config.auth_rate_limit_window_ms);
        override_parsed("AUTH_RATE_LIMIT_MAX_REQUESTS", &mut config.auth_rate_limit_max_requests);
        override_parsed("RATE_LIMIT_SWEEP_SECS", &mut config.rate_limit_sweep_secs);
        override_parsed("SESSION_TTL_SECS", &mut config.session_ttl_secs);
        override_parsed("TOKEN_CLEANUP_INTERVAL_SECS", &mut config.token_cleanup_interval_secs);
        override_parsed("BCRYPT_COST", &mut config.bcrypt_cost);
        override_parsed("TRUST_PROXY_HEADERS", &mut config.trust_proxy_headers);

        // tokio intervals panic on a zero period
        config.rate_limit_sweep_secs = config.rate_limit_sweep_secs.max(1);
        config.token_cleanup_interval_secs = config.token_cleanup_interval_secs.max(1);

        config
    }
}

fn override_parsed<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => log::warn!("Ignoring unparseable value for {}", key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_have_no_signing_secret() {
        let config = Config::default();
        assert!(config.jwt_secret.is_none());
        assert_eq!(config.access_token_ttl_minutes, 15);
        assert_eq!(config.auto_refresh_threshold_secs, 300);
        assert!(config.secure_cookies);
    }

    #[test]
    fn test_zero_periods_are_clamped() {
        std::env::set_var("RATE_LIMIT_SWEEP_SECS", "0");
        std::env::set_var("TOKEN_CLEANUP_INTERVAL_SECS", "0");
        let config = Config::from_env();
        std::env::remove_var("RATE_LIMIT_SWEEP_SECS");
        std::env::remove_var("TOKEN_CLEANUP_INTERVAL_SECS");

        assert_eq!(config.rate_limit_sweep_secs, 1);
        assert_eq!(config.token_cleanup_interval_secs, 1);
        assert!(!config.trust_proxy_headers);
    }
}
