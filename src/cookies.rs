use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::HttpResponse;

use crate::services::token::TokenPair;

pub const ACCESS_COOKIE: &str = "auth-token";
pub const REFRESH_COOKIE: &str = "refresh-token";
pub const SESSION_COOKIE: &str = "session-id";

/// Attributes shared by every cookie this service sets: httpOnly, sameSite=strict, path=/.
#[derive(Debug, Clone, Copy)]
pub struct CookieSettings {
    pub secure: bool,
}

impl CookieSettings {
    pub fn new(secure: bool) -> Self {
        Self { secure }
    }

    pub fn build(&self, name: &'static str, value: String, max_age_secs: i64) -> Cookie<'static> {
        Cookie::build(name, value)
            .http_only(true)
            .same_site(SameSite::Strict)
            .path("/")
            .secure(self.secure)
            .max_age(CookieDuration::seconds(max_age_secs.max(0)))
            .finish()
    }

    /// An expired, empty cookie that makes the browser drop `name`.
    pub fn removal(&self, name: &'static str) -> Cookie<'static> {
        self.build(name, String::new(), 0)
    }

    pub fn token_cookies(&self, tokens: &TokenPair) -> [Cookie<'static>; 2] {
        let now = chrono::Utc::now();
        [
            self.build(
                ACCESS_COOKIE,
                tokens.access_token.clone(),
                (tokens.access_expires_at - now).num_seconds(),
            ),
            self.build(
                REFRESH_COOKIE,
                tokens.refresh_token.clone(),
                (tokens.refresh_expires_at - now).num_seconds(),
            ),
        ]
    }

    /// Attach both token cookies to an already built response.
    pub fn set_token_cookies(&self, response: &mut HttpResponse, tokens: &TokenPair) {
        for cookie in self.token_cookies(tokens) {
            if let Err(e) = response.add_cookie(&cookie) {
                log::error!("Failed to set {} cookie: {}", cookie.name(), e);
            }
        }
    }

    pub fn clear_token_cookies(&self, response: &mut HttpResponse) {
        for name in [ACCESS_COOKIE, REFRESH_COOKIE] {
            if let Err(e) = response.add_cookie(&self.removal(name)) {
                log::error!("Failed to clear {} cookie: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_attributes() {
        let cookie = CookieSettings::new(true).build(ACCESS_COOKIE, "value".into(), 900);
        assert_eq!(cookie.name(), "auth-token");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.max_age(), Some(CookieDuration::seconds(900)));
    }

    #[test]
    fn test_removal_cookie_expires_immediately() {
        let cookie = CookieSettings::new(false).removal(REFRESH_COOKIE);
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(CookieDuration::ZERO));
    }
}
