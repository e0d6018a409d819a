//! Error boundary for availability-first middleware paths.
//!
//! Rate-limit key generation and opportunistic token refresh must never fail
//! a request: both errors and panics are logged here and turned into `None`.
//! Authentication and CSRF checks do not go through this module.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use futures::FutureExt;

use crate::error::Result;

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Run `f`, logging and swallowing any error or panic.
pub fn guard<T>(component: &str, f: impl FnOnce() -> Result<T>) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log::error!("{} failed, allowing request: {}", component, e);
            None
        }
        Err(payload) => {
            log::error!("{} panicked, allowing request: {}", component, panic_message(payload.as_ref()));
            None
        }
    }
}

/// Async counterpart of [`guard`].
pub async fn guard_async<T, F>(component: &str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log::warn!("{} failed, continuing: {}", component, e);
            None
        }
        Err(payload) => {
            log::error!("{} panicked, continuing: {}", component, panic_message(payload.as_ref()));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_guard_passes_values_through() {
        assert_eq!(guard("test", || Ok(7)), Some(7));
    }

    #[test]
    fn test_guard_swallows_errors_and_panics() {
        let failed: Option<u32> = guard("test", || Err(AppError::Internal("boom".into())));
        assert!(failed.is_none());

        let panicked: Option<u32> = guard("test", || panic!("key generator exploded"));
        assert!(panicked.is_none());
    }

    #[actix_rt::test]
    async fn test_guard_async() {
        assert_eq!(guard_async("test", async { Ok(1) }).await, Some(1));

        let failed: Option<u32> = guard_async("test", async { Err(AppError::Internal("boom".into())) }).await;
        assert!(failed.is_none());
    }
}
