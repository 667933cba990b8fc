//! Platform client shared machinery: error model, token refresh, and
//! the retry-once-on-401 policy.
//!
//! Authentication refresh is a cross-cutting concern implemented here
//! exactly once; drivers wrap every platform call in
//! [`with_auth_retry`] instead of reimplementing it.

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;

/// Coarse classification of a platform client failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorKind {
    /// 401 — the access token expired or was rejected.
    Unauthorized,
    /// 404 — the referenced object does not exist on the platform.
    NotFound,
    /// Other 4xx — the platform rejected the request itself.
    BadRequest,
    /// 5xx, connection failure, timeout.
    Unavailable,
    Other,
}

/// A failure reported by (or while reaching) an external platform.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PlatformError {
    pub kind: PlatformErrorKind,
    pub message: String,
}

impl PlatformError {
    pub fn new(kind: PlatformErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorKind::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorKind::BadRequest, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(PlatformErrorKind::Unavailable, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == PlatformErrorKind::NotFound
    }
}

/// Source of platform access tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// The current access token.
    async fn access_token(&self) -> Result<String, PlatformError>;

    /// Force-refresh after a rejection and return the new token.
    async fn refresh(&self) -> Result<String, PlatformError>;
}

/// Token source for platforms without authentication, or with a fixed
/// bearer token from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, PlatformError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String, PlatformError> {
        // Nothing to refresh; a second rejection will end the attempt.
        Ok(self.0.clone())
    }
}

/// Run a platform call, refreshing the token and retrying exactly once
/// when the platform answers Unauthorized.
pub async fn with_auth_retry<T, F, Fut>(
    tokens: &dyn TokenSource,
    mut call: F,
) -> Result<T, PlatformError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    let token = tokens.access_token().await?;
    match call(token).await {
        Err(err) if err.kind == PlatformErrorKind::Unauthorized => {
            let refreshed = tokens.refresh().await?;
            call(refreshed).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingTokens {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl TokenSource for CountingTokens {
        async fn access_token(&self) -> Result<String, PlatformError> {
            Ok("stale".to_string())
        }

        async fn refresh(&self) -> Result<String, PlatformError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok("fresh".to_string())
        }
    }

    #[tokio::test]
    async fn retries_once_on_unauthorized() {
        let tokens = CountingTokens {
            refreshes: AtomicU32::new(0),
        };
        let calls = AtomicU32::new(0);

        let result = with_auth_retry(&tokens, |token| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if token == "stale" {
                    Err(PlatformError::unauthorized("token expired"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn does_not_retry_other_errors() {
        let tokens = CountingTokens {
            refreshes: AtomicU32::new(0),
        };
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = with_auth_retry(&tokens, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PlatformError::unavailable("connection refused")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_rejection_surfaces() {
        let tokens = CountingTokens {
            refreshes: AtomicU32::new(0),
        };

        let result: Result<u32, _> = with_auth_retry(&tokens, |_| async {
            Err(PlatformError::unauthorized("still rejected"))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, PlatformErrorKind::Unauthorized);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }
}
