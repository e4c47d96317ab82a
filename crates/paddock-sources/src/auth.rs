//! OAuth password-grant token acquisition with caching.
//!
//! A token is reused until five minutes before it expires. Rejected
//! credentials are remembered: once the token endpoint has said no, every
//! later call fails fast without another request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use oauth2::basic::{BasicClient, BasicErrorResponseType, BasicTokenResponse};
use oauth2::{
    ClientId, EndpointNotSet, EndpointSet, RequestTokenError, ResourceOwnerPassword,
    ResourceOwnerUsername, TokenResponse, TokenUrl,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Renew this long before the upstream expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Used when the token response carries no `expires_in`.
const DEFAULT_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// Client id sent with the password grant. The endpoint does not check it.
const CLIENT_ID: &str = "paddock";

type PasswordClient = BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Errors that can occur while obtaining a token.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// The token endpoint refused the credentials.
    #[error("credentials rejected: {0}")]
    Rejected(String),

    /// The configured token URL is not a URL.
    #[error("invalid token url: {0}")]
    InvalidUrl(String),

    /// The request failed before an answer arrived, or the server erred.
    #[error("token request failed: {0}")]
    Request(String),

    /// The answer had no usable token.
    #[error("malformed token response: {0}")]
    Malformed(String),
}

impl AuthError {
    /// `true` when retrying with the same credentials cannot help.
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::InvalidUrl(_))
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    renew_at: Instant,
}

/// Caching password-grant token client.
#[derive(Debug)]
pub struct TokenProvider {
    client: reqwest::Client,
    token_url: String,
    username: String,
    password: String,
    cached: Mutex<Option<CachedToken>>,
    rejected: AtomicBool,
}

impl TokenProvider {
    /// Create a provider for one set of credentials.
    pub fn new(client: reqwest::Client, token_url: String, username: String, password: String) -> Self {
        Self {
            client,
            token_url,
            username,
            password,
            cached: Mutex::new(None),
            rejected: AtomicBool::new(false),
        }
    }

    /// The cached token, fetching a new one when absent or close to expiry.
    pub async fn token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.renew_at) {
            return Ok(token.value.clone());
        }
        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Drop the cached token and fetch a new one.
    pub async fn refresh(&self) -> Result<String, AuthError> {
        self.invalidate().await;
        self.token().await
    }

    /// Forget the cached token.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    /// Username the token was issued for (MQTT wants it alongside the token).
    pub fn username(&self) -> &str {
        &self.username
    }

    fn oauth_client(&self) -> Result<PasswordClient, AuthError> {
        let token_url =
            TokenUrl::new(self.token_url.clone()).map_err(|e| AuthError::InvalidUrl(e.to_string()))?;
        Ok(BasicClient::new(ClientId::new(CLIENT_ID.to_owned())).set_token_uri(token_url))
    }

    async fn fetch(&self) -> Result<CachedToken, AuthError> {
        if self.rejected.load(Ordering::Acquire) {
            return Err(AuthError::Rejected("rejected earlier".to_owned()));
        }
        let oauth = self.oauth_client()?;
        debug!(url = %self.token_url, "requesting access token");

        let username = ResourceOwnerUsername::new(self.username.clone());
        let password = ResourceOwnerPassword::new(self.password.clone());
        let response: BasicTokenResponse = oauth
            .exchange_password(&username, &password)
            .request_async(&self.client)
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(body) if is_rejection(body.error()) => {
                    let code: &str = body.error().as_ref();
                    warn!(error = code, "token endpoint rejected credentials");
                    self.rejected.store(true, Ordering::Release);
                    AuthError::Rejected(code.to_owned())
                }
                RequestTokenError::ServerResponse(body) => {
                    let code: &str = body.error().as_ref();
                    AuthError::Request(code.to_owned())
                }
                RequestTokenError::Request(e) => AuthError::Request(e.to_string()),
                RequestTokenError::Parse(e, _) => AuthError::Malformed(e.to_string()),
                RequestTokenError::Other(e) => AuthError::Request(e),
            })?;

        let value = response.access_token().secret().clone();
        if value.is_empty() {
            return Err(AuthError::Malformed("empty access_token".to_owned()));
        }

        let lifetime = response.expires_in().unwrap_or(DEFAULT_LIFETIME);
        let renew_in = lifetime.saturating_sub(REFRESH_MARGIN);
        info!(expires_in_secs = lifetime.as_secs(), "access token acquired");
        Ok(CachedToken {
            value,
            renew_at: Instant::now()
                .checked_add(renew_in)
                .unwrap_or_else(Instant::now),
        })
    }
}

const fn is_rejection(error: &BasicErrorResponseType) -> bool {
    matches!(
        error,
        BasicErrorResponseType::InvalidGrant
            | BasicErrorResponseType::InvalidClient
            | BasicErrorResponseType::UnauthorizedClient
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use serde_json::json;

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}/token")
    }

    #[tokio::test]
    async fn token_is_cached_until_refresh() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new().route(
            "/token",
            post(move || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    axum::Json(json!({
                        "access_token": format!("tok-{n}"),
                        "token_type": "bearer",
                        "expires_in": 3600
                    }))
                }
            }),
        );
        let url = serve(router).await;
        let provider = TokenProvider::new(reqwest::Client::new(), url, "fan".into(), "pw".into());

        assert_eq!(provider.token().await.unwrap(), "tok-0");
        assert_eq!(provider.token().await.unwrap(), "tok-0");
        assert_eq!(provider.refresh().await.unwrap(), "tok-1");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejection_is_permanent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new().route(
            "/token",
            post(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::BAD_REQUEST,
                        axum::Json(json!({"error": "invalid_grant", "error_description": "bad password"})),
                    )
                }
            }),
        );
        let url = serve(router).await;
        let provider = TokenProvider::new(reqwest::Client::new(), url, "fan".into(), "bad".into());

        let err = provider.token().await.unwrap_err();
        assert!(err.is_permanent());
        assert!(provider.refresh().await.unwrap_err().is_permanent());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
