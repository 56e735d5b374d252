use log::warn;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::Token;
use crate::error::{CITraceError, Result};
use crate::ratelimit::RateLimiter;

const REQUEST_TIMEOUT_SECONDS: u64 = 30;
const NEXT_PAGE_HEADER: &str = "x-next-page";

/// Retry behaviour for transient API failures (429, 5xx, network errors).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// GitLab REST (v4) API client.
///
/// Every request attempt, retries included, waits on the shared rate limiter
/// first. All waits and requests abort once the shutdown token is cancelled.
pub struct GitLabClient {
    client: Client,
    api_url: Url,
    token: Option<Token>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl GitLabClient {
    /// Creates a client for one GitLab instance.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Instance URL (e.g., "https://gitlab.com"), with or without a trailing slash
    /// * `token` - Personal access token sent as a bearer token, if any
    /// * `limiter` - Rate limiter shared with every other client of the process
    ///
    /// # Returns
    ///
    /// Client using the default retry policy and a token that is never cancelled.
    ///
    /// # Errors
    ///
    /// Returns `CITraceError::Config` if the HTTP client cannot be built or the
    /// URL cannot be parsed.
    pub fn new(base_url: &str, token: Option<Token>, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("citrace/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| CITraceError::Config(format!("Failed to create HTTP client: {e}")))?;

        // Url::join drops the last path segment unless it ends with '/'
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };

        let api_url = Url::parse(&base_url)
            .map_err(|e| CITraceError::Config(format!("Invalid base URL: {e}")))?
            .join("api/v4/")
            .map_err(|e| CITraceError::Config(format!("Invalid API base URL: {e}")))?;

        Ok(Self {
            client,
            api_url,
            token,
            limiter,
            retry: RetryPolicy::default(),
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn auth_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token.as_str())
        } else {
            request
        }
    }

    /// Construct project base URL
    pub(super) fn project_url(&self, project_id: &str) -> Result<Url> {
        self.api_url
            .join(&format!("projects/{}/", urlencoding::encode(project_id)))
            .map_err(|e| CITraceError::Config(format!("Invalid project URL: {e}")))
    }

    /// GET `url` and decode the JSON body, retrying transient failures with
    /// exponential backoff. Returns the body and the page number advertised
    /// in the `x-next-page` header, if any.
    pub(super) async fn get_json<T>(&self, url: &Url) -> Result<(T, Option<u32>)>
    where
        T: DeserializeOwned,
    {
        let mut retry_count = 0;
        let mut backoff = self.retry.initial_backoff;

        loop {
            self.limiter.wait(&self.shutdown).await?;

            let request = self.auth_request(self.client.get(url.clone()));

            let result = tokio::select! {
                () = self.shutdown.cancelled() => return Err(CITraceError::Cancelled),
                result = Self::send::<T>(request) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if retry_count >= self.retry.max_retries {
                return Err(match error {
                    CITraceError::Api { status, .. } => CITraceError::ApiAfterRetries {
                        status,
                        retries: self.retry.max_retries,
                    },
                    other => other,
                });
            }

            warn!(
                "GitLab request failed ({error}), retrying in {}s ({}/{}) url={}",
                backoff.as_secs_f64(),
                retry_count + 1,
                self.retry.max_retries,
                url.path()
            );

            tokio::select! {
                () = self.shutdown.cancelled() => return Err(CITraceError::Cancelled),
                () = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(self.retry.max_backoff);
            retry_count += 1;
        }
    }

    async fn send<T>(request: reqwest::RequestBuilder) -> Result<(T, Option<u32>)>
    where
        T: DeserializeOwned,
    {
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(CITraceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let next_page = next_page(response.headers());
        let body = response.json::<T>().await?;

        Ok((body, next_page))
    }
}

/// GitLab sends an empty `x-next-page` on the last page.
fn next_page(headers: &HeaderMap) -> Option<u32> {
    headers
        .get(NEXT_PAGE_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|page| *page > 0)
}
