//! # HTTP Retrieval Utilities
//!
//! `ApiClient` wraps `reqwest` with retry middleware, bearer auth and an
//! [`ApiResponse`] that keeps non-2xx bodies instead of failing on them.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;

const USER_AGENT: &str = concat!("order-watch/", env!("CARGO_PKG_VERSION"));

/// Outcome of one request: decoded body or raw error text, plus metadata.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// Decoded body of a 2xx response.
    pub data: Option<T>,
    /// Raw body of a non-2xx response.
    pub error_body: Option<String>,
    /// HTTP status code.
    pub status: u16,
    /// `status` is 2xx.
    pub success: bool,
    /// Response headers.
    pub headers: HeaderMap,
}

/// HTTP client bound to one API base URL.
///
/// Transient failures (connect errors, 5xx, 429) are retried with
/// exponential backoff before the caller sees them.
pub struct ApiClient {
    /// Retrying client shared by every order request.
    inner: ClientWithMiddleware,
    /// API root, always ending in `/` so relative paths join under it.
    base_url: Url,
    /// Bearer token sent with each request, if the session has one.
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client.
    ///
    /// # Arguments
    /// * `base_url` - Absolute API base URL. A trailing slash is added so
    ///   relative paths join under it.
    /// * `auth_token` - Optional bearer token.
    /// * `max_retries` - Retries for transient failures.
    /// * `timeout` - Optional per-request timeout.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL or the client cannot be built.
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        max_retries: u32,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let url = Url::parse(&base).with_context(|| format!("invalid API base URL '{}'", base_url))?;

        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("failed to build HTTP client")?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token: auth_token.filter(|t| !t.trim().is_empty()),
        })
    }

    /// The base URL every path is joined to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sends `method path` and decodes a JSON body on success.
    ///
    /// Non-2xx responses are not errors here: they come back with
    /// `success == false` and the raw body in `error_body`.
    ///
    /// # Errors
    /// URL joining, transport failures after retries, or an undecodable
    /// success body.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
    ) -> anyhow::Result<ApiResponse<T>> {
        // 1. Resolve the path against the API root
        let url = self.base_url.join(path.trim_start_matches('/'))?;
        log::debug!("{} {}", method, url);

        // 2. JSON in, plus any caller headers
        let mut req = self.inner.request(method, url).header(ACCEPT, "application/json");
        if let Some(extra) = headers {
            req = req.headers(extra);
        }

        // 3. Bearer token
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        // 4. Send through the retry middleware and keep the response metadata
        let response = req.send().await?;
        let status = response.status();
        let headers = response.headers().clone();

        // 5. Decode on success, keep the raw body otherwise
        let (data, error_body) = if status.is_success() {
            (Some(response.json::<T>().await?), None)
        } else {
            (None, response.text().await.ok())
        };

        Ok(ApiResponse {
            data,
            error_body,
            status: status.as_u16(),
            success: status.is_success(),
            headers,
        })
    }

    /// `GET path`.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<ApiResponse<T>> {
        self.request(Method::GET, path, None).await
    }
}
