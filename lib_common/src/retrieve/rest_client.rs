//! # REST Client
//!
//! A small asynchronous JSON client around `reqwest`. It owns a base URL, joins
//! relative paths onto it, attaches query parameters and retries transient
//! failures with exponential backoff.

use std::time::Duration;

use reqwest::{header::HeaderMap, Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;

/// A standardized container for API responses.
///
/// Non-2xx statuses are not errors at this layer: `success` is `false`, `data`
/// is empty and the raw body is kept in `error_body` for the caller to report.
#[derive(Debug)]
pub struct RestResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// Tunables for a `RestClient`.
#[derive(Debug, Clone)]
pub struct RestClientOptions {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Transient failures are retried this many times before giving up.
    pub max_retries: u32,
    /// Value of the `User-Agent` header.
    pub user_agent: String,
}

impl Default for RestClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            user_agent: format!("weather-relay/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs, query
/// parameters and automatic retries.
#[derive(Clone)]
pub struct RestClient {
    inner: ClientWithMiddleware,
    base_url: Url,
}

impl RestClient {
    /// Creates a new `RestClient` with the default options.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL or the TLS backend cannot be
    /// initialised.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Self::with_options(base_url, RestClientOptions::default())
    }

    /// Creates a new `RestClient` with explicit options.
    pub fn with_options(base_url: &str, options: RestClientOptions) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        // `Url::join` drops the last segment unless the base ends in a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(options.max_retries);
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent(options.user_agent)
            .build()?;
        let inner = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { inner, base_url })
    }

    /// The base every request path is joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs a `GET` and deserializes a 2xx body into `T`.
    ///
    /// # Errors
    /// Returns an error if URL joining, the network exchange, or decoding of a
    /// successful body fails. Non-2xx answers come back as
    /// `RestResponse { success: false, .. }`.
    pub async fn get_json<T>(&self, path: &str, query: &[(&str, &str)]) -> anyhow::Result<RestResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.request(Method::GET, path, query).await
    }

    async fn request<T>(&self, method: Method, path: &str, query: &[(&str, &str)]) -> anyhow::Result<RestResponse<T>>
    where
        T: DeserializeOwned,
    {
        let mut full_url = self.base_url.join(path.trim_start_matches('/'))?;
        if !query.is_empty() {
            full_url.query_pairs_mut().extend_pairs(query.iter());
        }

        let response: reqwest::Response = self.inner.request(method, full_url).send().await?;
        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(RestResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers,
            })
        } else {
            let error_body = response.text().await.ok();
            Ok(RestResponse {
                data: None,
                error_body,
                status: status.as_u16(),
                success: false,
                headers,
            })
        }
    }
}
