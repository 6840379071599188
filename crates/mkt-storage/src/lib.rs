//! Provider HTTP access, retry classification, and the persistent record store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

mod store;

pub use store::{
    DeleteFilter, MemoryRecordStore, PgCatalog, PgRecordStore, RecordStore, StaticCatalog,
    StoreError, TargetCatalog,
};

pub const CRATE_NAME: &str = "mkt-storage";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// How a provider failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    TransientServerError,
    Fatal,
}

pub fn classify_status(status: StatusCode) -> ErrorClass {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::RateLimited
    } else if status.is_server_error() {
        ErrorClass::TransientServerError
    } else {
        ErrorClass::Fatal
    }
}

pub fn classify_error(err: &ProviderError) -> ErrorClass {
    match err {
        ProviderError::HttpStatus { status, .. } => match StatusCode::from_u16(*status) {
            Ok(status) => classify_status(status),
            Err(_) => ErrorClass::Fatal,
        },
        ProviderError::Request(err) => match err.status() {
            Some(status) => classify_status(status),
            None if err.is_timeout() || err.is_connect() => ErrorClass::TransientServerError,
            None => ErrorClass::Fatal,
        },
        ProviderError::Decode { .. } | ProviderError::InvalidRequest(_) => ErrorClass::Fatal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    Retry,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffDecision {
    pub class: ErrorClass,
    pub action: BackoffAction,
    pub delay: Duration,
}

/// Stateless retry decision for a failed batch. The caller owns the sleep and
/// the retry loop; the policy only looks at the error and how many retries the
/// batch has already used.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub rate_limit_delay: Duration,
    pub server_error_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            rate_limit_delay: Duration::from_secs(60),
            server_error_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn decide(&self, err: &ProviderError, retries_used: usize) -> BackoffDecision {
        let class = classify_error(err);
        let delay = match class {
            ErrorClass::RateLimited => self.rate_limit_delay,
            ErrorClass::TransientServerError => self.server_error_delay,
            ErrorClass::Fatal => Duration::ZERO,
        };

        if class == ErrorClass::Fatal || retries_used >= self.max_retries {
            return BackoffDecision {
                class: ErrorClass::Fatal,
                action: BackoffAction::Skip,
                delay: Duration::ZERO,
            };
        }

        BackoffDecision {
            class,
            action: BackoffAction::Retry,
            delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 1,
        }
    }
}

/// Shared reqwest client that caps in-flight requests globally and per
/// provider. It never retries; failures are returned for the backoff policy.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Send `request` and decode a JSON body. Non-2xx statuses become
    /// [`ProviderError::HttpStatus`] so they can be classified.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        request: RequestBuilder,
    ) -> Result<T, ProviderError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let request = request.build()?;
        let url = request.url().to_string();
        let span = info_span!("provider_fetch", source_id, url = %url);

        async move {
            let resp = self.client.execute(request).await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(ProviderError::HttpStatus {
                    status: status.as_u16(),
                    url,
                });
            }

            let body = resp.bytes().await?;
            debug!(bytes = body.len(), "provider response received");
            serde_json::from_slice(&body).map_err(|err| ProviderError::Decode {
                url,
                message: err.to_string(),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: u16) -> ProviderError {
        ProviderError::HttpStatus {
            status,
            url: "https://api.example.test/coins/markets".into(),
        }
    }

    #[test]
    fn statuses_are_classified() {
        assert_eq!(classify_error(&status_error(429)), ErrorClass::RateLimited);
        assert_eq!(classify_error(&status_error(502)), ErrorClass::TransientServerError);
        assert_eq!(classify_error(&status_error(504)), ErrorClass::TransientServerError);
        assert_eq!(classify_error(&status_error(404)), ErrorClass::Fatal);
        let decode = ProviderError::Decode {
            url: "x".into(),
            message: "eof".into(),
        };
        assert_eq!(classify_error(&decode), ErrorClass::Fatal);
    }

    #[test]
    fn rate_limit_retries_once_after_long_delay() {
        let policy = BackoffPolicy::default();
        let first = policy.decide(&status_error(429), 0);
        assert_eq!(first.action, BackoffAction::Retry);
        assert_eq!(first.class, ErrorClass::RateLimited);
        assert_eq!(first.delay, Duration::from_secs(60));

        let second = policy.decide(&status_error(429), 1);
        assert_eq!(second.action, BackoffAction::Skip);
        assert_eq!(second.class, ErrorClass::Fatal);
    }

    #[test]
    fn server_errors_use_shorter_delay() {
        let policy = BackoffPolicy {
            max_retries: 1,
            rate_limit_delay: Duration::from_secs(60),
            server_error_delay: Duration::from_secs(30),
        };
        let decision = policy.decide(&status_error(503), 0);
        assert_eq!(decision.action, BackoffAction::Retry);
        assert_eq!(decision.delay, Duration::from_secs(30));
    }

    #[test]
    fn fatal_errors_are_skipped_immediately() {
        let decision = BackoffPolicy::default().decide(&status_error(400), 0);
        assert_eq!(decision.action, BackoffAction::Skip);
        assert_eq!(decision.delay, Duration::ZERO);
    }

    #[tokio::test]
    async fn non_success_status_is_surfaced_without_network() {
        // Request building fails before any I/O for an invalid URL.
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let err = fetcher
            .send_json::<serde_json::Value>("price_index", fetcher.get("not a url"))
            .await
            .expect_err("invalid url");
        assert!(matches!(err, ProviderError::Request(_)));
        assert_eq!(classify_error(&err), ErrorClass::Fatal);
    }
}
