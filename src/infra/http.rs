//! Shared HTTP session
//!
//! One blocking client serves every platform adapter and source fetch;
//! requests are safe to issue concurrently from the worker pool. Transient
//! server failures (408/500/502/504) are retried with exponential backoff.

use std::thread::sleep;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tracing::warn;

use crate::error::Result;
use crate::infra::config::HttpConfig;

const USER_AGENT: &str = concat!("granary/", env!("CARGO_PKG_VERSION"));

fn retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub struct Http {
    client: Client,
    retries: u32,
}

impl Http {
    pub fn new(cfg: &HttpConfig) -> Result<Http> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Http {
            client,
            retries: cfg.retries,
        })
    }

    /// GET with retry; the response status is NOT checked here so callers
    /// can give 304/403/404 their own meaning.
    pub fn get(&self, url: &str, headers: HeaderMap) -> Result<Response> {
        self.request(Method::GET, url, headers)
    }

    /// HEAD with retry; used for revision probes.
    pub fn head(&self, url: &str) -> Result<Response> {
        self.request(Method::HEAD, url, HeaderMap::new())
    }

    fn request(&self, method: Method, url: &str, headers: HeaderMap) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let response = self
                .client
                .request(method.clone(), url)
                .headers(headers.clone())
                .send()?;

            if retryable(response.status()) && attempt < self.retries {
                let delay = Duration::from_secs(1 << attempt);
                warn!(
                    url,
                    status = %response.status(),
                    attempt,
                    "transient server failure, retrying in {}s",
                    delay.as_secs()
                );
                sleep(delay);
                attempt += 1;
                continue;
            }

            return Ok(response);
        }
    }
}
