//! HTTP client with bounded retries, shared by the node agent, reaper and
//! webhook integrations

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for every further attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, retry })
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.send_with_retry(url, |c| c.get(url)).await
    }

    pub async fn post(&self, url: &str) -> Result<Response> {
        self.send_with_retry(url, |c| c.post(url)).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<Response> {
        self.send_with_retry(url, |c| c.post(url).json(body)).await
    }

    /// Retry HTTP request with exponential backoff
    ///
    /// Non-success statuses are retried like transport errors.
    async fn send_with_retry(
        &self,
        url: &str,
        request: impl Fn(&Client) -> RequestBuilder,
    ) -> Result<Response> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        let mut last_error = None;

        while attempt < max_attempts {
            match request(&self.client).send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        warn!(
                            "HTTP request to {} failed with status {:?}, attempt {}/{}",
                            url,
                            e.status(),
                            attempt + 1,
                            max_attempts
                        );
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    warn!(
                        "HTTP request to {} failed: {}, attempt {}/{}",
                        url,
                        e,
                        attempt + 1,
                        max_attempts
                    );
                    last_error = Some(e);
                }
            }

            attempt += 1;
            if attempt < max_attempts {
                let delay = self.retry.base_delay * 2u32.pow(attempt - 1);
                debug!("Retrying after {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_error
            .map(Error::HttpError)
            .unwrap_or_else(|| Error::ConnectionError(format!("{url}: max retries exceeded"))))
    }
}
