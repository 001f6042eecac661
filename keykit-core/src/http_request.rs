//! A simple wrapper on an HTTP client for making requests. Sets sensible
//! defaults such as timeouts, user-agent & ensuring HTTPS, and applies
//! retry middleware for transient failures where the caller does not
//! implement its own retry budget.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Method, RequestBuilder, Response};

use crate::error::RemoteSecretEndpointError;

pub(crate) struct Request {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
}

impl Request {
    /// Initializes a new `Request` instance.
    pub(crate) fn new() -> Self {
        let client = reqwest::Client::new();
        let timeout = Duration::from_secs(10);
        let max_retries = 3; // total attempts = 4
        Self {
            client,
            timeout,
            max_retries,
        }
    }

    /// Creates a request builder with defaults applied.
    pub(crate) fn req(&self, method: Method, url: &str) -> RequestBuilder {
        #[cfg(not(test))]
        assert!(url.starts_with("https"));

        self.client.request(method, url).timeout(self.timeout).header(
            "User-Agent",
            format!("keykit-core/{}", env!("CARGO_PKG_VERSION")),
        )
    }

    /// Creates a POST request builder with defaults applied.
    pub(crate) fn post(&self, url: &str) -> RequestBuilder {
        self.req(Method::POST, url)
    }

    /// Creates a PUT request builder with defaults applied.
    pub(crate) fn put(&self, url: &str) -> RequestBuilder {
        self.req(Method::PUT, url)
    }

    /// Creates a DELETE request builder with defaults applied.
    pub(crate) fn delete(&self, url: &str) -> RequestBuilder {
        self.req(Method::DELETE, url)
    }

    /// Sends a request once, without retrying. Used by the monitor loop,
    /// which owns its own missed-check retry budget.
    pub(crate) async fn execute(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, RemoteSecretEndpointError> {
        Ok(request_builder.send().await?)
    }

    /// Sends a request with exponential-backoff retries for transient
    /// failures (timeouts, connect errors, 429 and 5xx statuses).
    pub(crate) async fn handle(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, RemoteSecretEndpointError> {
        let Some(template) = request_builder.try_clone() else {
            // Streaming bodies cannot be retried.
            return self.execute(request_builder).await;
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.max_retries as usize);

        (|| async {
            let request_builder = template
                .try_clone()
                .expect("template was cloneable on entry");
            execute_retryable(request_builder).await
        })
        .retry(backoff)
        .when(RequestHandleError::is_retryable)
        .await
        .map_err(|error| error.into_endpoint_error())
    }
}

#[derive(Debug)]
struct RequestHandleError {
    error: RemoteSecretEndpointError,
    retryable: bool,
}

impl RequestHandleError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn into_endpoint_error(self) -> RemoteSecretEndpointError {
        self.error
    }
}

async fn execute_retryable(request_builder: RequestBuilder) -> Result<Response, RequestHandleError> {
    match request_builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if status == 429 {
                return Err(RequestHandleError {
                    error: RemoteSecretEndpointError::RateLimitExceeded,
                    retryable: true,
                });
            }
            if (500..600).contains(&status) {
                return Err(RequestHandleError {
                    error: RemoteSecretEndpointError::Network(format!(
                        "request failed with status {status}"
                    )),
                    retryable: true,
                });
            }
            Ok(response)
        }
        Err(error) => {
            let retryable = error.is_timeout() || error.is_connect();
            Err(RequestHandleError {
                error: error.into(),
                retryable,
            })
        }
    }
}
