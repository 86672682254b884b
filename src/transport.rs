//! HTTP client shared by search and download, retrying transient server errors.
use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use reqwest::{redirect, Client, Request, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest wait for any single read. Long bodies are fine as long as bytes keep arriving.
const READ_TIMEOUT: Duration = Duration::from_secs(120);

const RETRY_STATUSES: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
    policy: RetryPolicy,
}

impl Transport {
    /// Redirects are never followed automatically; the downloader walks them itself.
    /// Cookies persist for the lifetime of the transport so a login hop's session
    /// cookie is presented on the following requests.
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        Self::with_read_timeout(policy, READ_TIMEOUT)
    }

    /// There is no limit on a whole request, so large downloads are bounded only
    /// by `read_timeout` between reads.
    pub fn with_read_timeout(policy: RetryPolicy, read_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .cookie_store(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self { client, policy })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send a request, retrying 500/502/503/504 and connection failures with
    /// exponential backoff.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let request = request.build()?;
        let url = request.url().to_string();

        let mut retry = 0;
        loop {
            let attempt = clone_request(&request, &url)?;
            let reason = match self.client.execute(attempt).await {
                Ok(response) if !RETRY_STATUSES.contains(&response.status()) => {
                    debug!(url = %url, status = %response.status(), "Response received");
                    return Ok(response);
                }
                Ok(response) => format!("HTTP {}", response.status()),
                Err(e) if e.is_connect() || e.is_timeout() => e.to_string(),
                Err(e) => {
                    return Err(Error::Transport {
                        url,
                        attempts: retry + 1,
                        reason: e.to_string(),
                    })
                }
            };

            if retry >= self.policy.max_retries {
                return Err(Error::Transport {
                    url,
                    attempts: retry + 1,
                    reason,
                });
            }
            retry += 1;
            let delay = self.policy.delay(retry);
            warn!(
                url = %url,
                reason = %reason,
                retry = retry,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn clone_request(request: &Request, url: &str) -> Result<Request> {
    request.try_clone().ok_or_else(|| Error::Transport {
        url: url.to_string(),
        attempts: 0,
        reason: "request body cannot be replayed".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retries_service_unavailable() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&mock_server)
            .await;

        let transport = Transport::new(fast_policy(5)).unwrap();
        let url = format!("{}/flaky", mock_server.uri());
        let response = transport.send(transport.client().get(&url)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&mock_server)
            .await;

        let transport = Transport::new(fast_policy(2)).unwrap();
        let url = format!("{}/down", mock_server.uri());
        let result = transport.send(transport.client().get(&url)).await;

        assert!(matches!(result, Err(Error::Transport { attempts: 3, .. })));
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;

        let transport = Transport::new(fast_policy(5)).unwrap();
        let url = format!("{}/secret", mock_server.uri());
        let response = transport.send(transport.client().get(&url)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_read_times_out_and_retries() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&mock_server)
            .await;

        let transport =
            Transport::with_read_timeout(fast_policy(1), Duration::from_millis(50)).unwrap();
        let url = format!("{}/stalled", mock_server.uri());
        let result = transport.send(transport.client().get(&url)).await;

        assert!(matches!(result, Err(Error::Transport { attempts: 2, .. })));
    }

    #[tokio::test]
    async fn test_slow_response_within_read_timeout() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("slow")
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&mock_server)
            .await;

        let transport = Transport::with_read_timeout(fast_policy(0), Duration::from_secs(2)).unwrap();
        let url = format!("{}/slow", mock_server.uri());
        let response = transport.send(transport.client().get(&url)).await.unwrap();

        assert_eq!(response.text().await.unwrap(), "slow");
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
    }
}
