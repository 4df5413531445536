use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::{AsapSigner, AuthError};

/// Default timeout and retry behaviour for calls to the local component.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    pub timeout: Duration,
    /// Extra attempts for idempotent GETs.
    pub retry_count: u32,
    pub retry_backoff: Duration,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(8_000),
            retry_count: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("HTTPError: Response code {status}")]
    Http { status: StatusCode },
    #[error("TimeoutError: Timeout awaiting '{url}' for {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("RequestError: connection to '{url}' failed: {detail}")]
    Connection { url: String, detail: String },
    #[error("RequestError: protocol error: {0}")]
    Protocol(String),
    #[error("failed to sign request: {0}")]
    Auth(#[from] AuthError),
}

impl RequestError {
    /// Message safe to hand back to the orchestrator.
    pub fn display_message(&self) -> String {
        match self {
            RequestError::Http { .. } => self.to_string(),
            RequestError::Timeout { timeout_ms, .. } => {
                format!("TimeoutError: Timeout awaiting response for {timeout_ms}ms")
            }
            RequestError::Connection { .. } => "RequestError ECONNECTION".into(),
            RequestError::Protocol(_) => "RequestError EPROTOCOL".into(),
            RequestError::Auth(_) => "AuthError".into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            RequestError::Timeout { .. } | RequestError::Connection { .. } => true,
            RequestError::Http { status } => retryable_status(*status),
            RequestError::Protocol(_) | RequestError::Auth(_) => false,
        }
    }

    fn classify(err: reqwest::Error, url: &str, timeout: Duration) -> Self {
        if err.is_timeout() {
            RequestError::Timeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else if err.is_connect() {
            RequestError::Connection {
                url: url.to_string(),
                detail: error_chain(&err),
            }
        } else {
            RequestError::Protocol(error_chain(&err))
        }
    }
}

fn retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// HTTP client that signs every attempt with a fresh ASAP token.
#[derive(Clone)]
pub struct AuthenticatedClient {
    http: Client,
    signer: Arc<AsapSigner>,
    policy: RequestPolicy,
}

impl AuthenticatedClient {
    pub fn new(signer: Arc<AsapSigner>, policy: RequestPolicy) -> Self {
        Self {
            http: Client::new(),
            signer,
            policy,
        }
    }

    pub fn policy(&self) -> &RequestPolicy {
        &self.policy
    }

    /// Sends a request, retrying GETs on transient failures. Non-2xx
    /// responses are returned as-is; callers decide what counts as success.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        options: RequestOptions,
    ) -> Result<Response, RequestError> {
        let timeout = options.timeout.unwrap_or(self.policy.timeout);
        let max_attempts = if method == Method::GET {
            self.policy.retry_count + 1
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            let outcome = self.send_once(method.clone(), url, body, timeout).await;
            let retry = attempt < max_attempts
                && match &outcome {
                    Ok(response) => retryable_status(response.status()),
                    Err(err) => err.is_transient(),
                };
            if !retry {
                return outcome;
            }

            let backoff = self.policy.retry_backoff * 2u32.saturating_pow(attempt - 1);
            match &outcome {
                Ok(response) => debug!(
                    %url,
                    attempt,
                    status = %response.status(),
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying request after retryable status"
                ),
                Err(err) => debug!(
                    %url,
                    attempt,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying request after transient error"
                ),
            }
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Response, RequestError> {
        let token = self.signer.sign()?;
        let mut builder = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .timeout(timeout);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder
            .send()
            .await
            .map_err(|err| RequestError::classify(err, url, timeout))
    }

    /// GETs a JSON document. `Ok(None)` means the component answered with
    /// an empty (or `null`) body.
    pub async fn get_json(&self, url: &str) -> Result<Option<Value>, RequestError> {
        let timeout = self.policy.timeout;
        let response = self
            .request(Method::GET, url, None, RequestOptions::default())
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RequestError::Http { status });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| RequestError::classify(err, url, timeout))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(%url, error = %err, "status endpoint returned invalid json");
                Err(RequestError::Protocol(format!("invalid json body: {err}")))
            }
        }
    }

    /// POSTs a JSON body once and returns the response status.
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        options: RequestOptions,
    ) -> Result<StatusCode, RequestError> {
        let response = self
            .request(Method::POST, url, Some(body), options)
            .await?;
        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{test_signer, verify};
    use axum::{extract::State, http::HeaderMap, routing::get, Json, Router};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        addr
    }

    fn client(retry_count: u32, timeout_ms: u64) -> AuthenticatedClient {
        AuthenticatedClient::new(
            Arc::new(test_signer()),
            RequestPolicy {
                timeout: Duration::from_millis(timeout_ms),
                retry_count,
                retry_backoff: Duration::from_millis(10),
            },
        )
    }

    #[derive(Clone, Default)]
    struct Hits(Arc<AtomicUsize>);

    #[tokio::test]
    async fn get_is_signed_and_retried_until_success() {
        let hits = Hits::default();
        let router = Router::new()
            .route(
                "/health",
                get(|State(hits): State<Hits>, headers: HeaderMap| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let token = auth.strip_prefix("Bearer ").expect("bearer token");
                    verify(token);
                    if hits.0.fetch_add(1, Ordering::SeqCst) == 0 {
                        (
                            axum::http::StatusCode::SERVICE_UNAVAILABLE,
                            Json(json!({})),
                        )
                    } else {
                        (
                            axum::http::StatusCode::OK,
                            Json(json!({"status": {"busyStatus": "IDLE"}})),
                        )
                    }
                }),
            )
            .with_state(hits.clone());
        let addr = serve(router).await;

        let body = client(2, 1_000)
            .get_json(&format!("http://{addr}/health"))
            .await
            .expect("status body")
            .expect("non-empty");
        assert_eq!(body["status"]["busyStatus"], "IDLE");
        assert_eq!(hits.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn get_gives_up_after_retry_budget() {
        let hits = Hits::default();
        let router = Router::new()
            .route(
                "/health",
                get(|State(hits): State<Hits>| async move {
                    hits.0.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::BAD_GATEWAY
                }),
            )
            .with_state(hits.clone());
        let addr = serve(router).await;

        let err = client(2, 1_000)
            .get_json(&format!("http://{addr}/health"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, RequestError::Http { status } if status == StatusCode::BAD_GATEWAY));
        assert_eq!(hits.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn post_is_never_retried() {
        let hits = Hits::default();
        let router = Router::new()
            .route(
                "/start",
                axum::routing::post(|State(hits): State<Hits>| async move {
                    hits.0.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::SERVICE_UNAVAILABLE
                }),
            )
            .with_state(hits.clone());
        let addr = serve(router).await;

        let status = client(3, 1_000)
            .post_json(
                &format!("http://{addr}/start"),
                &json!({}),
                RequestOptions::default(),
            )
            .await
            .expect("status");
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(hits.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_response_is_classified_as_timeout() {
        let router = Router::new().route(
            "/start",
            axum::routing::post(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "late"
            }),
        );
        let addr = serve(router).await;

        let err = client(0, 5_000)
            .post_json(
                &format!("http://{addr}/start"),
                &json!({}),
                RequestOptions::with_timeout(Some(Duration::from_millis(50))),
            )
            .await
            .expect_err("timeout");
        assert!(matches!(err, RequestError::Timeout { timeout_ms: 50, .. }));
        assert_eq!(
            err.display_message(),
            "TimeoutError: Timeout awaiting response for 50ms"
        );
        assert!(err.to_string().contains(&format!("http://{addr}/start")));
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = client(0, 1_000)
            .get_json(&format!("http://{addr}/health"))
            .await
            .expect_err("refused");
        assert!(matches!(err, RequestError::Connection { .. }));
        assert_eq!(err.display_message(), "RequestError ECONNECTION");
    }

    #[tokio::test]
    async fn empty_body_is_none() {
        let router = Router::new().route("/health", get(|| async { "" }));
        let addr = serve(router).await;

        let body = client(0, 1_000)
            .get_json(&format!("http://{addr}/health"))
            .await
            .expect("ok");
        assert!(body.is_none());
    }
}
