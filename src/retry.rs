//! Bounded retry for individual units of external work.
//!
//! The policy classifies each transport failure as transient (connection
//! failures, timeouts, throttling, 5xx) or fatal (auth failures and other
//! 4xx), waits a fixed backoff between attempts, and gives up early when the
//! job's cancellation token fires.

use crate::cancel::CancellationToken;
use crate::error::ExportError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Failure reported by the transport for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not reach the remote end (DNS, refused, reset).
    Connection(String),
    /// The request-level timeout enforced by the transport elapsed.
    Timeout,
    /// The remote end answered with a non-success status.
    Status { status: u16, message: String },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connection(reason) => write!(f, "connection failed: {reason}"),
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Status { status, message } => write!(f, "HTTP {status}: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Retry classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Connection,
    /// Server asked us to slow down (429).
    Throttled,
    Http5xx(u16),
    /// 401/403: the session is not usable.
    Auth(u16),
    /// Any other client error.
    Client(u16),
}

impl ErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Throttled | ErrorKind::Http5xx(_)
        )
    }
}

pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::Auth(status),
        429 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(status),
        other => ErrorKind::Client(other),
    }
}

pub fn classify(err: &TransportError) -> ErrorKind {
    match err {
        TransportError::Connection(_) => ErrorKind::Connection,
        TransportError::Timeout => ErrorKind::Timeout,
        TransportError::Status { status, .. } => classify_http_status(*status),
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Fixed-backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_retries(2, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    /// Policy allowing `retries` retries after the first attempt.
    pub fn from_retries(retries: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            backoff,
        }
    }

    /// `attempt` is 1-based.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if !kind.is_transient() || attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        RetryDecision::RetryAfter(self.backoff)
    }

    /// Runs `op` until it succeeds, fails fatally, exhausts the attempt
    /// budget, or `token` is cancelled between attempts.
    ///
    /// `op` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// - [`ExportError::Network`] after `max_attempts` transient failures
    /// - [`ExportError::Auth`] on the first 401/403
    /// - [`ExportError::Rejected`] on the first other 4xx
    /// - [`ExportError::Cancelled`] if the token fires before an attempt
    ///   or during a backoff wait
    pub async fn run<T, F, Fut>(&self, token: &CancellationToken, mut op: F) -> Result<T, ExportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 1u32;
        loop {
            token.checkpoint()?;

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let kind = classify(&err);
            match self.decide(attempt, kind) {
                RetryDecision::NoRetry => return Err(surface(err, kind, attempt)),
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Transient failure, retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(attempt, "Cancelled during retry backoff");
                            return Err(ExportError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

fn surface(err: TransportError, kind: ErrorKind, attempts: u32) -> ExportError {
    match kind {
        ErrorKind::Auth(_) => ExportError::Auth(err.to_string()),
        ErrorKind::Client(status) => ExportError::Rejected {
            status,
            message: err.to_string(),
        },
        _ => ExportError::Network(format!("{err} (after {attempts} attempts)")),
    }
}

/// A single request issued through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport primitive supplied by the HTTP/session layer. Timeouts are
/// enforced there and reported as [`TransportError::Timeout`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError>;
}

/// Transport wrapper that applies a [`RetryPolicy`] to every request.
pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: Transport> RetryingTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetches `request`, treating non-2xx responses as failures to classify.
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        token: &CancellationToken,
    ) -> Result<FetchResponse, ExportError> {
        self.policy
            .run(token, |attempt| async move {
                debug!(url = %request.url, attempt, "Sending request");
                let response = self.inner.send(request).await?;
                if response.is_success() {
                    Ok(response)
                } else {
                    Err(TransportError::Status {
                        status: response.status,
                        message: String::from_utf8_lossy(&response.body).into_owned(),
                    })
                }
            })
            .await
    }
}
