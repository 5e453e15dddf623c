//! Transport module for shipping log batches to the collector.
//!
//! Serializes a send-set into a [`BatchPayload`], gzips it unless debug mode
//! is on, and POSTs it to `<endpoint>/logs` with a fixed attempt cap,
//! exponential backoff and a per-attempt timeout. The HTTP call itself goes
//! through the [`HttpSender`] trait so the runtime can be swapped out.

use std::io::Write;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE,
};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::ResolvedConfig;
use crate::entry::{BatchPayload, LogEntry};

/// Total number of attempts per batch, including the first.
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff.
pub const BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Ceiling for a single HTTP attempt.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while delivering a batch.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network or transport-level failure
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// Server returned a non-2xx status code
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// Attempt exceeded the per-attempt timeout
    #[error("Request timed out")]
    Timeout,

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to compress payload: {0}")]
    Compression(#[from] std::io::Error),

    /// All attempts exhausted
    #[error("All {attempts} attempts exhausted. Last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// HTTP client or header configuration error
    #[error("HTTP client configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether another attempt may succeed.
    ///
    /// Network failures, timeouts and every non-2xx status are retryable,
    /// except 4xx other than 429. Local failures are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Request(_) | TransportError::Timeout => true,
            TransportError::Status { code, .. } => {
                !code.is_client_error() || *code == StatusCode::TOO_MANY_REQUESTS
            }
            TransportError::Serialization(_)
            | TransportError::Compression(_)
            | TransportError::RetriesExhausted { .. }
            | TransportError::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// An outgoing POST request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// The parts of a response the transport looks at.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

/// Injectable HTTP implementation.
///
/// Implementations report transport-level failures as `Err`; any response
/// that made it back, whatever its status, is `Ok`. Dropping the returned
/// future must abort the request.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Default [`HttpSender`] backed by a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: Client,
}

impl ReqwestSender {
    /// # Errors
    ///
    /// Returns `TransportError::Config` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self { client })
    }

    /// Wrap an already configured reqwest client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(&request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        Ok(HttpResponse { status, body })
    }
}

/// Attempt cap, backoff base and per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Delay applied after failed attempt `attempt` (0-based):
    /// `base_delay * 2^attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1 << attempt.min(16))
    }
}

/// Delivery statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Batches accepted by the collector
    pub batches_sent: u64,

    /// Logs inside accepted batches
    pub logs_sent: u64,

    /// Batches given up on (terminal status or attempts exhausted)
    pub batches_failed: u64,

    /// Logs inside failed batches; these are gone for good
    pub logs_dropped: u64,

    /// Attempts beyond the first
    pub retries: u64,
}

/// Ships send-sets to the collector.
pub struct Transport {
    sender: Arc<dyn HttpSender>,
    logs_url: String,
    project_id: String,
    api_key: Option<String>,
    debug: bool,
    policy: RetryPolicy,
    stats: RwLock<DeliveryStats>,
}

impl Transport {
    pub fn new(config: &ResolvedConfig, sender: Arc<dyn HttpSender>) -> Self {
        Self {
            sender,
            logs_url: config.logs_url(),
            project_id: config.project_id.clone(),
            api_key: config.api_key.clone(),
            debug: config.debug,
            policy: RetryPolicy::default(),
            stats: RwLock::new(DeliveryStats::default()),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Send a batch of logs to the collector.
    ///
    /// An empty batch returns immediately without touching the network.
    /// Otherwise up to `max_attempts` attempts are made, sleeping
    /// `base_delay * 2^attempt` between them.
    ///
    /// # Errors
    ///
    /// - `Status` for a terminal (non-retryable) response, after one attempt
    /// - `RetriesExhausted` once every attempt failed with a retryable error
    /// - `Serialization`/`Compression`/`Config` if the request cannot be built
    ///
    /// In every error case the batch is dropped; nothing is re-queued.
    pub async fn send_batch(&self, logs: Vec<LogEntry>) -> Result<(), TransportError> {
        if logs.is_empty() {
            return Ok(());
        }

        let batch_size = logs.len();
        let batch_id = Uuid::new_v4();

        let request = match self.build_request(logs) {
            Ok(request) => request,
            Err(e) => {
                self.record_failure(batch_size, 0);
                return Err(e);
            }
        };

        debug!(
            batch_size = batch_size,
            batch_id = %batch_id,
            url = %self.logs_url,
            compressed = !self.debug,
            "Sending log batch"
        );

        let mut last_error: Option<TransportError> = None;

        for attempt in 0..self.policy.max_attempts {
            if attempt > 0 {
                let delay = self.policy.backoff_delay(attempt - 1);
                debug!(
                    batch_id = %batch_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.send_request(request.clone()).await {
                Ok(()) => {
                    self.record_success(batch_size, attempt);
                    debug!(
                        batch_id = %batch_id,
                        batch_size = batch_size,
                        attempts = attempt + 1,
                        "Log batch delivered"
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    trace!(
                        batch_id = %batch_id,
                        error = %e,
                        attempt = attempt + 1,
                        "Attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    self.record_failure(batch_size, attempt);
                    debug!(
                        batch_id = %batch_id,
                        error = %e,
                        attempts = attempt + 1,
                        "Log batch rejected, not retrying"
                    );
                    return Err(e);
                }
            }
        }

        self.record_failure(batch_size, self.policy.max_attempts.saturating_sub(1));

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string());

        Err(TransportError::RetriesExhausted {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    /// Build the POST request for a send-set: JSON body, gzipped unless in
    /// debug mode, plus content-type/encoding and bearer headers.
    fn build_request(&self, logs: Vec<LogEntry>) -> Result<HttpRequest, TransportError> {
        let payload = BatchPayload::new(self.project_id.clone(), logs);
        let body = encode_payload(&payload, !self.debug)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !self.debug {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| TransportError::Config(format!("invalid API key: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(HttpRequest {
            url: self.logs_url.clone(),
            headers,
            body,
        })
    }

    /// Perform a single attempt under the per-attempt timeout.
    async fn send_request(&self, request: HttpRequest) -> Result<(), TransportError> {
        let response = tokio::time::timeout(self.policy.request_timeout, self.sender.post(request))
            .await
            .map_err(|_| TransportError::Timeout)??;

        if response.status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                code: response.status,
                message: response.body,
            })
        }
    }

    fn record_success(&self, batch_size: usize, retries: u32) {
        if let Ok(mut stats) = self.stats.write() {
            stats.batches_sent += 1;
            stats.logs_sent += batch_size as u64;
            stats.retries += retries as u64;
        }
    }

    fn record_failure(&self, batch_size: usize, retries: u32) {
        if let Ok(mut stats) = self.stats.write() {
            stats.batches_failed += 1;
            stats.logs_dropped += batch_size as u64;
            stats.retries += retries as u64;
        }
    }

    /// Get current delivery statistics.
    pub fn stats(&self) -> DeliveryStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Get the full ingestion URL.
    pub fn logs_url(&self) -> &str {
        &self.logs_url
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

/// Serialize a payload to compact JSON, gzipping it when `compress` is set.
pub fn encode_payload(payload: &BatchPayload, compress: bool) -> Result<Vec<u8>, TransportError> {
    let json = serde_json::to_vec(payload)?;
    if !compress {
        return Ok(json);
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::entry::{Identity, LogLevel, LogOptions};
    use flate2::read::GzDecoder;
    use std::collections::VecDeque;
    use std::io::Read;
    use std::sync::Mutex;
    use tokio::time::Instant;

    enum Script {
        Status(u16),
        NetworkError,
        Hang,
    }

    #[derive(Default)]
    struct ScriptedSender {
        script: Mutex<VecDeque<Script>>,
        calls: Mutex<Vec<(Instant, HttpRequest)>>,
    }

    impl ScriptedSender {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(Instant, HttpRequest)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpSender for ScriptedSender {
        async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.calls.lock().unwrap().push((Instant::now(), request));
            let next = self.script.lock().unwrap().pop_front();
            match next.unwrap_or(Script::Status(200)) {
                Script::Status(code) => {
                    Ok(HttpResponse::new(StatusCode::from_u16(code).unwrap()))
                }
                Script::NetworkError => {
                    Err(TransportError::Request("connection refused".to_string()))
                }
                Script::Hang => std::future::pending().await,
            }
        }
    }

    fn transport(sender: Arc<ScriptedSender>, f: impl FnOnce(&mut ClientConfig)) -> Transport {
        let mut config = ClientConfig::new("proj");
        f(&mut config);
        Transport::new(&config.resolve().unwrap(), sender)
    }

    fn create_test_logs(size: usize) -> Vec<LogEntry> {
        let config = ClientConfig::new("proj").resolve().unwrap();
        (0..size)
            .map(|i| {
                LogEntry::build(
                    LogLevel::Info,
                    LogOptions::new(format!("message {}", i), "test"),
                    &config,
                    &Identity::default(),
                )
            })
            .collect()
    }

    fn gunzip(body: &[u8]) -> BatchPayload {
        let mut decoder = GzDecoder::new(body);
        let mut json = String::new();
        decoder.read_to_string(&mut json).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_request() {
        let sender = ScriptedSender::new(vec![]);
        let transport = transport(sender.clone(), |_| {});

        transport.send_batch(Vec::new()).await.unwrap();

        assert!(sender.calls().is_empty());
        assert_eq!(transport.stats(), DeliveryStats::default());
    }

    #[tokio::test]
    async fn test_successful_send_is_gzipped_with_headers() {
        let sender = ScriptedSender::new(vec![Script::Status(202)]);
        let transport = transport(sender.clone(), |c| c.api_key = Some("secret".to_string()));
        let logs = create_test_logs(3);

        transport.send_batch(logs.clone()).await.unwrap();

        let calls = sender.calls();
        assert_eq!(calls.len(), 1);
        let request = &calls[0].1;
        assert_eq!(request.url, "https://api.gunsole.com/logs");
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert_eq!(request.headers[CONTENT_ENCODING], "gzip");
        assert_eq!(request.headers[AUTHORIZATION], "Bearer secret");

        let payload = gunzip(&request.body);
        assert_eq!(payload.project_id, "proj");
        assert_eq!(payload.logs, logs);

        let stats = transport.stats();
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.logs_sent, 3);
        assert_eq!(stats.retries, 0);
    }

    #[tokio::test]
    async fn test_debug_mode_sends_plain_json_without_auth() {
        let sender = ScriptedSender::new(vec![]);
        let transport = transport(sender.clone(), |c| c.debug = true);

        transport.send_batch(create_test_logs(1)).await.unwrap();

        let request = &sender.calls()[0].1;
        assert!(request.headers.get(CONTENT_ENCODING).is_none());
        assert!(request.headers.get(AUTHORIZATION).is_none());
        let payload: BatchPayload = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(payload.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let sender = ScriptedSender::new(vec![Script::Status(400)]);
        let transport = transport(sender.clone(), |_| {});

        let err = transport.send_batch(create_test_logs(2)).await.unwrap_err();

        assert!(matches!(
            err,
            TransportError::Status { code, .. } if code == StatusCode::BAD_REQUEST
        ));
        assert_eq!(sender.calls().len(), 1);
        let stats = transport.stats();
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.logs_dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_and_server_error_retry_with_backoff() {
        let sender = ScriptedSender::new(vec![
            Script::Status(429),
            Script::Status(500),
            Script::Status(200),
        ]);
        let transport = transport(sender.clone(), |_| {});

        transport.send_batch(create_test_logs(1)).await.unwrap();

        let calls = sender.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].0 - calls[0].0 >= Duration::from_millis(1000));
        assert!(calls[2].0 - calls[1].0 >= Duration::from_millis(2000));
        assert_eq!(transport.stats().retries, 2);
        assert_eq!(transport.stats().batches_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redirect_status_is_retried() {
        let sender = ScriptedSender::new(vec![Script::Status(302), Script::Status(200)]);
        let transport = transport(sender.clone(), |_| {});

        transport.send_batch(create_test_logs(1)).await.unwrap();

        assert_eq!(sender.calls().len(), 2);
        assert_eq!(transport.stats().retries, 1);
        assert_eq!(transport.stats().batches_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_exhaust_attempts() {
        let sender = ScriptedSender::new(vec![
            Script::NetworkError,
            Script::NetworkError,
            Script::NetworkError,
            Script::Status(200),
        ]);
        let transport = transport(sender.clone(), |_| {});

        let err = transport.send_batch(create_test_logs(4)).await.unwrap_err();

        match err {
            TransportError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("connection refused"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(sender.calls().len(), 3);
        assert_eq!(transport.stats().logs_dropped, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let sender = ScriptedSender::new(vec![Script::Hang, Script::Status(200)]);
        let transport = transport(sender.clone(), |_| {});

        let started = Instant::now();
        transport.send_batch(create_test_logs(1)).await.unwrap();

        let calls = sender.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].0 - started >= REQUEST_TIMEOUT + BASE_DELAY);
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_retryable_error_detection() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Request("reset".to_string()).is_retryable());

        let retryable = [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::FOUND,
            StatusCode::NOT_MODIFIED,
        ];
        for code in retryable {
            assert!(TransportError::Status {
                code,
                message: String::new()
            }
            .is_retryable());
        }

        for code in [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED, StatusCode::NOT_FOUND] {
            assert!(!TransportError::Status {
                code,
                message: String::new()
            }
            .is_retryable());
        }

        assert!(!TransportError::Config("bad header".to_string()).is_retryable());
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Status {
            code: StatusCode::BAD_REQUEST,
            message: "Invalid JSON".to_string(),
        };
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("Invalid JSON"));

        let err = TransportError::RetriesExhausted {
            attempts: 3,
            last_error: "Connection refused".to_string(),
        };
        assert!(err.to_string().contains("3"));
        assert!(err.to_string().contains("Connection refused"));
    }

    #[test]
    fn test_encode_payload_round_trips_through_gzip() {
        let payload = BatchPayload::new("proj", create_test_logs(2));
        let compressed = encode_payload(&payload, true).unwrap();
        assert_eq!(gunzip(&compressed), payload);

        let plain = encode_payload(&payload, false).unwrap();
        assert!(plain.starts_with(b"{\"projectId\":\"proj\""));
    }

    #[test]
    fn test_reqwest_sender_creation() {
        assert!(ReqwestSender::new().is_ok());
    }
}
