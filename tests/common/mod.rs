//! Common test utilities and mocks for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use gunsole::{
    BatchPayload, ErrorCategory, ErrorListener, ErrorReport, ErrorSurface, HttpRequest,
    HttpResponse, HttpSender, ListenerId, TransportError,
};
use reqwest::header::{HeaderMap, CONTENT_ENCODING};
use reqwest::StatusCode;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

/// Route SDK diagnostics to the test output; `RUST_LOG=gunsole=debug` to see them.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .compact()
        .try_init();
}

/// Scripted reply for the next request.
pub enum Reply {
    Status(u16),
    NetworkError,
    /// Respond with the status after the delay
    Slow(Duration, u16),
    /// Never respond
    Hang,
    Panic,
}

/// A request as seen by the mock, with the body already decoded.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub at: Instant,
    pub url: String,
    pub headers: HeaderMap,
    pub payload: BatchPayload,
}

impl RecordedRequest {
    pub fn messages(&self) -> Vec<String> {
        self.payload.logs.iter().map(|l| l.message.clone()).collect()
    }
}

/// Recording [`HttpSender`] answering from a script, then 200 once the
/// script runs out.
#[derive(Default)]
pub struct MockSender {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_replies(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Poll until at least `count` requests were made, or panic after 5s.
    pub async fn wait_for_requests(&self, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while self.request_count() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(
            waited.is_ok(),
            "expected {} requests, saw {}",
            count,
            self.request_count()
        );
    }
}

pub fn decode_payload(headers: &HeaderMap, body: &[u8]) -> BatchPayload {
    let gzipped = headers
        .get(CONTENT_ENCODING)
        .is_some_and(|value| value == "gzip");

    if gzipped {
        let mut json = String::new();
        GzDecoder::new(body)
            .read_to_string(&mut json)
            .expect("valid gzip body");
        serde_json::from_str(&json).expect("valid JSON payload")
    } else {
        serde_json::from_slice(body).expect("valid JSON payload")
    }
}

#[async_trait]
impl HttpSender for MockSender {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let payload = decode_payload(&request.headers, &request.body);
        self.requests.lock().unwrap().push(RecordedRequest {
            at: Instant::now(),
            url: request.url,
            headers: request.headers,
            payload,
        });

        let reply = self.replies.lock().unwrap().pop_front();
        let status = match reply.unwrap_or(Reply::Status(200)) {
            Reply::Status(code) => code,
            Reply::NetworkError => {
                return Err(TransportError::Request("connection reset".to_string()))
            }
            Reply::Slow(delay, code) => {
                tokio::time::sleep(delay).await;
                code
            }
            Reply::Hang => std::future::pending().await,
            Reply::Panic => panic!("mock sender blew up"),
        };

        Ok(HttpResponse::new(StatusCode::from_u16(status).unwrap()))
    }
}

/// In-memory [`ErrorSurface`] that counts registrations and lets tests fire
/// events by hand.
#[derive(Default)]
pub struct CountingSurface {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ErrorCategory, ListenerId, ErrorListener)>>,
}

impl CountingSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, category: ErrorCategory) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| *c == category)
            .count()
    }

    pub fn emit(&self, category: ErrorCategory, report: ErrorReport) {
        let listeners: Vec<ErrorListener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| *c == category)
            .map(|(_, _, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&report);
        }
    }
}

impl ErrorSurface for CountingSurface {
    fn register(&self, category: ErrorCategory, listener: ErrorListener) -> ListenerId {
        let id = ListenerId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().unwrap().push((category, id, listener));
        id
    }

    fn unregister(&self, category: ErrorCategory, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(c, i, _)| !(*c == category && *i == id));
        listeners.len() != before
    }
}
