//! In-memory network for proxy tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::network::{Network, ProxyRequest, ProxyResponse, ResponseSource};
use super::worker::ProxyHandle;
use crate::error::CacheError;

pub async fn wait_active(handle: &ProxyHandle) {
    while !handle.is_active() {
        tokio::task::yield_now().await;
    }
}

/// Waits until the worker has drained its store-back queue.
pub async fn settle(handle: &ProxyHandle) {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    // A round trip through the queue orders us after pending store-backs.
    let _ = handle.fetch(ProxyRequest::get("/__settle")).await;
}

#[derive(Default)]
pub struct StubNetwork {
    responses: Mutex<HashMap<String, (u16, String)>>,
    calls: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
    delay: Option<Duration>,
}

impl StubNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: &str, status: u16, body: &str) -> Self {
        self.set(url, status, body);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set(&self, url: &str, status: u16, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.to_string()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

impl Network for StubNetwork {
    fn fetch(
        &self,
        request: ProxyRequest,
    ) -> impl Future<Output = Result<ProxyResponse, CacheError>> + Send {
        async move {
            *self.calls.lock().unwrap().entry(request.url.clone()).or_default() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(CacheError::Transport("network unreachable".to_string()));
            }
            let (status, body) = self
                .responses
                .lock()
                .unwrap()
                .get(&request.url)
                .cloned()
                .unwrap_or((404, "not found".to_string()));
            Ok(ProxyResponse {
                status,
                content_type: Some("text/plain".to_string()),
                body: body.into_bytes(),
                source: ResponseSource::Network,
                stored_at: None,
            })
        }
    }
}
