//! The proxy's own task and the handles the page uses to reach it.
//!
//! The worker owns Tier 2 storage outright. Everything else talks to it
//! through its queue: intercepted fetches, invalidation messages from the
//! page, and records that strategy tasks want written back.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::network::{Method, Network, ProxyRequest, ProxyResponse};
use super::route::{Expiration, RouteTable, RouteTags, OFFLINE_DOCUMENT, PRECACHE};
use super::store::{CacheStorage, ProxyCacheRecord};
use super::strategy::{self, Exchange, StoreSink};
use crate::channel::{InvalidationMessage, PageMessage};
use crate::error::CacheError;
use crate::time::Clock;

/// Pending messages the proxy queue holds before `post_message` starts dropping.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// How long activation waits for each precached document.
const PRECACHE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Names the cache generation. Installing a new version drops the others.
    pub version: String,
    pub routes: RouteTable,
    /// Fetched and stored at activation, never expired.
    pub precache: Vec<String>,
    pub storage_dir: Option<PathBuf>,
    pub queue_capacity: usize,
}

impl ProxyConfig {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            routes: RouteTable::standard(),
            precache: vec![OFFLINE_DOCUMENT.to_string()],
            storage_dir: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    pub fn with_precache(mut self, urls: Vec<String>) -> Self {
        self.precache = urls;
        self
    }
}

enum ProxyMessage {
    Fetch {
        request: ProxyRequest,
        reply: oneshot::Sender<Result<ProxyResponse, CacheError>>,
    },
    Page(PageMessage),
    Shutdown,
}

/// Cloneable handle to a running proxy.
#[derive(Clone)]
pub struct ProxyHandle {
    tx: mpsc::Sender<ProxyMessage>,
    active: Arc<AtomicBool>,
}

impl ProxyHandle {
    /// True once activation has finished, until the worker stops.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Sends `request` through the proxy's routing and strategies.
    pub async fn fetch(&self, request: ProxyRequest) -> Result<ProxyResponse, CacheError> {
        if !self.is_active() {
            return Err(CacheError::ProxyUnavailable);
        }
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ProxyMessage::Fetch { request, reply })
            .await
            .map_err(|_| CacheError::ProxyUnavailable)?;
        response.await.map_err(|_| CacheError::ProxyUnavailable)?
    }

    /// Posts a page message without waiting. Dropped unless the proxy is
    /// active and has room in its queue.
    pub fn post_message(&self, message: PageMessage) -> Result<(), CacheError> {
        if !self.is_active() {
            return Err(CacheError::ProxyUnavailable);
        }
        self.tx
            .try_send(ProxyMessage::Page(message))
            .map_err(|_| CacheError::ProxyUnavailable)
    }

    /// Asks the worker to stop after the messages already queued.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ProxyMessage::Shutdown).await;
    }
}

/// Starts a proxy worker. It activates before accepting traffic and runs
/// until shut down or until every handle is dropped.
pub fn install<N: Network>(
    config: ProxyConfig,
    network: Arc<N>,
    clock: Arc<dyn Clock>,
) -> (ProxyHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let (store_tx, store_rx) = mpsc::unbounded_channel();
    let active = Arc::new(AtomicBool::new(false));

    let storage = match &config.storage_dir {
        Some(dir) => CacheStorage::open(dir, &config.version),
        None => CacheStorage::in_memory(&config.version),
    };

    let worker = Worker {
        routes: config.routes,
        precache: config.precache,
        storage,
        network,
        clock,
        store_tx,
        active: active.clone(),
    };
    let task = tokio::spawn(worker.run(rx, store_rx));

    (ProxyHandle { tx, active }, task)
}

struct Worker<N: Network> {
    routes: RouteTable,
    precache: Vec<String>,
    storage: CacheStorage,
    network: Arc<N>,
    clock: Arc<dyn Clock>,
    store_tx: StoreSink,
    active: Arc<AtomicBool>,
}

impl<N: Network> Worker<N> {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ProxyMessage>,
        mut store_rx: mpsc::UnboundedReceiver<ProxyCacheRecord>,
    ) {
        self.activate().await;
        self.active.store(true, Ordering::Release);
        info!(version = %self.storage.version(), "Proxy active");

        loop {
            tokio::select! {
                biased;

                Some(record) = store_rx.recv() => self.store(record),

                message = rx.recv() => match message {
                    Some(ProxyMessage::Fetch { request, reply }) => self.handle_fetch(request, reply),
                    Some(ProxyMessage::Page(message)) => self.handle_page_message(message),
                    Some(ProxyMessage::Shutdown) | None => break,
                },
            }
        }

        self.active.store(false, Ordering::Release);
        // Write back whatever finished before the stop.
        while let Ok(record) = store_rx.try_recv() {
            self.store(record);
        }
        info!(version = %self.storage.version(), "Proxy stopped");
    }

    /// Drops older generations, then fills the precache.
    async fn activate(&mut self) {
        self.storage.activate();

        for url in &self.precache {
            let request = ProxyRequest::get(url.as_str());
            let timeout = Duration::from_secs(PRECACHE_TIMEOUT_SECS);
            match tokio::time::timeout(timeout, self.network.fetch(request)).await {
                Ok(Ok(response)) if response.is_success() => {
                    let record = ProxyCacheRecord::from_response(
                        PRECACHE,
                        url,
                        RouteTags::default(),
                        &response,
                        self.clock.now(),
                    );
                    self.storage.put(record, &Expiration::unbounded(), self.clock.now());
                    debug!(url = %url, "Precached");
                }
                Ok(Ok(response)) => {
                    warn!(url = %url, status = response.status, "Precache request failed")
                }
                Ok(Err(e)) => warn!(url = %url, error = %e, "Precache request failed"),
                Err(_) => warn!(url = %url, "Precache request timed out"),
            }
        }
    }

    fn handle_fetch(
        &mut self,
        request: ProxyRequest,
        reply: oneshot::Sender<Result<ProxyResponse, CacheError>>,
    ) {
        let network = self.network.clone();

        let routed = if request.method == Method::Get {
            self.routes.route(&request).map(|(rule, tags)| (rule.clone(), tags))
        } else {
            None
        };
        let Some((rule, tags)) = routed else {
            debug!(method = ?request.method, url = %request.url, "Passing through");
            tokio::spawn(async move {
                let _ = reply.send(network.fetch(request).await);
            });
            return;
        };

        let now = self.clock.now();
        let cached = self
            .storage
            .get(&rule.cache_name, request.cache_key(), &rule.expiration, now);
        let fallback = rule.offline_fallback.as_deref().and_then(|url| {
            self.storage
                .get(PRECACHE, url, &Expiration::unbounded(), now)
        });

        let exchange = Exchange {
            request,
            rule,
            tags,
            cached,
            fallback,
        };
        let sink = self.store_tx.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let _ = reply.send(strategy::execute(exchange, network, sink, clock).await);
        });
    }

    fn handle_page_message(&mut self, message: PageMessage) {
        let InvalidationMessage { cache_name, scope } = message.into();
        let removed = self.storage.invalidate(&cache_name, &scope);
        debug!(cache = %cache_name, scope = ?scope, removed, "Invalidated proxy records");
    }

    fn store(&mut self, record: ProxyCacheRecord) {
        let expiration = self
            .routes
            .rule(&record.cache_name)
            .map(|rule| rule.expiration)
            .unwrap_or_else(Expiration::unbounded);
        self.storage.put(record, &expiration, self.clock.now());
    }
}

/// Network access for page code: through the proxy while it is active,
/// straight to the network otherwise.
pub struct InterceptedNetwork<N: Network> {
    proxy: Option<ProxyHandle>,
    direct: Arc<N>,
}

impl<N: Network> InterceptedNetwork<N> {
    pub fn new(proxy: Option<ProxyHandle>, direct: Arc<N>) -> Self {
        Self { proxy, direct }
    }

    pub fn direct(direct: Arc<N>) -> Self {
        Self::new(None, direct)
    }
}

impl<N: Network> Network for InterceptedNetwork<N> {
    fn fetch(
        &self,
        request: ProxyRequest,
    ) -> impl std::future::Future<Output = Result<ProxyResponse, CacheError>> + Send {
        let proxy = self.proxy.clone().filter(ProxyHandle::is_active);
        let direct = self.direct.clone();

        async move {
            if let Some(proxy) = proxy {
                match proxy.fetch(request.clone()).await {
                    Err(CacheError::ProxyUnavailable) => {
                        debug!(url = %request.url, "Proxy unavailable, going direct");
                    }
                    result => return result,
                }
            }
            direct.fetch(request).await
        }
    }
}
