//! Process-wide default queue and the shortcuts acting on it.

use std::sync::OnceLock;

use crate::config::{ProxyQueueConfig, TransportConfig};
use crate::error::QueueError;
use crate::fetcher::ProxyFetcher;
use crate::proxy::ProxyEndpoint;
use crate::queue::ProxyQueue;
use crate::transport::Transport;

static DEFAULT_QUEUE: OnceLock<ProxyQueue> = OnceLock::new();

/// The shared queue, created on first use. Its arbiter runs on its own thread, so it
/// is usable from any tokio runtime.
pub fn default_queue() -> &'static ProxyQueue {
    DEFAULT_QUEUE.get_or_init(|| ProxyQueue::detached(ProxyQueueConfig::default()))
}

/// Add a proxy to the shared queue.
pub async fn add_proxy(proxy: ProxyEndpoint) -> Result<(), QueueError> {
    default_queue().enqueue(proxy).await
}

/// Install the fetcher of the shared queue.
pub async fn set_fetcher(fetcher: impl ProxyFetcher + 'static) -> Result<(), QueueError> {
    default_queue().set_fetcher(fetcher).await
}

/// Create a transport bound to the shared queue.
pub fn new_transport(config: TransportConfig) -> Transport {
    Transport::new(default_queue().clone(), config)
}
