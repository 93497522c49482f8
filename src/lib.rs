//! # reqwest-proxy-race
//!
//! Anonymous HTTP requests over a rotating pool of forward proxies.
//!
//! Every request is raced through several proxies taken from a [`ProxyQueue`]; the
//! first `200 OK` is returned and its proxy goes back to the queue, while proxies
//! that failed are dropped. Use the [`Transport`] directly or plug the
//! [`ProxyRaceMiddleware`] into a `reqwest_middleware` client.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod middleware;
pub mod proxy;
pub mod queue;
pub mod shared;
pub mod transport;
mod utils;

pub use config::{
    ProxyQueueConfig, ProxyQueueConfigBuilder, TransportConfig, TransportConfigBuilder,
    UNLIMITED_ERRORS,
};
pub use error::{AllAttemptsFailed, AttemptFailed, QueueError, SourceError, TransportError};
pub use fetcher::{ProxyFetcher, SourceFetcher};
pub use middleware::ProxyRaceMiddleware;
pub use proxy::ProxyEndpoint;
pub use queue::{ProxyQueue, QueueStats};
pub use shared::{add_proxy, default_queue, new_transport, set_fetcher};
pub use transport::Transport;
