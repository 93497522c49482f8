//! Middleware implementation for reqwest.

use crate::config::TransportConfig;
use crate::queue::ProxyQueue;
use crate::transport::Transport;

use anyhow::anyhow;
use async_trait::async_trait;
use log::warn;
use reqwest_middleware::{Error, Middleware, Next, Result};

/// Middleware that races every request through several proxies from a queue.
///
/// The request never reaches the inner client; the transport performs the
/// exchanges itself, so it should be the last middleware in the chain.
#[derive(Clone)]
pub struct ProxyRaceMiddleware {
    transport: Transport,
}

impl ProxyRaceMiddleware {
    /// Create a middleware drawing proxies from `queue`.
    pub fn new(queue: ProxyQueue, config: TransportConfig) -> Self {
        Self {
            transport: Transport::new(queue, config),
        }
    }

    /// The transport every request is raced through.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}

impl From<Transport> for ProxyRaceMiddleware {
    fn from(transport: Transport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Middleware for ProxyRaceMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let url = req.url().clone();
        self.transport.round_trip(req).await.map_err(|err| {
            warn!("No proxy could serve {}: {}", url, err);
            Error::Middleware(anyhow!(err))
        })
    }
}
