//! Proxy list refill.

use std::collections::HashSet;
use std::future::Future;

use async_trait::async_trait;
use futures::future;
use log::{info, warn};
use rand::seq::SliceRandom;

use crate::proxy::ProxyEndpoint;
use crate::utils;

/// Supplies a fresh batch of proxies when the queue has never seen one.
///
/// The queue runs `fetch` on its own task, so it may be slow. It may also return
/// an empty list.
#[async_trait]
pub trait ProxyFetcher: Send + Sync {
    async fn fetch(&self) -> Vec<ProxyEndpoint>;
}

#[async_trait]
impl<F, Fut> ProxyFetcher for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Vec<ProxyEndpoint>> + Send + 'static,
{
    async fn fetch(&self) -> Vec<ProxyEndpoint> {
        (self)().await
    }
}

/// Fetcher that reads plain-text proxy lists from URLs or local files.
pub struct SourceFetcher {
    sources: Vec<String>,
    default_scheme: String,
    shuffle: bool,
    client: reqwest::Client,
}

impl SourceFetcher {
    /// Create a fetcher over the given sources. Entries starting with "http" are
    /// downloaded, everything else is read from disk.
    pub fn new(sources: Vec<impl Into<String>>) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            default_scheme: "http".to_string(),
            shuffle: false,
            client: reqwest::Client::new(),
        }
    }

    /// Scheme given to bare `host:port` entries.
    pub fn default_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.default_scheme = scheme.into();
        self
    }

    /// Shuffle the fetched list before handing it to the queue.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Use a specific client to download sources.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl ProxyFetcher for SourceFetcher {
    async fn fetch(&self) -> Vec<ProxyEndpoint> {
        info!("Fetching proxies from {} sources", self.sources.len());

        let fetches = self.sources.iter().map(|source| async move {
            (
                source,
                utils::fetch_proxies_from_source(&self.client, source, &self.default_scheme).await,
            )
        });

        let mut seen = HashSet::new();
        let mut proxies = Vec::new();
        for (source, result) in future::join_all(fetches).await {
            match result {
                Ok(entries) => {
                    info!("Fetched {} proxies from {}", entries.len(), source);
                    for entry in entries {
                        match ProxyEndpoint::parse(&entry) {
                            Ok(proxy) => {
                                if seen.insert(proxy.as_str().to_owned()) {
                                    proxies.push(proxy);
                                }
                            }
                            Err(e) => warn!("Skipping invalid proxy {:?} from {}: {}", entry, source, e),
                        }
                    }
                }
                Err(e) => warn!("Failed to fetch proxies from {}: {}", source, e),
            }
        }

        if self.shuffle {
            proxies.shuffle(&mut rand::rng());
        }
        info!("Found {} unique proxies", proxies.len());
        proxies
    }
}
