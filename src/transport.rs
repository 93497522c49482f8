//! Racing transport.
//!
//! Every request is sent through several proxies at once and the first `200 OK`
//! wins. Proxies that answered successfully go back to the queue; the others are
//! dropped from it.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use log::{debug, info, warn};
use reqwest::{Request, Response, StatusCode};
use tokio::sync::{mpsc, watch};

use crate::config::TransportConfig;
use crate::error::{AllAttemptsFailed, AttemptFailed, TransportError};
use crate::proxy::ProxyEndpoint;
use crate::queue::ProxyQueue;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;
type Outcome = Result<Response, AttemptFailed>;

/// Sends each request through `fan_out` proxies in parallel and keeps the first success.
#[derive(Clone)]
pub struct Transport {
    queue: ProxyQueue,
    config: TransportConfig,
    limiter: Option<Arc<Limiter>>,
}

impl Transport {
    /// Create a transport drawing proxies from `queue`.
    pub fn new(queue: ProxyQueue, config: TransportConfig) -> Self {
        let limiter = config.max_requests_per_second.map(|rps| {
            let per_second = NonZeroU32::new(rps.ceil() as u32).unwrap_or(NonZeroU32::MIN);
            Arc::new(RateLimiter::direct(Quota::per_second(per_second)))
        });
        Self {
            queue,
            config,
            limiter,
        }
    }

    /// The queue attempts draw their proxies from.
    pub fn queue(&self) -> &ProxyQueue {
        &self.queue
    }

    /// Settings applied to every round trip.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Send `request` through `fan_out` proxies and return the first `200 OK`.
    ///
    /// The request body must be cloneable when `fan_out` is above 1, since every
    /// attempt sends its own copy.
    pub async fn round_trip(&self, request: Request) -> Result<Response, TransportError> {
        let fan_out = self.config.fan_out;
        let copies = replicate(request, fan_out)?;

        let (results_tx, mut results) = mpsc::channel::<Outcome>(1);
        let abandon = Arc::new(watch::Sender::new(false));

        for (index, request) in copies.into_iter().enumerate() {
            let attempt = Attempt {
                number: index + 1,
                queue: self.queue.clone(),
                config: self.config.clone(),
                limiter: self.limiter.clone(),
            };
            tokio::spawn(attempt.run(request, results_tx.clone(), abandon.clone()));
        }
        drop(results_tx);

        let mut errors = Vec::with_capacity(fan_out);
        while errors.len() < fan_out {
            match results.recv().await {
                Some(Ok(response)) => {
                    info!("Request succeeded with status {}", response.status());
                    abandon.send_replace(true);
                    return Ok(response);
                }
                Some(Err(err)) => errors.push(err),
                // Every attempt task is gone, e.g. one panicked.
                None => break,
            }
        }

        Err(AllAttemptsFailed::new(errors).into())
    }
}

/// One copy of the request per attempt. Only the last attempt gets the original.
fn replicate(request: Request, fan_out: usize) -> Result<Vec<Request>, TransportError> {
    let mut copies = Vec::with_capacity(fan_out);
    for _ in 1..fan_out {
        let copy = request
            .try_clone()
            .ok_or(TransportError::BodyNotReplayable { fan_out })?;
        copies.push(copy);
    }
    copies.push(request);
    Ok(copies)
}

struct Attempt {
    number: usize,
    queue: ProxyQueue,
    config: TransportConfig,
    limiter: Option<Arc<Limiter>>,
}

impl Attempt {
    async fn run(
        self,
        request: Request,
        results: mpsc::Sender<Outcome>,
        abandon: Arc<watch::Sender<bool>>,
    ) {
        let mut settled = abandon.subscribe();
        let acquired = self
            .queue
            .get_unless(call_settled(&mut settled, &results))
            .await;
        let proxy = match acquired {
            Some(Ok(proxy)) => proxy,
            Some(Err(err)) => {
                let err = AttemptFailed::from(err);
                warn!("Attempt {} failed: {}", self.number, err);
                return self.deliver(Err(err), &results, &mut settled).await;
            }
            None => {
                debug!("Attempt {} abandoned while waiting for a proxy", self.number);
                return;
            }
        };

        // A winner hands its proxy back only after raising the abandon flag.
        if *settled.borrow() {
            debug!("Attempt {} abandoned, returning proxy {}", self.number, proxy);
            self.queue.restore(proxy).await;
            return;
        }

        match self.exchange(&proxy, request).await {
            Ok(response) => {
                abandon.send_replace(true);
                if let Err(e) = self.queue.enqueue(proxy.clone()).await {
                    debug!("Could not hand proxy {} back: {}", proxy, e);
                }
                if results.send(Ok(response)).await.is_err() {
                    debug!("Attempt {} finished after the caller left", self.number);
                }
            }
            Err(err) => {
                warn!("Attempt {} failed: {}", self.number, err);
                self.deliver(Err(err), &results, &mut settled).await;
            }
        }
    }

    async fn deliver(
        &self,
        outcome: Outcome,
        results: &mpsc::Sender<Outcome>,
        settled: &mut watch::Receiver<bool>,
    ) {
        tokio::select! {
            sent = results.send(outcome) => {
                if sent.is_err() {
                    debug!("Attempt {} finished after the caller left", self.number);
                }
            }
            _ = call_settled(settled, results) => {
                debug!("Attempt {} abandoned, another attempt already won", self.number);
            }
        }
    }

    async fn exchange(&self, proxy: &ProxyEndpoint, request: Request) -> Result<Response, AttemptFailed> {
        info!("Using proxy: {} (attempt {})", proxy, self.number);

        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let client = self
            .client_for(proxy)
            .map_err(|source| AttemptFailed::Client {
                proxy: proxy.clone(),
                source,
            })?;

        let response = client
            .execute(request)
            .await
            .map_err(|source| AttemptFailed::Request {
                proxy: proxy.clone(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(AttemptFailed::UnexpectedStatus {
                proxy: proxy.clone(),
                status,
            });
        }
        Ok(response)
    }

    /// A client routing everything through `proxy`, used for a single exchange.
    fn client_for(&self, proxy: &ProxyEndpoint) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .proxy(proxy.to_reqwest_proxy()?)
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(0);
        if let Some(timeout) = self.config.request_timeout {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }
}

/// Completes once another attempt won or the caller stopped listening.
async fn call_settled(settled: &mut watch::Receiver<bool>, results: &mpsc::Sender<Outcome>) {
    tokio::select! {
        _ = settled.wait_for(|abandoned| *abandoned) => {}
        _ = results.closed() => {}
    }
}
