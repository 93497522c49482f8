//! Proxy queue.
//!
//! The queue's state lives inside a single arbiter task. [`ProxyQueue`] handles only
//! send commands to it, so the FIFO matching between waiting callers and available
//! proxies never needs a lock.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use tokio::runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time;

use crate::config::ProxyQueueConfig;
use crate::error::QueueError;
use crate::fetcher::ProxyFetcher;
use crate::proxy::ProxyEndpoint;

type Reply = oneshot::Sender<Result<ProxyEndpoint, QueueError>>;
type Response = oneshot::Receiver<Result<ProxyEndpoint, QueueError>>;
type FetchResult = Result<Vec<ProxyEndpoint>, QueueError>;

enum Command {
    Add {
        proxies: Vec<ProxyEndpoint>,
        done: oneshot::Sender<()>,
    },
    Get {
        reply: Reply,
    },
    Restore {
        proxy: ProxyEndpoint,
    },
    SetFetcher {
        fetcher: Arc<dyn ProxyFetcher>,
        done: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Snapshot of the queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Distinct proxies ever registered.
    pub registered: usize,
    /// Proxies ready to be handed out.
    pub available: usize,
    /// Callers waiting for a proxy.
    pub pending: usize,
    /// Whether a refill is in flight.
    pub fetching: bool,
}

/// Handle to a queue of proxies waiting to be used.
///
/// Cloning the handle is cheap; all clones talk to the same arbiter. The arbiter
/// stops when [`close`](Self::close) is called or every handle is dropped.
#[derive(Clone)]
pub struct ProxyQueue {
    commands: mpsc::Sender<Command>,
    get_timeout: Option<time::Duration>,
    closing: Arc<AtomicBool>,
}

impl ProxyQueue {
    /// Create a queue with the default configuration on the current tokio runtime.
    pub fn new() -> Self {
        Self::with_config(ProxyQueueConfig::default())
    }

    /// Create a queue on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn with_config(config: ProxyQueueConfig) -> Self {
        let (queue, arbiter) = Self::channel(config);
        tokio::spawn(arbiter.run());
        queue
    }

    /// Create a queue whose arbiter runs on a dedicated thread with its own runtime.
    ///
    /// The handle can be used from any runtime. If the thread cannot be started the
    /// error is logged and the returned queue behaves as closed.
    pub fn detached(config: ProxyQueueConfig) -> Self {
        let (queue, arbiter) = Self::channel(config);
        let spawned = thread::Builder::new()
            .name("proxy-queue".to_string())
            .spawn(move || {
                match runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt.block_on(arbiter.run()),
                    Err(e) => error!("Failed to build proxy queue runtime: {}", e),
                }
            });
        if let Err(e) = spawned {
            error!("Failed to spawn proxy queue thread: {}", e);
        }
        queue
    }

    fn channel(config: ProxyQueueConfig) -> (Self, Arbiter) {
        let (tx, rx) = mpsc::channel(config.command_buffer);
        let queue = Self {
            commands: tx,
            get_timeout: config.get_timeout,
            closing: Arc::new(AtomicBool::new(false)),
        };
        (queue, Arbiter::new(rx, config.error_limit))
    }

    async fn send(&self, command: Command) -> Result<(), QueueError> {
        self.commands.send(command).await.map_err(|_| QueueError::Closed)
    }

    /// Register a batch of proxies.
    pub async fn initialize(&self, proxies: Vec<ProxyEndpoint>) -> Result<(), QueueError> {
        let (done, accepted) = oneshot::channel();
        self.send(Command::Add { proxies, done }).await?;
        accepted.await.map_err(|_| QueueError::Closed)
    }

    /// Register one proxy, or hand back one that served a request successfully.
    pub async fn enqueue(&self, proxy: ProxyEndpoint) -> Result<(), QueueError> {
        self.initialize(vec![proxy]).await
    }

    /// Take the next available proxy, waiting until one is available.
    ///
    /// The first `get` on a queue that has never registered a proxy starts a fetch.
    pub async fn get(&self) -> Result<ProxyEndpoint, QueueError> {
        self.get_unless(std::future::pending::<()>())
            .await
            .unwrap_or(Err(QueueError::Closed))
    }

    /// Like `get`, but stops waiting with `None` once `give_up` completes.
    ///
    /// A proxy matched to the request just as it was given up goes back to the
    /// front of the queue.
    pub(crate) async fn get_unless<F: Future>(
        &self,
        give_up: F,
    ) -> Option<Result<ProxyEndpoint, QueueError>> {
        let (reply, mut response) = oneshot::channel();
        if let Err(err) = self.send(Command::Get { reply }).await {
            return Some(Err(err));
        }

        let timed_out = tokio::select! {
            biased;
            outcome = &mut response => {
                return Some(outcome.unwrap_or(Err(QueueError::Closed)));
            }
            _ = give_up => false,
            _ = expiry(self.get_timeout) => true,
        };

        self.withdraw(response).await;
        if timed_out {
            self.get_timeout.map(|limit| Err(QueueError::Timeout(limit)))
        } else {
            None
        }
    }

    async fn withdraw(&self, mut response: Response) {
        response.close();
        if let Ok(Ok(proxy)) = response.try_recv() {
            debug!("Request withdrawn after a match, returning proxy {}", proxy);
            self.restore(proxy).await;
        }
    }

    /// Put a proxy taken by `get` back at the front without registering it again.
    pub(crate) async fn restore(&self, proxy: ProxyEndpoint) {
        if self.send(Command::Restore { proxy }).await.is_err() {
            debug!("Proxy queue closed, dropping restored proxy");
        }
    }

    /// Install the fetcher used to refill an empty queue.
    pub async fn set_fetcher(&self, fetcher: impl ProxyFetcher + 'static) -> Result<(), QueueError> {
        let (done, accepted) = oneshot::channel();
        self.send(Command::SetFetcher {
            fetcher: Arc::new(fetcher),
            done,
        })
        .await?;
        accepted.await.map_err(|_| QueueError::Closed)
    }

    /// Current counters, as seen by the arbiter.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        response.await.map_err(|_| QueueError::Closed)
    }

    /// Stop the queue. Waiting and future `get` calls fail with [`QueueError::Closed`].
    ///
    /// Only the first call on any clone sends the close; later calls wait until the
    /// queue has stopped.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            debug!("Proxy queue already closing");
            self.commands.closed().await;
            return;
        }
        let (done, closed) = oneshot::channel();
        if self.send(Command::Close { done }).await.is_ok() {
            let _ = closed.await;
        }
    }
}

impl Default for ProxyQueue {
    fn default() -> Self {
        Self::new()
    }
}

enum Event {
    Fetched(Result<FetchResult, JoinError>),
    Command(Option<Command>),
}

struct Arbiter {
    commands: mpsc::Receiver<Command>,
    error_limit: i64,
    fetcher: Option<Arc<dyn ProxyFetcher>>,
    /// Available proxies, oldest first.
    proxies: VecDeque<ProxyEndpoint>,
    /// Error budget per registered proxy. Entries are never removed.
    error_count: HashMap<String, i64>,
    requests: VecDeque<Reply>,
    fetching: Option<JoinHandle<FetchResult>>,
}

impl Arbiter {
    fn new(commands: mpsc::Receiver<Command>, error_limit: i64) -> Self {
        Self {
            commands,
            error_limit,
            fetcher: None,
            proxies: VecDeque::new(),
            error_count: HashMap::new(),
            requests: VecDeque::new(),
            fetching: None,
        }
    }

    async fn run(mut self) {
        debug!("Proxy queue started");
        loop {
            let event = tokio::select! {
                finished = fetch_finished(&mut self.fetching) => Event::Fetched(finished),
                command = self.commands.recv() => Event::Command(command),
            };

            match event {
                Event::Fetched(finished) => self.on_fetched(finished),
                Event::Command(Some(command)) => {
                    if !self.handle(command) {
                        return;
                    }
                }
                Event::Command(None) => {
                    debug!("All proxy queue handles dropped");
                    self.shutdown();
                    return;
                }
            }

            self.dispatch();
        }
    }

    /// Apply one command. Returns false once the queue is closed.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Add { proxies, done } => {
                self.add_proxies(proxies);
                let _ = done.send(());
            }
            Command::Get { reply } => {
                if self.error_count.is_empty() && self.fetching.is_none() {
                    self.start_fetch();
                }
                self.prune_requests();
                self.requests.push_back(reply);
            }
            Command::Restore { proxy } => {
                self.proxies.push_front(proxy);
            }
            Command::SetFetcher { fetcher, done } => {
                self.fetcher = Some(fetcher);
                let _ = done.send(());
            }
            Command::Stats { reply } => {
                self.prune_requests();
                let _ = reply.send(QueueStats {
                    registered: self.error_count.len(),
                    available: self.proxies.len(),
                    pending: self.requests.len(),
                    fetching: self.fetching.is_some(),
                });
            }
            Command::Close { done } => {
                self.shutdown();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn add_proxy(&mut self, proxy: ProxyEndpoint) {
        // Positive budget means registered and healthy. With the unlimited
        // sentinel this never holds, so re-registering appends a duplicate.
        if self
            .error_count
            .get(proxy.as_str())
            .is_some_and(|budget| *budget > 0)
        {
            debug!("Proxy {} already registered", proxy);
            return;
        }
        self.error_count.insert(proxy.as_str().to_owned(), self.error_limit);
        self.proxies.push_back(proxy);
    }

    fn add_proxies(&mut self, proxies: Vec<ProxyEndpoint>) {
        for proxy in proxies {
            self.add_proxy(proxy);
        }
    }

    fn start_fetch(&mut self) {
        info!("Proxy queue is empty, fetching proxies");
        let fetcher = self.fetcher.clone();
        self.fetching = Some(tokio::spawn(async move {
            match fetcher {
                Some(fetcher) => Ok(fetcher.fetch().await),
                None => Err(QueueError::FetcherUnconfigured),
            }
        }));
    }

    fn on_fetched(&mut self, finished: Result<FetchResult, JoinError>) {
        self.fetching = None;
        match finished {
            Ok(Ok(proxies)) => {
                if proxies.is_empty() {
                    warn!("Proxy fetcher returned no proxies");
                } else {
                    info!("Fetched {} proxies", proxies.len());
                }
                self.add_proxies(proxies);
            }
            Ok(Err(err)) => {
                error!("Proxy fetch failed: {}", err);
                self.fail_requests(err);
            }
            Err(join_err) => {
                error!("Proxy fetcher task died: {}", join_err);
                self.fail_requests(QueueError::FetchAborted(join_err.to_string()));
            }
        }
    }

    /// Fail waiting callers, unless proxies were registered while the fetch ran.
    fn fail_requests(&mut self, err: QueueError) {
        if !self.error_count.is_empty() {
            warn!(
                "{} callers keep waiting for proxies registered during the fetch",
                self.requests.len()
            );
            return;
        }
        for reply in self.requests.drain(..) {
            let _ = reply.send(Err(err.clone()));
        }
    }

    /// Forget callers that stopped waiting.
    fn prune_requests(&mut self) {
        self.requests.retain(|reply| !reply.is_closed());
    }

    /// Hand proxies to waiting callers, oldest with oldest.
    fn dispatch(&mut self) {
        while !self.proxies.is_empty() {
            let Some(reply) = self.requests.pop_front() else {
                break;
            };
            if let Some(proxy) = self.proxies.pop_front() {
                if let Err(Ok(proxy)) = reply.send(Ok(proxy)) {
                    debug!("Caller stopped waiting, keeping proxy {}", proxy);
                    self.proxies.push_front(proxy);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        // Dropping the reply senders makes every waiting `get` observe `Closed`.
        self.requests.clear();
        self.commands.close();
        if let Some(fetching) = self.fetching.take() {
            fetching.abort();
        }
        info!("Proxy queue closed");
    }
}

async fn expiry(limit: Option<time::Duration>) {
    match limit {
        Some(limit) => time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

async fn fetch_finished(
    fetching: &mut Option<JoinHandle<FetchResult>>,
) -> Result<FetchResult, JoinError> {
    match fetching {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    fn endpoint(s: &str) -> ProxyEndpoint {
        ProxyEndpoint::parse(s).unwrap()
    }

    async fn stays_pending(queue: &ProxyQueue) -> bool {
        time::timeout(Duration::from_millis(100), queue.get())
            .await
            .is_err()
    }

    async fn wait_for_pending(queue: &ProxyQueue, count: usize) {
        time::timeout(Duration::from_secs(2), async {
            while queue.stats().await.unwrap().pending != count {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn duplicates_accumulate_with_unlimited_errors() {
        let queue = ProxyQueue::new();
        let a = endpoint("http://10.0.0.1:3128");
        queue.initialize(vec![a.clone(), a.clone()]).await.unwrap();

        assert_eq!(queue.get().await.unwrap(), a);
        assert_eq!(queue.get().await.unwrap(), a);
        assert!(stays_pending(&queue).await);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.available, 0);
    }

    #[tokio::test]
    async fn positive_error_limit_skips_registered_proxies() {
        let config = ProxyQueueConfig::builder().error_limit(3).build();
        let queue = ProxyQueue::with_config(config);
        let a = endpoint("http://10.0.0.1:3128");
        let b = endpoint("http://10.0.0.2:3128");
        queue
            .initialize(vec![a.clone(), a.clone(), b.clone()])
            .await
            .unwrap();
        queue.enqueue(a.clone()).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.registered, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(queue.get().await.unwrap(), a);
        assert_eq!(queue.get().await.unwrap(), b);
    }

    #[tokio::test]
    async fn concurrent_gets_are_served_in_order() {
        let queue = ProxyQueue::new();
        let p1 = endpoint("http://10.0.0.1:3128");
        let p2 = endpoint("http://10.0.0.2:3128");
        queue.initialize(vec![p1.clone(), p2.clone()]).await.unwrap();

        let (first, second) = tokio::join!(queue.get(), queue.get());
        assert_eq!(first.unwrap(), p1);
        assert_eq!(second.unwrap(), p2);
    }

    #[tokio::test]
    async fn fetches_only_while_nothing_was_ever_registered() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let queue = ProxyQueue::new();
        queue
            .set_fetcher(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    vec![ProxyEndpoint::parse("http://10.0.0.1:3128").unwrap()]
                }
            })
            .await
            .unwrap();

        let p1 = queue.get().await.unwrap();
        assert_eq!(p1, endpoint("http://10.0.0.1:3128"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // p1 is never handed back, as after a failed attempt.
        assert!(stays_pending(&queue).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.registered, 1);
        assert!(!stats.fetching);
    }

    #[tokio::test]
    async fn keeps_serving_while_a_fetch_is_slow() {
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let queue = ProxyQueue::new();
        queue
            .set_fetcher(move || {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    vec![ProxyEndpoint::parse("http://10.0.0.1:3128").unwrap()]
                }
            })
            .await
            .unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        wait_for_pending(&queue, 1).await;
        assert!(queue.stats().await.unwrap().fetching);

        let p2 = endpoint("http://10.0.0.2:3128");
        queue.enqueue(p2.clone()).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), p2);

        release.notify_one();
        assert_eq!(queue.get().await.unwrap(), endpoint("http://10.0.0.1:3128"));
    }

    #[tokio::test]
    async fn missing_fetcher_is_reported() {
        let queue = ProxyQueue::new();
        assert_eq!(queue.get().await, Err(QueueError::FetcherUnconfigured));

        queue
            .set_fetcher(|| async { vec![ProxyEndpoint::parse("http://10.0.0.1:3128").unwrap()] })
            .await
            .unwrap();
        assert_eq!(queue.get().await.unwrap(), endpoint("http://10.0.0.1:3128"));
    }

    #[tokio::test]
    async fn panicking_fetcher_aborts_waiting_gets() {
        async fn exploding_source() -> Vec<ProxyEndpoint> {
            panic!("source exploded")
        }

        let queue = ProxyQueue::new();
        queue.set_fetcher(exploding_source).await.unwrap();
        assert!(matches!(queue.get().await, Err(QueueError::FetchAborted(_))));
    }

    #[tokio::test]
    async fn close_fails_pending_and_later_gets() {
        let queue = ProxyQueue::new();
        let a = endpoint("http://10.0.0.1:3128");
        queue.initialize(vec![a.clone()]).await.unwrap();
        assert_eq!(queue.get().await.unwrap(), a);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        wait_for_pending(&queue, 1).await;

        queue.close().await;
        assert_eq!(waiter.await.unwrap(), Err(QueueError::Closed));
        assert_eq!(queue.get().await, Err(QueueError::Closed));
        assert_err!(queue.enqueue(a).await);
        assert_err!(queue.stats().await);

        // A second close returns at once.
        queue.close().await;
    }

    #[tokio::test]
    async fn timed_out_get_does_not_swallow_a_proxy() {
        let config = ProxyQueueConfig::builder()
            .get_timeout(Duration::from_millis(50))
            .build();
        let queue = ProxyQueue::with_config(config);
        let a = endpoint("http://10.0.0.1:3128");
        queue.initialize(vec![a.clone()]).await.unwrap();
        assert_ok!(queue.get().await);

        assert_eq!(
            queue.get().await,
            Err(QueueError::Timeout(Duration::from_millis(50)))
        );

        let b = endpoint("http://10.0.0.2:3128");
        queue.enqueue(b.clone()).await.unwrap();
        assert_eq!(queue.get().await.unwrap(), b);
    }

    #[tokio::test]
    async fn timed_out_gets_do_not_pile_up() {
        let config = ProxyQueueConfig::builder()
            .get_timeout(Duration::from_millis(5))
            .build();
        let queue = ProxyQueue::with_config(config);
        queue
            .initialize(vec![endpoint("http://10.0.0.1:3128")])
            .await
            .unwrap();
        assert_ok!(queue.get().await);

        for _ in 0..50 {
            assert_err!(queue.get().await);
        }
        assert_eq!(queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn given_up_get_leaves_the_queue_untouched() {
        let queue = ProxyQueue::new();
        let a = endpoint("http://10.0.0.1:3128");
        let b = endpoint("http://10.0.0.2:3128");
        queue.initialize(vec![a.clone()]).await.unwrap();
        assert_eq!(queue.get().await.unwrap(), a);

        let outcome = queue
            .get_unless(time::sleep(Duration::from_millis(20)))
            .await;
        assert!(outcome.is_none());
        assert_eq!(queue.stats().await.unwrap().pending, 0);

        // A restored proxy goes ahead of everything else without a new registration.
        queue.enqueue(b.clone()).await.unwrap();
        queue.restore(a.clone()).await;
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.registered, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(queue.get().await.unwrap(), a);
        assert_eq!(queue.get().await.unwrap(), b);
    }

    #[tokio::test]
    async fn failed_fetch_spares_callers_once_proxies_arrive() {
        fn explode() -> Vec<ProxyEndpoint> {
            panic!("source exploded")
        }

        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let queue = ProxyQueue::new();
        queue
            .set_fetcher(move || {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    explode()
                }
            })
            .await
            .unwrap();

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        wait_for_pending(&queue, 1).await;
        let p1 = endpoint("http://10.0.0.1:3128");
        queue.enqueue(p1.clone()).await.unwrap();
        assert_eq!(first.await.unwrap().unwrap(), p1);

        let second = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        wait_for_pending(&queue, 1).await;

        release.notify_one();
        time::timeout(Duration::from_secs(2), async {
            while queue.stats().await.unwrap().fetching {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!second.is_finished());

        let p2 = endpoint("http://10.0.0.2:3128");
        queue.enqueue(p2.clone()).await.unwrap();
        assert_eq!(second.await.unwrap().unwrap(), p2);
    }

    #[tokio::test]
    async fn every_close_returns_after_shutdown() {
        use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};

        let queue = ProxyQueue::new();
        let a = endpoint("http://10.0.0.1:3128");
        queue.initialize(vec![a.clone()]).await.unwrap();
        assert_eq!(queue.get().await.unwrap(), a);

        let mut waiter = task::spawn(queue.get());
        assert_pending!(waiter.poll());
        let mut first = task::spawn(queue.close());
        assert_pending!(first.poll());

        // The close command is queued but not yet processed.
        queue.clone().close().await;
        assert_ready_eq!(waiter.poll(), Err(QueueError::Closed));
        assert_ready!(first.poll());
    }

    #[test]
    fn detached_queue_outlives_caller_runtimes() {
        let queue = ProxyQueue::detached(ProxyQueueConfig::default());
        let a = endpoint("http://10.0.0.1:3128");

        let first = runtime::Builder::new_current_thread().enable_all().build().unwrap();
        first.block_on(queue.initialize(vec![a.clone(), a.clone()])).unwrap();
        assert_eq!(first.block_on(queue.get()).unwrap(), a);
        drop(first);

        let second = runtime::Builder::new_current_thread().enable_all().build().unwrap();
        assert_eq!(second.block_on(queue.get()).unwrap(), a);
        second.block_on(queue.close());
    }
}
