//! Error types for the reqwest-proxy-race crate.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::proxy::ProxyEndpoint;

/// Error returned by [`ProxyQueue`](crate::ProxyQueue) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue was closed before (or while) the operation ran.
    #[error("proxy queue closed")]
    Closed,
    /// A refill was needed but no fetcher was ever installed.
    #[error("no proxy fetcher configured")]
    FetcherUnconfigured,
    /// The fetcher task died before returning a proxy list.
    #[error("proxy fetch aborted: {0}")]
    FetchAborted(String),
    /// No proxy became available within the configured wait.
    #[error("no proxy available after waiting {0:?}")]
    Timeout(Duration),
}

/// Why a single attempt of a raced request failed.
#[derive(Debug, Error)]
pub enum AttemptFailed {
    #[error("could not acquire a proxy: {0}")]
    Queue(#[from] QueueError),

    #[error("could not build a client for proxy {proxy}: {source}")]
    Client {
        proxy: ProxyEndpoint,
        #[source]
        source: reqwest::Error,
    },

    #[error("request through proxy {proxy} failed: {source}")]
    Request {
        proxy: ProxyEndpoint,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid response status code {status} through proxy {proxy}")]
    UnexpectedStatus {
        proxy: ProxyEndpoint,
        status: StatusCode,
    },
}

impl AttemptFailed {
    /// The proxy this attempt used, if it got that far.
    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        match self {
            Self::Queue(_) => None,
            Self::Client { proxy, .. }
            | Self::Request { proxy, .. }
            | Self::UnexpectedStatus { proxy, .. } => Some(proxy),
        }
    }

    /// The non-200 status the upstream answered with, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::UnexpectedStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Every attempt of a raced request failed. Reasons are kept in arrival order.
#[derive(Debug)]
pub struct AllAttemptsFailed {
    errors: Vec<AttemptFailed>,
}

impl AllAttemptsFailed {
    pub(crate) fn new(errors: Vec<AttemptFailed>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[AttemptFailed] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<AttemptFailed> {
        self.errors
    }
}

impl fmt::Display for AllAttemptsFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no http request succeeded. Errors:")?;
        for err in &self.errors {
            write!(f, "\n * {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AllAttemptsFailed {}

/// Error returned by [`Transport::round_trip`](crate::Transport::round_trip).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    AllAttemptsFailed(#[from] AllAttemptsFailed),

    /// The request body is a stream and cannot be handed to several attempts.
    #[error("request body cannot be replayed across {fan_out} concurrent attempts")]
    BodyNotReplayable { fan_out: usize },
}

/// Error reading one proxy list source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to download proxy list: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to read proxy list {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
