//! The stream traffic generator.
//!
//! A fixed number of workers run side by side. Each worker opens its own
//! connection to the store, appends its messages in order and pauses a random
//! interval after every append. The generator returns once every worker has
//! run to completion.
//!
//! ## Metrics
//!
//! `messages_sent`: Messages appended successfully
//! `append_failure`: Number of rejected appends; each ends its worker
//! `connection_failure`: Number of failed connects; each ends its worker
//!

use std::{sync::Arc, time::Duration};

use metrics::counter;
use rand::{
    Rng, SeedableRng,
    rngs::{SmallRng, StdRng},
};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::Config,
    message::Message,
    store::{self, Connection, Connector},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Generator`].
pub enum Error {
    /// A worker stopped early because of a store fault.
    #[error("Worker {index} failed: {source}")]
    Worker {
        /// Index of the failed worker
        index: u16,
        /// Underlying store error
        #[source]
        source: store::Error,
    },
    /// Child sub-task error.
    #[error("Child join error: {0}")]
    Child(JoinError),
}

impl Error {
    /// The index of the worker that failed, if known.
    #[must_use]
    pub fn worker(&self) -> Option<u16> {
        match self {
            Error::Worker { index, .. } => Some(*index),
            Error::Child(_) => None,
        }
    }
}

/// The delay a worker takes after each append.
///
/// Every pause is an independent uniform draw from `[0, upper)`. The
/// configured sleep plays no part in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pause {
    upper: Duration,
}

impl Pause {
    /// Pauses drawn uniformly from `[0, upper)`.
    #[must_use]
    pub const fn uniform(upper: Duration) -> Self {
        Self { upper }
    }

    /// The exclusive upper bound of a pause.
    #[must_use]
    pub fn upper(&self) -> Duration {
        self.upper
    }

    /// Draw the next pause. A zero upper bound always yields a zero pause.
    pub fn next<R>(&self, rng: &mut R) -> Duration
    where
        R: Rng + ?Sized,
    {
        if self.upper.is_zero() {
            return Duration::ZERO;
        }
        rng.random_range(Duration::ZERO..self.upper)
    }
}

impl Default for Pause {
    fn default() -> Self {
        Self::uniform(Duration::from_secs(1))
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Number of workers run
    pub workers: u16,
    /// Total appends across all workers
    pub appended: u64,
}

#[derive(Debug)]
/// The stream generator.
///
/// Holds one prepared worker per configured thread. Nothing touches the store
/// until [`Generator::spin`] is called.
pub struct Generator<C> {
    workers: Vec<Worker<C>>,
}

impl<C> Generator<C>
where
    C: Connector,
{
    /// Create a new [`Generator`] instance
    #[must_use]
    pub fn new(config: &Config, connector: Arc<C>) -> Self {
        Self::with_pause(config, connector, Pause::default())
    }

    /// Create a new [`Generator`] whose workers pause according to `pause`.
    #[must_use]
    pub fn with_pause(config: &Config, connector: Arc<C>, pause: Pause) -> Self {
        if config.sleep_overridden() {
            warn!(
                "configured sleep of {sleep:?} is not applied, pauses are drawn from [0, {upper:?})",
                sleep = config.sleep(),
                upper = pause.upper(),
            );
        }

        let mut seeder = match config.seed() {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let target = config.target();
        let stream: Arc<str> = Arc::from(target.stream.as_str());
        let field: Arc<str> = Arc::from(target.field.as_str());

        let workers = (0..config.threads().get())
            .map(|index| Worker {
                index,
                messages: config.messages(),
                stream: Arc::clone(&stream),
                field: Arc::clone(&field),
                pause,
                rng: SmallRng::from_rng(&mut seeder),
                connector: Arc::clone(&connector),
                metric_labels: vec![
                    ("component".to_string(), "generator".to_string()),
                    ("worker".to_string(), index.to_string()),
                ],
            })
            .collect();

        Self { workers }
    }

    /// Run all workers to completion.
    ///
    /// A failing worker does not stop its siblings. Once every worker has
    /// been joined the failure of the lowest-indexed failed worker is
    /// returned.
    ///
    /// # Errors
    ///
    /// Function will return an error if any worker could not connect to the
    /// store or had an append rejected, or if a worker panicked.
    pub async fn spin(self) -> Result<Report, Error> {
        let workers = u16::try_from(self.workers.len()).unwrap_or(u16::MAX);
        info!("starting {workers} workers");

        let mut handles = JoinSet::new();
        for worker in self.workers {
            handles.spawn(worker.spin());
        }

        let mut appended = 0;
        let mut failure: Option<Error> = None;
        while let Some(res) = handles.join_next().await {
            let err = match res {
                Ok(Ok(sent)) => {
                    appended += sent;
                    continue;
                }
                Ok(Err(err)) => err,
                Err(err) => Error::Child(err),
            };
            error!("{err}");
            let rank = |e: &Error| e.worker().unwrap_or(u16::MAX);
            if failure.as_ref().is_none_or(|f| rank(&err) < rank(f)) {
                failure = Some(err);
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(Report { workers, appended }),
        }
    }
}

#[derive(Debug)]
struct Worker<C> {
    index: u16,
    messages: u64,
    stream: Arc<str>,
    field: Arc<str>,
    pause: Pause,
    rng: SmallRng,
    connector: Arc<C>,
    metric_labels: Vec<(String, String)>,
}

impl<C> Worker<C>
where
    C: Connector,
{
    async fn spin(mut self) -> Result<u64, Error> {
        // No messages, no store contact.
        if self.messages == 0 {
            debug!("worker {index} has nothing to send", index = self.index);
            return Ok(0);
        }

        let mut connection = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(source) => {
                let mut error_labels = self.metric_labels.clone();
                error_labels.push(("error".to_string(), source.to_string()));
                counter!("connection_failure", &error_labels).increment(1);
                return Err(Error::Worker {
                    index: self.index,
                    source,
                });
            }
        };

        for sequence in 0..self.messages {
            let message = Message::labeled(&self.field, self.index, sequence);
            match connection.append(&self.stream, &message).await {
                Ok(id) => {
                    trace!("worker {index} appended {message} as {id}", index = self.index);
                    counter!("messages_sent", &self.metric_labels).increment(1);
                }
                Err(source) => {
                    let mut error_labels = self.metric_labels.clone();
                    error_labels.push(("error".to_string(), source.to_string()));
                    counter!("append_failure", &error_labels).increment(1);
                    return Err(Error::Worker {
                        index: self.index,
                        source,
                    });
                }
            }
            tokio::time::sleep(self.pause.next(&mut self.rng)).await;
        }

        debug!(
            "worker {index} sent {messages} messages",
            index = self.index,
            messages = self.messages
        );
        Ok(self.messages)
    }
}
