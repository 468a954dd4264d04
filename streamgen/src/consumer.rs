//! Consumer group reader.
//!
//! Reads a stream back through a Redis consumer group. A [`Consumer`] works in
//! three phases: it takes over entries abandoned by other consumers, replays
//! its own unacknowledged backlog and then polls for new entries. Every entry
//! handed to the caller is acknowledged right after the handler returns.
//!
//! ## Metrics
//!
//! `entries_claimed`: Entries taken over from other consumers
//! `entries_processed`: Entries passed to the handler
//! `entries_acked`: Entries acknowledged
//!

use std::{num::NonZeroUsize, time::Duration};

use chrono::NaiveDateTime;
use metrics::counter;
use rand::Rng;
use tracing::{debug, info};

use crate::store::{self, Connection, Entry, GroupStatus, ReadFrom};

/// Default consumer group name.
pub const DEFAULT_GROUP: &str = "mygroup";
/// Default number of entries fetched per command.
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Default idle time after which another consumer's entry may be claimed.
pub const DEFAULT_MIN_IDLE: Duration = Duration::from_secs(5);
/// Default time a poll waits for new entries.
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Consumer`].
pub enum Error {
    /// The consumer group name was empty.
    #[error("Consumer group name must not be empty")]
    EmptyGroup,
    /// The consumer name was empty.
    #[error("Consumer name must not be empty")]
    EmptyConsumer,
    /// See [`crate::store::Error`] for details.
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Generate a consumer name of the form `<prefix>-ABC-00123-2024-05-17-0930`:
/// three random uppercase letters, a zero padded number below 1000 and `now`
/// down to the minute.
pub fn consumer_name<R>(prefix: &str, now: NaiveDateTime, rng: &mut R) -> String
where
    R: Rng + ?Sized,
{
    let letters: String = (0..3)
        .map(|_| char::from(rng.random_range(b'A'..=b'Z')))
        .collect();
    let digits: u16 = rng.random_range(0..1000);
    format!(
        "{prefix}-{letters}-{digits:05}-{date}",
        date = now.format("%Y-%m-%d-%H%M")
    )
}

/// Where and how a [`Consumer`] reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Stream key to read
    pub stream: String,
    /// Consumer group name
    pub group: String,
    /// This consumer's name within the group
    pub consumer: String,
    /// Entries fetched per command
    pub batch_size: NonZeroUsize,
    /// Minimum idle time before another consumer's entry is claimed
    pub min_idle: Duration,
    /// How long a poll waits for new entries, `None` returns immediately
    pub block: Option<Duration>,
}

impl Options {
    /// Options with default batching, idle and block settings.
    #[must_use]
    pub fn new(stream: &str, group: &str, consumer: &str) -> Self {
        Self {
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            batch_size: NonZeroUsize::new(DEFAULT_BATCH_SIZE).unwrap_or(NonZeroUsize::MIN),
            min_idle: DEFAULT_MIN_IDLE,
            block: Some(DEFAULT_BLOCK),
        }
    }
}

#[derive(Debug)]
/// A single member of a consumer group.
pub struct Consumer<C> {
    connection: C,
    options: Options,
    metric_labels: Vec<(String, String)>,
}

impl<C> Consumer<C>
where
    C: Connection,
{
    /// Create a new [`Consumer`] reading through `connection`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the group or consumer names are empty.
    pub fn new(connection: C, options: Options) -> Result<Self, Error> {
        if options.group.is_empty() {
            return Err(Error::EmptyGroup);
        }
        if options.consumer.is_empty() {
            return Err(Error::EmptyConsumer);
        }
        let metric_labels = vec![
            ("component".to_string(), "consumer".to_string()),
            ("consumer".to_string(), options.consumer.clone()),
        ];
        Ok(Self {
            connection,
            options,
            metric_labels,
        })
    }

    /// This consumer's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.options.consumer
    }

    /// Create the consumer group, or accept that it already exists.
    ///
    /// # Errors
    ///
    /// Function will return an error if the store rejects the group creation
    /// for any reason other than the group already existing.
    pub async fn ensure_group(&mut self) -> Result<GroupStatus, Error> {
        let status = self
            .connection
            .create_group(&self.options.stream, &self.options.group)
            .await?;
        match status {
            GroupStatus::Created => info!(
                "created consumer group {group} on stream {stream}",
                group = self.options.group,
                stream = self.options.stream
            ),
            GroupStatus::Exists => info!(
                "consumer group {group} already exists on stream {stream}",
                group = self.options.group,
                stream = self.options.stream
            ),
        }
        Ok(status)
    }

    /// Whether the consumer group exists on the stream.
    ///
    /// # Errors
    ///
    /// Function will return an error if the stream does not exist or the
    /// store rejects the command.
    pub async fn group_exists(&mut self) -> Result<bool, Error> {
        let exists = self
            .connection
            .group_exists(&self.options.stream, &self.options.group)
            .await?;
        debug!(
            "consumer group {group} on stream {stream} exists: {exists}",
            group = self.options.group,
            stream = self.options.stream
        );
        Ok(exists)
    }

    /// Take over entries left pending by other consumers for at least
    /// `min_idle`, process and acknowledge them. Returns the number of
    /// entries processed.
    ///
    /// Only entries idle for `min_idle` are listed, so fresh entries ahead of
    /// stale ones never hide them. Stops once nothing idle is left or a round
    /// claims nothing.
    ///
    /// # Errors
    ///
    /// Function will return an error if the store rejects any command.
    pub async fn claim_stale<F>(&mut self, mut handler: F) -> Result<u64, Error>
    where
        F: FnMut(&Entry),
    {
        let mut total = 0;
        loop {
            let pending = self
                .connection
                .pending(
                    &self.options.stream,
                    &self.options.group,
                    self.options.min_idle,
                    self.options.batch_size.get(),
                )
                .await?;
            if pending.is_empty() {
                debug!(
                    "no entries idle for {:?} in group {}",
                    self.options.min_idle, self.options.group
                );
                break;
            }

            for p in &pending {
                debug!(
                    "pending entry {id} held by {consumer}, idle {idle:?}, delivered {deliveries} times",
                    id = p.id,
                    consumer = p.consumer,
                    idle = p.idle,
                    deliveries = p.deliveries
                );
            }
            let ids: Vec<String> = pending.into_iter().map(|p| p.id).collect();
            let claimed = self
                .connection
                .claim(
                    &self.options.stream,
                    &self.options.group,
                    &self.options.consumer,
                    self.options.min_idle,
                    &ids,
                )
                .await?;
            // Another consumer got there first.
            if claimed.is_empty() {
                debug!("pending entries were claimed elsewhere");
                break;
            }
            counter!("entries_claimed", &self.metric_labels).increment(claimed.len() as u64);
            total += self.settle(claimed, &mut handler).await?;
        }
        Ok(total)
    }

    /// Replay entries delivered to this consumer but never acknowledged,
    /// processing and acknowledging each. Returns the number of entries
    /// processed.
    ///
    /// # Errors
    ///
    /// Function will return an error if the store rejects any command.
    pub async fn drain_backlog<F>(&mut self, mut handler: F) -> Result<u64, Error>
    where
        F: FnMut(&Entry),
    {
        let mut total = 0;
        loop {
            let entries = self.read(ReadFrom::Backlog).await?;
            if entries.is_empty() {
                break;
            }
            total += self.settle(entries, &mut handler).await?;
        }
        Ok(total)
    }

    /// Wait for one batch of new entries, processing and acknowledging each.
    /// Returns the number of entries processed, zero if the wait expired.
    ///
    /// # Errors
    ///
    /// Function will return an error if the store rejects any command.
    pub async fn poll<F>(&mut self, mut handler: F) -> Result<u64, Error>
    where
        F: FnMut(&Entry),
    {
        let entries = self.read(ReadFrom::New).await?;
        self.settle(entries, &mut handler).await
    }

    async fn read(&mut self, from: ReadFrom) -> Result<Vec<Entry>, Error> {
        let entries = self
            .connection
            .read_group(
                &self.options.stream,
                &self.options.group,
                &self.options.consumer,
                from,
                self.options.batch_size.get(),
                self.options.block,
            )
            .await?;
        Ok(entries)
    }

    async fn settle<F>(&mut self, entries: Vec<Entry>, handler: &mut F) -> Result<u64, Error>
    where
        F: FnMut(&Entry),
    {
        let mut processed = 0;
        for entry in entries {
            handler(&entry);
            counter!("entries_processed", &self.metric_labels).increment(1);
            self.connection
                .ack(&self.options.stream, &self.options.group, &entry.id)
                .await?;
            counter!("entries_acked", &self.metric_labels).increment(1);
            processed += 1;
        }
        Ok(processed)
    }
}
