//! The stream store seam.
//!
//! Everything streamgen knows about the store passes through the two traits
//! here. A [`Connector`] is shared by all workers and hands each of them a
//! private [`Connection`]; connections are never pooled or shared across
//! workers. The production implementation speaks to Redis, see
//! [`redis::RedisConnector`].

use std::{future::Future, time::Duration};

use crate::message::Message;

pub mod redis;

pub use self::redis::{RedisConnection, RedisConnector};

#[derive(thiserror::Error, Debug)]
/// Errors produced by the store.
pub enum Error {
    /// The store URL could not be parsed.
    #[error("Invalid store URL {url}: {source}")]
    Url {
        /// URL supplied by the user
        url: String,
        /// Underlying client error
        #[source]
        source: Box<::redis::RedisError>,
    },
    /// The store was unreachable.
    #[error("Failed to connect to store at {url}: {source}")]
    Connect {
        /// Store URL
        url: String,
        /// Underlying client error
        #[source]
        source: Box<::redis::RedisError>,
    },
    /// The store rejected an append.
    #[error("Failed to append to stream {stream}: {source}")]
    Append {
        /// Stream key
        stream: String,
        /// Underlying client error
        #[source]
        source: Box<::redis::RedisError>,
    },
    /// The store rejected any other command, or answered it with a reply we
    /// could not interpret.
    #[error("{command} failed on stream {stream}: {source}")]
    Command {
        /// The command name, XREADGROUP and friends
        command: &'static str,
        /// Stream key
        stream: String,
        /// Underlying client error
        #[source]
        source: Box<::redis::RedisError>,
    },
}

/// Outcome of [`Connection::create_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// The group was created by this call.
    Created,
    /// The group already existed, nothing was changed.
    Exists,
}

/// Starting point of a [`Connection::read_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries already delivered to this consumer but never acknowledged.
    Backlog,
    /// Entries never delivered to any consumer of the group.
    New,
}

/// An entry read back from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The store assigned entry id
    pub id: String,
    /// Field name and value pairs, sorted by field name
    pub fields: Vec<(String, String)>,
}

/// A delivered but unacknowledged entry in a group's pending list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    /// The entry id
    pub id: String,
    /// The consumer the entry was last delivered to
    pub consumer: String,
    /// Time since the last delivery
    pub idle: Duration,
    /// Number of times the entry has been delivered
    pub deliveries: u64,
}

/// Opens connections to the store.
pub trait Connector: Send + Sync + 'static {
    /// The connection type handed to each worker.
    type Connection: Connection;

    /// Open a new connection. Each call produces a connection owned by the
    /// caller alone.
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Error>> + Send;
}

/// A single worker's connection to the store.
pub trait Connection: Send + 'static {
    /// Append `message` to `stream`, letting the store assign the id.
    /// Returns the assigned id.
    fn append(
        &mut self,
        stream: &str,
        message: &Message,
    ) -> impl Future<Output = Result<String, Error>> + Send;

    /// Create consumer `group` on `stream`, creating the stream too if it is
    /// missing. New groups start from the beginning of the stream.
    fn create_group(
        &mut self,
        stream: &str,
        group: &str,
    ) -> impl Future<Output = Result<GroupStatus, Error>> + Send;

    /// Up to `count` entries of the group's pending list that have been idle
    /// for at least `min_idle`, oldest first.
    fn pending(
        &mut self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> impl Future<Output = Result<Vec<Pending>, Error>> + Send;

    /// Transfer ownership of `ids` to `consumer`. Only entries idle for at
    /// least `min_idle` are transferred, and only those are returned.
    fn claim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> impl Future<Output = Result<Vec<Entry>, Error>> + Send;

    /// Read up to `count` entries for `consumer`. When reading
    /// [`ReadFrom::New`] and `block` is set the call waits that long for
    /// data; an expired wait yields an empty batch.
    fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Option<Duration>,
    ) -> impl Future<Output = Result<Vec<Entry>, Error>> + Send;

    /// Whether consumer `group` exists on `stream`. A missing stream is an
    /// error.
    fn group_exists(
        &mut self,
        stream: &str,
        group: &str,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Acknowledge `id`, removing it from the group's pending list.
    fn ack(
        &mut self,
        stream: &str,
        group: &str,
        id: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}
