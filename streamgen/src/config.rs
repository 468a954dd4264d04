//! This module controls configuration construction from the end user,
//! providing a convenience mechanism for the rest of the program. All values
//! are checked once at startup and are immutable afterward.

use std::{
    num::NonZeroU16,
    time::{Duration, TryFromFloatSecsError},
};

/// Default number of workers.
pub const DEFAULT_THREADS: u16 = 1;
/// Default number of messages each worker sends.
pub const DEFAULT_MESSAGES: u64 = 10;
/// Default value of the `--sleep` flag, in seconds.
pub const DEFAULT_SLEEP_SECONDS: f64 = 0.1;
/// Default address of the store.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
/// Default stream key that all workers append to.
pub const DEFAULT_STREAM: &str = "mystream";
/// Default name of the single field each message carries.
pub const DEFAULT_FIELD: &str = "message";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// At least one worker is required.
    #[error("Thread count must be at least 1")]
    ZeroThreads,
    /// The sleep value could not be represented as a duration.
    #[error("Sleep must be a finite, non-negative number of seconds, got {value}: {source}")]
    Sleep {
        /// Value supplied by the user
        value: f64,
        /// Underlying conversion error
        #[source]
        source: TryFromFloatSecsError,
    },
    /// The stream key was empty.
    #[error("Stream key must not be empty")]
    EmptyStream,
    /// The message field name was empty.
    #[error("Message field name must not be empty")]
    EmptyField,
}

/// Where messages are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// The Redis connection URL, for example `redis://localhost:6379`
    pub url: String,
    /// The stream key appended to
    pub stream: String,
    /// The field name holding the message label
    pub field: String,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            stream: DEFAULT_STREAM.to_string(),
            field: DEFAULT_FIELD.to_string(),
        }
    }
}

/// Main configuration struct for the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    threads: NonZeroU16,
    messages: u64,
    sleep: Duration,
    target: Target,
    seed: Option<u64>,
}

impl Config {
    /// Create a new, validated [`Config`].
    ///
    /// # Errors
    ///
    /// Function will return an error if `threads` is zero, if `sleep_seconds`
    /// is negative or not finite, or if the stream or field names are empty.
    pub fn new(
        threads: u16,
        messages: u64,
        sleep_seconds: f64,
        target: Target,
    ) -> Result<Self, Error> {
        let threads = NonZeroU16::new(threads).ok_or(Error::ZeroThreads)?;
        let sleep = Duration::try_from_secs_f64(sleep_seconds).map_err(|source| Error::Sleep {
            value: sleep_seconds,
            source,
        })?;
        if target.stream.is_empty() {
            return Err(Error::EmptyStream);
        }
        if target.field.is_empty() {
            return Err(Error::EmptyField);
        }

        Ok(Self {
            threads,
            messages,
            sleep,
            target,
            seed: None,
        })
    }

    /// Fix the seed that worker random sources are derived from.
    #[must_use]
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Total number of workers.
    #[must_use]
    pub fn threads(&self) -> NonZeroU16 {
        self.threads
    }

    /// Number of messages each worker sends.
    #[must_use]
    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// The configured sleep. Accepted and validated but not applied between
    /// appends, see [`crate::generator::Pause`].
    #[must_use]
    pub fn sleep(&self) -> Duration {
        self.sleep
    }

    /// Whether the user changed `--sleep` away from its default.
    #[must_use]
    pub fn sleep_overridden(&self) -> bool {
        self.sleep != Duration::from_secs_f64(DEFAULT_SLEEP_SECONDS)
    }

    /// Where messages are written.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The random seed, if one was fixed.
    #[must_use]
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}
