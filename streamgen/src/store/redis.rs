//! Redis speaking store.
//!
//! Each [`RedisConnection`] wraps its own multiplexed connection and issues
//! one command at a time.

use std::time::Duration;

use redis::{
    Client, Cmd, RedisError,
    aio::MultiplexedConnection,
    streams::{
        StreamClaimReply, StreamId, StreamInfoGroupsReply, StreamPendingCountReply,
        StreamReadReply,
    },
};
use tracing::{debug, trace};

use super::{Connection, Connector, Entry, Error, GroupStatus, Pending, ReadFrom};
use crate::message::Message;

const BUSYGROUP: &str = "BUSYGROUP";

#[derive(Debug, Clone)]
/// Opens [`RedisConnection`] instances against a single Redis server.
pub struct RedisConnector {
    url: String,
    client: Client,
}

impl RedisConnector {
    /// Create a new [`RedisConnector`]. No connection is opened.
    ///
    /// # Errors
    ///
    /// Function will return an error if `url` is not a valid Redis URL.
    pub fn new(url: &str) -> Result<Self, Error> {
        let client = Client::open(url).map_err(|source| Error::Url {
            url: url.to_string(),
            source: Box::new(source),
        })?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    /// The URL this connector targets.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for RedisConnector {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<RedisConnection, Error> {
        let inner = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|source| Error::Connect {
                url: self.url.clone(),
                source: Box::new(source),
            })?;
        debug!("connected to {url}", url = self.url);
        Ok(RedisConnection { inner })
    }
}

/// A connection to Redis owned by a single worker.
pub struct RedisConnection {
    inner: MultiplexedConnection,
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection").finish_non_exhaustive()
    }
}

fn command_error(command: &'static str, stream: &str) -> impl FnOnce(RedisError) -> Error {
    let stream = stream.to_string();
    move |source| Error::Command {
        command,
        stream,
        source: Box::new(source),
    }
}

fn entry(command: &'static str, stream: &str, raw: StreamId) -> Result<Entry, Error> {
    let mut fields = raw
        .map
        .iter()
        .map(|(name, value)| {
            redis::from_redis_value::<String>(value).map(|value| (name.clone(), value))
        })
        .collect::<Result<Vec<_>, RedisError>>()
        .map_err(command_error(command, stream))?;
    fields.sort();
    Ok(Entry { id: raw.id, fields })
}

fn read_group_cmd(
    stream: &str,
    group: &str,
    consumer: &str,
    from: ReadFrom,
    count: usize,
    block: Option<Duration>,
) -> Cmd {
    let mut cmd = redis::cmd("XREADGROUP");
    cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
    let start = match from {
        ReadFrom::Backlog => "0",
        ReadFrom::New => {
            if let Some(block) = block {
                let millis = u64::try_from(block.as_millis()).unwrap_or(u64::MAX);
                cmd.arg("BLOCK").arg(millis);
            }
            ">"
        }
    };
    cmd.arg("STREAMS").arg(stream).arg(start);
    cmd
}

// The IDLE filter needs Redis 6.2 or later.
fn pending_cmd(stream: &str, group: &str, min_idle: Duration, count: usize) -> Cmd {
    let min_idle = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);
    let mut cmd = redis::cmd("XPENDING");
    cmd.arg(stream)
        .arg(group)
        .arg("IDLE")
        .arg(min_idle)
        .arg("-")
        .arg("+")
        .arg(count);
    cmd
}

impl Connection for RedisConnection {
    async fn append(&mut self, stream: &str, message: &Message) -> Result<String, Error> {
        let id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg(message.field())
            .arg(message.value())
            .query_async(&mut self.inner)
            .await
            .map_err(|source| Error::Append {
                stream: stream.to_string(),
                source: Box::new(source),
            })?;
        trace!("XADD {stream} {message} -> {id}");
        Ok(id)
    }

    async fn create_group(&mut self, stream: &str, group: &str) -> Result<GroupStatus, Error> {
        let res: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.inner)
            .await;
        match res {
            Ok(()) => Ok(GroupStatus::Created),
            Err(err) if err.code() == Some(BUSYGROUP) => Ok(GroupStatus::Exists),
            Err(err) => Err(command_error("XGROUP CREATE", stream)(err)),
        }
    }

    async fn pending(
        &mut self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Pending>, Error> {
        let reply: StreamPendingCountReply = pending_cmd(stream, group, min_idle, count)
            .query_async(&mut self.inner)
            .await
            .map_err(command_error("XPENDING", stream))?;
        Ok(reply
            .ids
            .into_iter()
            .map(|p| Pending {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(u64::try_from(p.last_delivered_ms).unwrap_or(u64::MAX)),
                deliveries: u64::try_from(p.times_delivered).unwrap_or(u64::MAX),
            })
            .collect())
    }

    async fn claim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<Entry>, Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let min_idle = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(min_idle);
        for id in ids {
            cmd.arg(id);
        }
        let reply: StreamClaimReply = cmd
            .query_async(&mut self.inner)
            .await
            .map_err(command_error("XCLAIM", stream))?;
        reply
            .ids
            .into_iter()
            .map(|raw| entry("XCLAIM", stream, raw))
            .collect()
    }

    async fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Entry>, Error> {
        let cmd = read_group_cmd(stream, group, consumer, from, count, block);
        // A blocking read that times out answers with a nil reply.
        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut self.inner)
            .await
            .map_err(command_error("XREADGROUP", stream))?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys.into_iter().filter(|k| k.key == stream) {
            for raw in key.ids {
                entries.push(entry("XREADGROUP", stream, raw)?);
            }
        }
        Ok(entries)
    }

    async fn group_exists(&mut self, stream: &str, group: &str) -> Result<bool, Error> {
        let reply: StreamInfoGroupsReply = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut self.inner)
            .await
            .map_err(command_error("XINFO GROUPS", stream))?;
        Ok(reply.groups.iter().any(|g| g.name == group))
    }

    async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<(), Error> {
        let acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut self.inner)
            .await
            .map_err(command_error("XACK", stream))?;
        if acked == 0 {
            debug!("XACK {stream} {group} {id} acknowledged nothing");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Cmd) -> Vec<String> {
        cmd.args_iter()
            .map(|arg| match arg {
                redis::Arg::Simple(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                redis::Arg::Cursor => "<cursor>".to_string(),
            })
            .collect()
    }

    #[test]
    fn invalid_url_rejected() {
        let res = RedisConnector::new("not a url");
        assert!(matches!(res, Err(Error::Url { .. })));
    }

    #[test]
    fn valid_url_opens_nothing() {
        let connector =
            RedisConnector::new("redis://localhost:6379").expect("URL should be accepted");
        assert_eq!(connector.url(), "redis://localhost:6379");
    }

    #[tokio::test]
    async fn unreachable_store_is_a_connect_error() {
        // Port 1 on loopback is reserved and nothing listens there.
        let connector = RedisConnector::new("redis://127.0.0.1:1/").expect("URL should be accepted");
        let res = connector.connect().await;
        assert!(matches!(res, Err(Error::Connect { ref url, .. }) if url == "redis://127.0.0.1:1/"));
    }

    #[test]
    fn backlog_read_never_blocks() {
        let cmd = read_group_cmd(
            "mystream",
            "mygroup",
            "c1",
            ReadFrom::Backlog,
            10,
            Some(Duration::from_secs(1)),
        );
        assert_eq!(
            args(&cmd),
            vec![
                "XREADGROUP",
                "GROUP",
                "mygroup",
                "c1",
                "COUNT",
                "10",
                "STREAMS",
                "mystream",
                "0"
            ]
        );
    }

    #[test]
    fn pending_filters_on_idle_time() {
        let cmd = pending_cmd("mystream", "mygroup", Duration::from_secs(5), 10);
        assert_eq!(
            args(&cmd),
            vec!["XPENDING", "mystream", "mygroup", "IDLE", "5000", "-", "+", "10"]
        );
    }

    #[test]
    fn new_read_blocks_in_millis() {
        let cmd = read_group_cmd(
            "mystream",
            "mygroup",
            "c1",
            ReadFrom::New,
            5,
            Some(Duration::from_millis(1500)),
        );
        assert_eq!(
            args(&cmd),
            vec![
                "XREADGROUP",
                "GROUP",
                "mygroup",
                "c1",
                "COUNT",
                "5",
                "BLOCK",
                "1500",
                "STREAMS",
                "mystream",
                ">"
            ]
        );
    }
}
