//! In-memory store used by tests.
//!
//! Models just enough of Redis stream semantics for the generator and
//! consumer to be exercised without a server: auto-assigned ids, consumer
//! groups with a pending entries list, idle-gated claims. Failures can be
//! injected at connect time or for a specific message label.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use redis::{ErrorKind, RedisError};
use tokio::time::Instant;

use crate::{
    message::Message,
    store::{Connection, Connector, Entry, Error, GroupStatus, Pending, ReadFrom},
};

#[derive(Debug)]
struct Delivery {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct Group {
    /// Index of the next never-delivered entry.
    cursor: usize,
    /// Keyed by position in the stream.
    pending: BTreeMap<usize, Delivery>,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, Vec<Entry>>,
    groups: HashMap<(String, String), Group>,
    next_id: u64,
    connects: u64,
    refuse_connect: bool,
    fail_labels: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory store lock poisoned")
    }

    /// Every subsequent connect attempt fails.
    pub(crate) fn refuse_connections(&self) {
        self.lock().refuse_connect = true;
    }

    /// Appending a message whose value equals `label` fails.
    pub(crate) fn fail_on(&self, label: &str) {
        self.lock().fail_labels.insert(label.to_string());
    }

    pub(crate) fn connects(&self) -> u64 {
        self.lock().connects
    }

    /// All values of `field` in `stream`, in arrival order.
    pub(crate) fn values(&self, stream: &str, field: &str) -> Vec<String> {
        self.lock()
            .streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| {
                        e.fields
                            .iter()
                            .find(|(name, _)| name == field)
                            .map(|(_, value)| value.clone())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of pending entries in `group`.
    pub(crate) fn pending_len(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map_or(0, |g| g.pending.len())
    }

    fn refused() -> RedisError {
        RedisError::from((ErrorKind::IoError, "Connection refused"))
    }

    fn no_group() -> RedisError {
        RedisError::from((ErrorKind::ResponseError, "NOGROUP No such consumer group"))
    }
}

impl Connector for MemoryStore {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, Error> {
        let mut state = self.lock();
        if state.refuse_connect {
            return Err(Error::Connect {
                url: "memory://".to_string(),
                source: Box::new(Self::refused()),
            });
        }
        state.connects += 1;
        Ok(MemoryConnection {
            store: self.clone(),
        })
    }
}

#[derive(Debug)]
pub(crate) struct MemoryConnection {
    store: MemoryStore,
}

impl Connection for MemoryConnection {
    async fn append(&mut self, stream: &str, message: &Message) -> Result<String, Error> {
        let mut state = self.store.lock();
        if state.fail_labels.contains(message.value()) {
            return Err(Error::Append {
                stream: stream.to_string(),
                source: Box::new(RedisError::from((
                    ErrorKind::ResponseError,
                    "injected append failure",
                ))),
            });
        }
        state.next_id += 1;
        let id = format!("{}-0", state.next_id);
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .push(Entry {
                id: id.clone(),
                fields: vec![(message.field().to_string(), message.value().to_string())],
            });
        Ok(id)
    }

    async fn create_group(&mut self, stream: &str, group: &str) -> Result<GroupStatus, Error> {
        let mut state = self.store.lock();
        state.streams.entry(stream.to_string()).or_default();
        let key = (stream.to_string(), group.to_string());
        if state.groups.contains_key(&key) {
            return Ok(GroupStatus::Exists);
        }
        state.groups.insert(key, Group::default());
        Ok(GroupStatus::Created)
    }

    async fn pending(
        &mut self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Pending>, Error> {
        let state = self.store.lock();
        let g = group_of(&state, stream, group, "XPENDING")?;
        let entries = &state.streams[stream];
        let now = Instant::now();
        Ok(g.pending
            .iter()
            .filter(|(_, d)| now - d.delivered_at >= min_idle)
            .take(count)
            .map(|(pos, d)| Pending {
                id: entries[*pos].id.clone(),
                consumer: d.consumer.clone(),
                idle: now - d.delivered_at,
                deliveries: d.deliveries,
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
        let mut state = self.store.lock();
        group_of(&state, stream, group, "XCLAIM")?;
        let State {
            streams, groups, ..
        } = &mut *state;
        let entries = &streams[stream];
        let g = groups
            .get_mut(&(stream.to_string(), group.to_string()))
            .expect("group checked above");
        let now = Instant::now();

        let mut claimed = Vec::new();
        for id in ids {
            let Some(pos) = entries.iter().position(|e| &e.id == id) else {
                continue;
            };
            let Some(delivery) = g.pending.get_mut(&pos) else {
                continue;
            };
            if now - delivery.delivered_at < min_idle {
                continue;
            }
            delivery.consumer = consumer.to_string();
            delivery.delivered_at = now;
            delivery.deliveries += 1;
            claimed.push(entries[pos].clone());
        }
        Ok(claimed)
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
        let batch = {
            let mut state = self.store.lock();
            group_of(&state, stream, group, "XREADGROUP")?;
            let State {
                streams, groups, ..
            } = &mut *state;
            let entries = &streams[stream];
            let g = groups
                .get_mut(&(stream.to_string(), group.to_string()))
                .expect("group checked above");
            let now = Instant::now();

            match from {
                ReadFrom::Backlog => g
                    .pending
                    .iter_mut()
                    .filter(|(_, d)| d.consumer == consumer)
                    .take(count)
                    .map(|(pos, d)| {
                        d.delivered_at = now;
                        d.deliveries += 1;
                        entries[*pos].clone()
                    })
                    .collect::<Vec<_>>(),
                ReadFrom::New => {
                    let end = entries.len().min(g.cursor + count);
                    let batch = entries[g.cursor..end].to_vec();
                    for pos in g.cursor..end {
                        g.pending.insert(
                            pos,
                            Delivery {
                                consumer: consumer.to_string(),
                                delivered_at: now,
                                deliveries: 1,
                            },
                        );
                    }
                    g.cursor = end;
                    batch
                }
            }
        };

        if batch.is_empty() && from == ReadFrom::New {
            if let Some(block) = block {
                tokio::time::sleep(block).await;
            }
        }
        Ok(batch)
    }

    async fn group_exists(&mut self, stream: &str, group: &str) -> Result<bool, Error> {
        let state = self.store.lock();
        if !state.streams.contains_key(stream) {
            return Err(Error::Command {
                command: "XINFO GROUPS",
                stream: stream.to_string(),
                source: Box::new(RedisError::from((ErrorKind::ResponseError, "no such key"))),
            });
        }
        Ok(state
            .groups
            .contains_key(&(stream.to_string(), group.to_string())))
    }

    async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<(), Error> {
        let mut state = self.store.lock();
        group_of(&state, stream, group, "XACK")?;
        let State {
            streams, groups, ..
        } = &mut *state;
        if let Some(pos) = streams[stream].iter().position(|e| e.id == id) {
            if let Some(g) = groups.get_mut(&(stream.to_string(), group.to_string())) {
                g.pending.remove(&pos);
            }
        }
        Ok(())
    }
}

fn group_of<'a>(
    state: &'a State,
    stream: &str,
    group: &str,
    command: &'static str,
) -> Result<&'a Group, Error> {
    state
        .groups
        .get(&(stream.to_string(), group.to_string()))
        .ok_or_else(|| Error::Command {
            command,
            stream: stream.to_string(),
            source: Box::new(MemoryStore::no_group()),
        })
}
