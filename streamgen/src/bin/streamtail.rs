use std::{net::SocketAddr, num::NonZeroUsize, time::Duration};

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use streamgen::{
    config::{DEFAULT_REDIS_URL, DEFAULT_STREAM},
    consumer::{self, Consumer, DEFAULT_BATCH_SIZE, DEFAULT_GROUP, Options, consumer_name},
    store::{self, Connector, Entry, RedisConnector},
};
use tokio::{runtime::Builder, signal};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error("Consumer returned an error: {0}")]
    Consumer(#[from] consumer::Error),
    #[error("Failed to install Prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

/// Read a Redis stream through a consumer group
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// the Redis server to read from
    #[clap(long, default_value_t = DEFAULT_REDIS_URL.to_string())]
    redis_url: String,
    /// the stream key to read
    #[clap(long, default_value_t = DEFAULT_STREAM.to_string())]
    stream: String,
    /// the consumer group to read through, created when missing
    #[clap(long, default_value_t = DEFAULT_GROUP.to_string())]
    group: String,
    /// this consumer's name, generated when absent
    #[clap(long)]
    consumer: Option<String>,
    /// entries fetched per command
    #[clap(long, default_value_t = NonZeroUsize::new(DEFAULT_BATCH_SIZE).unwrap_or(NonZeroUsize::MIN))]
    batch_size: NonZeroUsize,
    /// idle seconds after which another consumer's entry is claimed
    #[clap(long, default_value_t = 5)]
    min_idle_seconds: u64,
    /// milliseconds a poll waits for new entries
    #[clap(long, default_value_t = 1000)]
    block_milliseconds: u64,
    /// address to expose Prometheus metrics on
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
}

impl Args {
    fn options(&self) -> Options {
        let consumer = self
            .consumer
            .clone()
            .unwrap_or_else(|| consumer_name(
                    "consumer",
                    chrono::Local::now().naive_local(),
                    &mut rand::rng(),
                ));
        Options {
            batch_size: self.batch_size,
            min_idle: Duration::from_secs(self.min_idle_seconds),
            block: Some(Duration::from_millis(self.block_milliseconds)),
            ..Options::new(&self.stream, &self.group, &consumer)
        }
    }
}

fn process(entry: &Entry) {
    let fields = entry
        .fields
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(",");
    info!("processing entry {id}: {fields}", id = entry.id);
}

async fn inner_main(args: Args) -> Result<(), Error> {
    if let Some(addr) = args.prometheus_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("serving metrics on {addr}");
    }

    let options = args.options();
    info!(
        "starting consumer {consumer} in group {group} on stream {stream}",
        consumer = options.consumer,
        group = options.group,
        stream = options.stream
    );
    let connector = RedisConnector::new(&args.redis_url)?;
    let mut consumer = Consumer::new(connector.connect().await?, options)?;

    if !consumer.group_exists().await.unwrap_or(false) {
        info!("consumer group {} not found, creating it", args.group);
    }
    consumer.ensure_group().await?;
    let claimed = consumer.claim_stale(process).await?;
    info!("claimed {claimed} entries abandoned by other consumers");
    let replayed = consumer.drain_backlog(process).await?;
    info!("replayed {replayed} unacknowledged entries");

    info!("polling for new entries");
    loop {
        tokio::select! {
            res = consumer.poll(process) => {
                res?;
            },
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break;
            },
        }
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let args = Args::parse();
    let runtime = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(args));
    if let Err(ref err) = res {
        error!("Consumer failed: {err}");
    }
    res
}
