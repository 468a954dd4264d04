use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use streamgen::{
    config::{
        self, Config, DEFAULT_FIELD, DEFAULT_MESSAGES, DEFAULT_REDIS_URL, DEFAULT_SLEEP_SECONDS,
        DEFAULT_STREAM, DEFAULT_THREADS, Target,
    },
    generator::{self, Generator},
    store::{self, RedisConnector},
};
use tokio::runtime::Builder;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid arguments: {0}")]
    Config(#[from] config::Error),
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error("Generator returned an error: {0}")]
    Generator(#[from] generator::Error),
    #[error("Failed to install Prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

/// Send messages to a Redis stream
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// number of workers, each with its own connection
    #[clap(long, default_value_t = DEFAULT_THREADS, value_parser = clap::value_parser!(u16).range(1..))]
    threads: u16,
    /// number of messages each worker sends
    #[clap(long, default_value_t = DEFAULT_MESSAGES)]
    messages: u64,
    /// sleep time between messages in seconds; accepted but not applied,
    /// pauses are drawn uniformly from [0, 1) seconds
    #[clap(long, default_value_t = DEFAULT_SLEEP_SECONDS, allow_negative_numbers = true)]
    sleep: f64,
    /// the Redis server to write to
    #[clap(long, default_value_t = DEFAULT_REDIS_URL.to_string())]
    redis_url: String,
    /// the stream key to append to
    #[clap(long, default_value_t = DEFAULT_STREAM.to_string())]
    stream: String,
    /// the field name carrying each message label
    #[clap(long, default_value_t = DEFAULT_FIELD.to_string())]
    field: String,
    /// seed for the random pauses, random when absent
    #[clap(long)]
    seed: Option<u64>,
    /// address to expose Prometheus metrics on
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
}

fn get_config(args: &Args) -> Result<Config, config::Error> {
    let target = Target {
        url: args.redis_url.clone(),
        stream: args.stream.clone(),
        field: args.field.clone(),
    };
    Ok(Config::new(args.threads, args.messages, args.sleep, target)?.with_seed(args.seed))
}

async fn inner_main(config: Config, prometheus_addr: Option<SocketAddr>) -> Result<(), Error> {
    if let Some(addr) = prometheus_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("serving metrics on {addr}");
    }

    let connector = Arc::new(RedisConnector::new(&config.target().url)?);
    info!(
        "sending {messages} messages from each of {threads} workers to stream {stream} at {url}",
        messages = config.messages(),
        threads = config.threads(),
        stream = config.target().stream,
        url = connector.url(),
    );

    let report = Generator::new(&config, connector).spin().await?;
    info!(
        "{workers} workers appended {appended} messages",
        workers = report.workers,
        appended = report.appended
    );
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting streamgen {version} run.");

    let args = Args::parse();
    let config = get_config(&args)?;

    let runtime = Builder::new_multi_thread()
        .worker_threads(usize::from(config.threads().get()))
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, args.prometheus_addr));
    if let Err(ref err) = res {
        error!("Run failed: {err}");
    }
    info!("Bye. :)");
    res
}
