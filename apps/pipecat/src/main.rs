mod config;

use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use config::PipecatConfig;
use pipecat_broker_amqp::{endpoint_label, AmqpBroker, AmqpBrokerConfig, AmqpCloser};
use pipecat_node::config::AckSourceKind;
use pipecat_node::mode::ModeSelection;
use pipecat_node::pending::KeyStrategy;
use pipecat_node::service::{run_bridge, BridgeError, BridgeIo, BridgeReport};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

/// Exit status after SIGINT/SIGTERM.
const EXIT_SIGNALLED: i32 = 130;

/// Pipe standard input lines into an AMQP queue, or tail a queue to standard output.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Queue to publish to or consume from
    queue: Option<String>,
    /// Broker URI
    #[arg(long = "amqpUri", visible_alias = "amqp-uri", env = "AMQP_URI")]
    amqp_uri: Option<String>,
    /// auto, publish or consume (auto consumes when stdin is a terminal)
    #[arg(long)]
    mode: Option<ModeSelection>,
    /// How pending deliveries are keyed: content or delivery-tag
    #[arg(long)]
    pending_key: Option<KeyStrategy>,
    /// Where ack commands come from: none, stdin or queue:<name>
    #[arg(long)]
    ack_source: Option<AckSourceKind>,
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Queue to bridge; an empty name counts as missing.
    fn queue_name(&self) -> Option<&str> {
        self.queue.as_deref().filter(|name| !name.is_empty())
    }

    /// Flags win over file and environment settings.
    fn apply_to(&self, config: &mut PipecatConfig) {
        if let Some(uri) = &self.amqp_uri {
            config.amqp_uri = uri.clone();
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(key) = self.pending_key {
            config.pending_key = key;
        }
        if let Some(source) = &self.ack_source {
            config.ack_source = source.clone();
        }
    }
}

/// A signal wins over the run's own outcome.
fn exit_status(signalled: bool, failed: bool) -> i32 {
    if signalled {
        EXIT_SIGNALLED
    } else if failed {
        1
    } else {
        0
    }
}

fn watch_signals(closer: AmqpCloser, signalled: Arc<AtomicBool>) -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new()
        .name("pipecat-signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                signalled.store(true, Ordering::SeqCst);
                info!("signal {signal} received, closing broker session");
                if let Err(err) = closer.close() {
                    warn!("close after signal failed: {err}");
                }
                std::process::exit(EXIT_SIGNALLED);
            }
        })?;
    Ok(())
}

fn main() {
    let filter = std::env::var("PIPECAT_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let Some(queue) = cli.queue_name().map(str::to_string) else {
        println!("Please provide name of the queue");
        std::process::exit(1);
    };

    let mut config = match PipecatConfig::new(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };
    cli.apply_to(&mut config);

    let mode = config.mode.resolve_for_stdin();
    let bridge_config = config.to_bridge_config();
    if let Ok(endpoint) = endpoint_label(&config.amqp_uri) {
        info!("pipecat: {mode} on queue {queue} via {endpoint}");
    }

    let mut broker = match AmqpBroker::connect(AmqpBrokerConfig::new(config.amqp_uri.as_str())) {
        Ok(broker) => broker,
        Err(err) => {
            error!("{}", BridgeError::from_connect(err));
            std::process::exit(1);
        }
    };
    let signalled = Arc::new(AtomicBool::new(false));
    if let Err(err) = watch_signals(broker.closer(), Arc::clone(&signalled)) {
        warn!("signal handling unavailable: {err}");
    }

    // Unlocked handles: the ack worker and the log writer share stderr.
    let mut output = io::stdout();
    let mut diagnostics = io::stderr();
    let result = run_bridge(
        &mut broker,
        &queue,
        mode,
        &bridge_config,
        BridgeIo {
            input: Box::new(BufReader::new(io::stdin())),
            output: &mut output,
            diagnostics: &mut diagnostics,
        },
    );

    let failed = match result {
        Ok(BridgeReport::Published(stats)) => {
            info!(
                "published {} lines ({} bytes)",
                stats.lines_published, stats.bytes_published
            );
            false
        }
        Ok(BridgeReport::Consumed { stats, pending, .. }) => {
            let backlog = pending.lock().map(|set| set.len()).unwrap_or_default();
            info!(
                "subscription ended: delivered={}, redelivered={}, collisions={}, still pending={backlog}",
                stats.delivered, stats.redelivered, stats.collisions
            );
            false
        }
        Err(err) if signalled.load(Ordering::SeqCst) => {
            info!("bridge stopped by signal: {err}");
            true
        }
        Err(err) => {
            error!("{err}");
            true
        }
    };

    // Waits for a close already started by the signal watcher.
    drop(broker);
    std::process::exit(exit_status(signalled.load(Ordering::SeqCst), failed));
}
