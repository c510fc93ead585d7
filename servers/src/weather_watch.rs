use anyhow::Result;
use clap::Parser;
use lib_common::client::{ClientSession, HealthConfig};
use std::path::PathBuf;
use std::time::Duration;

#[path = "weather_logic/logger.rs"]
mod logger;

/// Headless subscriber: attaches to a running relay, watches station health
/// and logs what it sees.
#[derive(Parser, Debug)]
#[clap(about = "Weather relay health watcher", version)]
struct Args {
    #[clap(long, env = "WEATHER_STREAM_URL", default_value = "http://127.0.0.1:9003/events", help = "Push-stream URL of the relay.")]
    url: String,

    #[clap(long, env = "WEATHER_WATCH_SWEEP_SECS", value_parser = clap::value_parser!(u64).range(1..), default_value_t = 30, help = "Seconds between staleness sweeps.")]
    sweep_secs: u64,

    #[clap(long, env = "WEATHER_WATCH_STALE_SECS", value_parser = clap::value_parser!(u64).range(1..), default_value_t = 120, help = "Seconds without data before a station is stale.")]
    stale_secs: u64,

    #[clap(long, env = "WEATHER_WATCH_GRACE_SECS", value_parser = clap::value_parser!(u64).range(1..), default_value_t = 3, help = "Seconds to wait for the first station after attaching.")]
    grace_secs: u64,

    #[clap(long, env = "WEATHER_WATCH_RECONNECT_SECS", value_parser = clap::value_parser!(u64).range(1..), default_value_t = 5, help = "Seconds to wait before re-attaching after a stream error.")]
    reconnect_secs: u64,

    #[clap(long, env = "WEATHER_LOG_DIR", default_value = "./logs", help = "Directory for log files.")]
    log_dir: PathBuf,

    #[clap(long, env = "WEATHER_LOG_LEVEL", default_value = "info", help = "Logging level (trace, debug, info, warn, error).")]
    log_level: String,
}

impl Args {
    fn health_config(&self) -> HealthConfig {
        HealthConfig {
            sweep_interval: Duration::from_secs(self.sweep_secs),
            stale_after: Duration::from_secs(self.stale_secs),
            grace_period: Duration::from_secs(self.grace_secs),
            reconnect_delay: Duration::from_secs(self.reconnect_secs),
            ..HealthConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    logger::setup_logging("weather_watch", &args.log_dir, &args.log_level)?;

    let mut session = ClientSession::new(args.url.clone(), args.health_config())?;
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received, stopping.");
        }
        cancel.cancel();
    });

    log::info!("Watching {}", args.url);
    session.run().await;

    for event in session.monitor().recent_events() {
        log::info!("Recent {:?} from device {}", event.kind, event.device_id);
    }
    Ok(())
}
