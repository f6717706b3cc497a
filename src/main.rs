use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bucketguard::config::{BucketguardConfig, LoggingConfig};
use bucketguard::ratelimit::{Decision, TokioScheduler};

/// Read one key per line from stdin and print an admission decision for each.
#[derive(Debug, Parser)]
#[command(name = "bucketguard", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Policy string, overrides the configured one (e.g. "3r/m,spam:5,block:12d")
    #[arg(short, long)]
    policy: Option<String>,

    /// Reject blocked keys outright
    #[arg(long)]
    enforce_blocks: bool,

    /// Print decisions as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct DecisionLine<'a> {
    key: &'a str,
    #[serde(flatten)]
    decision: Decision,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = BucketguardConfig::load(args.config.as_deref())?;
    if let Some(policy) = args.policy {
        config.limiter.policy = policy;
    }
    if args.enforce_blocks {
        config.limiter.enforce_blocks = true;
    }

    init_tracing(&config.logging);
    info!("Starting bucketguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let scheduler = TokioScheduler::current()?;
    let limiter = config.build_limiter(&scheduler)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let key = line.trim();
        if key.is_empty() {
            continue;
        }

        let decision = limiter.hit(key);
        let out = if args.json {
            serde_json::to_string(&DecisionLine { key, decision })?
        } else {
            match decision {
                Decision::Admitted => format!("{} admitted", key),
                Decision::Rejected { hits } => format!("{} rejected hits={}", key, hits),
                Decision::Blocked => format!("{} blocked", key),
            }
        };
        stdout.write_all(out.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    info!(tracked_keys = limiter.tracked_keys(), "bucketguard stopped");
    Ok(())
}
