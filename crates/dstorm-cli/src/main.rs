//! 🚀 dstorm-cli: the front door, the bouncer, the maitre d' of dstorm.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Thin wrapper: parse args, set up logging, load config, then let the
//! library do the heavy lifting. Like a manager. 🦆

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dstorm::Outcome;
use dstorm::backends::BrokerError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 🌩️ Throw synthetic tweets at a message queue and see who blinks first.
#[derive(Debug, Parser)]
#[command(name = "dstorm", version, about)]
struct Cli {
    /// 🔧 TOML config file; env vars (DSTORM_*) and the preset fill in the rest
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 🚀 run the adaptive producer pool until the target is reached
    Produce,
    /// 📥 run the intake pool until interrupted
    Consume,
    /// 🔁 run both over an in-process broker
    Pipeline,
}

/// 🚀 main(): where it all begins. The "I pressed F5 and held my breath" moment.
#[tokio::main]
async fn main() -> ExitCode {
    // 📡 println! debugging is a lifestyle choice we're trying to move past
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            // 🗑️ Exit with prejudice. Process exitus maximus.
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // 🔒 Validate the config file exists before we get too emotionally attached
    if let Some(path) = cli.config.as_deref() {
        let exists = path.try_exists().with_context(|| {
            format!(
                "💀 Couldn't check whether the configuration file exists. If it's a relative path, \
                 try an absolute one, to be absolutely certain. Was checking here: '{}'",
                path.display()
            )
        })?;
        if !exists {
            anyhow::bail!(
                "💀 Configuration file '{}' does not exist. We looked under the couch and everything.",
                path.display()
            );
        }
    }

    let app_config = dstorm::app_config::load_config(cli.config.as_deref())
        .context("💀 Couldn't load the config. Take a look at the file; make sure you didn't forget something obvious")?;

    // 🚀 SEND IT. No take-backs.
    let outcome = match cli.command {
        Command::Produce => {
            let summary = dstorm::run_producer(app_config).await?;
            info!(total = summary.total_sent, elapsed_secs = summary.elapsed.as_secs_f64(), "✅ producer done");
            summary.outcome
        }
        Command::Consume => {
            let summary = dstorm::run_consumer(app_config).await?;
            info!(
                consumed = summary.total_consumed,
                flushed = summary.total_flushed,
                "✅ consumer done"
            );
            summary.outcome
        }
        Command::Pipeline => {
            let (produced, consumed) = dstorm::run_pipeline(app_config).await?;
            info!(
                sent = produced.total_sent,
                consumed = consumed.total_consumed,
                flushed = consumed.total_flushed,
                "✅ pipeline done"
            );
            if produced.outcome == Outcome::ForcedTimeout {
                Outcome::ForcedTimeout
            } else {
                consumed.outcome
            }
        }
    };

    Ok(match outcome {
        Outcome::Graceful => ExitCode::SUCCESS,
        Outcome::ForcedTimeout => {
            error!("💀 shutdown timed out; some workers had to be dragged out");
            ExitCode::FAILURE
        }
    })
}

// -- 🧅 peel the onion of sadness, one layer at a time
fn report_error(err: &anyhow::Error) {
    error!("💀 error: {err}");
    let mut the_vibes_are_giving_connection_issues = false;
    for cause in err.chain().skip(1) {
        error!("⚠️  cause: {cause}");
        // -- 🕵️ the broker classifies its own errors; the sink's HTTP client needs a sniff
        let broker_says_so = cause
            .downcast_ref::<BrokerError>()
            .is_some_and(|broker_err| broker_err.kind.is_transient_connection());
        let cause_str = cause.to_string();
        let http_says_so = cause_str.contains("error sending request")
            || cause_str.contains("onnection refused")
            || cause_str.contains("dns error");
        if broker_says_so || http_says_so {
            the_vibes_are_giving_connection_issues = true;
        }
    }
    if the_vibes_are_giving_connection_issues {
        error!(
            "🔧 hint: looks like the broker or the sink isn't reachable. Double-check that it's actually \
             running. If you're using Docker, `docker ps` to see what's up, or \
             `docker compose up -d` to resurrect it. Even servers need a nudge sometimes. ☕"
        );
    }
}
