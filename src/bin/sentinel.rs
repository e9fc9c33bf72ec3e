use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use fleet_sentinel::{config::read_config_file, scheduler::Scheduler, util::get_config_path};
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Args {
    /// Config file (defaults to $SENTINEL_CONFIG or ./sentinel.json)
    #[arg(short, long)]
    file: Option<String>,

    /// Run one monitoring cycle per fleet, wait for recovery and exit
    #[arg(long)]
    once: bool,

    /// More output (-v debug, -vv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = filter::Targets::new().with_target("fleet_sentinel", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let path = args.file.unwrap_or_else(get_config_path);
    let config = read_config_file(&path)?;
    let scheduler = Scheduler::new(&config)
        .await
        .with_context(|| format!("failed to start from {path}"))?;

    if !args.once {
        scheduler.run_until_ctrl_c().await?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut failed = false;
    for run in scheduler.run_once().await {
        match run.result {
            Ok((cycle, sweep)) => {
                info!(
                    "{}: {} device(s), {} confirmed offline",
                    run.fleet_id,
                    cycle.device_count,
                    cycle.confirmed.len()
                );
                if let Some(sweep) = sweep {
                    info!("{}: {sweep}", run.fleet_id);
                }
            }
            Err(e) => {
                warn!("{}: {e:#}", run.fleet_id);
                failed = true;
            }
        }
    }

    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
