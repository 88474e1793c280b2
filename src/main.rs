use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use table_mailer::config;
use table_mailer::job::JobRunner;
use table_mailer::scheduler::Scheduler;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about = "Mail database tables as spreadsheet attachments on a schedule")]
struct Args {
    /// Path to YAML or JSON config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run the job once immediately and exit instead of scheduling it
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    info!(posts = cfg.post.len(), schedule = %cfg.time, "configuration loaded");

    let schedule = cfg.schedule()?;
    let runner = JobRunner::new(cfg);

    if args.once {
        let report = runner.run_once().await?;
        info!(?report, "single run finished");
        return Ok(());
    }

    let scheduler = Scheduler::new(schedule, runner);
    let handle = scheduler.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; stopping after the current run");
                handle.stop();
            }
            Err(err) => error!(?err, "failed to listen for interrupt"),
        }
    });

    info!("starting scheduler");
    scheduler.run().await;
    Ok(())
}
