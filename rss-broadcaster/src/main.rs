use anyhow::Context;
use clap::Parser;
use rss_broadcaster::{load_marks, save_marks, BroadcastPipeline, Config, RunContext, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rss-broadcaster")]
#[command(about = "Poll RSS feeds and reddit, forward new posts to a Lark bot")]
struct Args {
    /// Path to config file
    #[arg(long, default_value = "config.toml")]
    conf: PathBuf,

    /// Path to watermark file
    #[arg(long = "x-mark", default_value = "x-mark.json")]
    x_mark: PathBuf,

    /// Run once and exit instead of following the schedule
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rss_broadcaster=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let config = Config::load(&args.conf).with_context(|| format!("loading config from {}", args.conf.display()))?;
    let marks = Arc::new(load_marks(&args.x_mark).with_context(|| format!("loading watermarks from {}", args.x_mark.display()))?);

    let pipeline = BroadcastPipeline::from_config(&config, Arc::clone(&marks))
        .context("building pipeline")?
        .persist_to(args.x_mark.clone());

    if args.once {
        let ctx = RunContext::with_timeout(config.run_timeout());
        pipeline.run_once(&ctx).await;
        save_marks(&args.x_mark, &marks).context("saving watermarks")?;
        return Ok(());
    }

    let scheduler = Scheduler::new(config.trigger()?, config.run_timeout());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!("RSS Broadcaster started ({})", config.cron.interval);
    let runner = tokio::spawn(async move {
        let pipeline = &pipeline;
        scheduler
            .run(
                move |ctx| async move {
                    pipeline.run_once(&ctx).await;
                },
                shutdown_rx,
            )
            .await;
    });

    shutdown_signal().await;
    info!("Received shutdown signal, flushing watermarks");

    let _ = shutdown_tx.send(true);
    if let Err(e) = runner.await {
        error!("Scheduler task ended abnormally: {}", e);
    }

    save_marks(&args.x_mark, &marks).context("saving watermarks")?;
    info!("RSS Broadcaster stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
