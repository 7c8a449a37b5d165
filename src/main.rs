use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use rednote_sync::clients::{
    OpenAiTranslator, PublishClient, TwitterSource, WechatPublisher, XhsBridgePublisher,
};
use rednote_sync::config::{self, Config};
use rednote_sync::coordinator::{Collaborators, Coordinator, PipelineSettings};
use rednote_sync::db;
use rednote_sync::model::Destination;

#[derive(Debug, Parser)]
#[command(author, version, about = "Sync new X posts to XHS and WeChat")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single fetch tick, wait for the pipeline to drain and exit
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
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let coordinator = Coordinator::new(
        pool,
        PipelineSettings::from_config(&cfg),
        build_collaborators(&cfg)?,
    )?;

    let resumed = coordinator.resume().await?;
    info!(resumed, "starting sync pipeline");

    if args.once {
        if let Err(err) = coordinator.trigger_fetch().await {
            error!(?err, "fetch tick failed");
        }
        coordinator.wait_idle().await;
        return Ok(());
    }

    // Ctrl-C also interrupts a tick waiting in fetch backoff.
    let signal_handle = coordinator.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(?err, "failed to listen for Ctrl-C");
            return;
        }
        signal_handle.shutdown();
    });

    let mut ticker = tokio::time::interval(cfg.fetch_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = coordinator.trigger_fetch().await {
                    error!(?err, "fetch tick failed");
                }
            }
            _ = coordinator.shutdown_requested() => break,
        }
    }

    info!("waiting for in-flight calls to finish");
    coordinator.wait_idle().await;
    info!("stopped");
    Ok(())
}

fn build_collaborators(cfg: &Config) -> Result<Collaborators> {
    let timeout = cfg.stage_timeout();
    let mut publishers: Vec<Arc<dyn PublishClient>> = Vec::new();
    for destination in &cfg.destinations.enabled {
        match destination {
            Destination::Xhs => {
                if let Some(xhs) = &cfg.destinations.xhs {
                    publishers.push(Arc::new(XhsBridgePublisher::from_config(xhs, timeout)?));
                }
            }
            Destination::Wechat => {
                if let Some(wechat) = &cfg.destinations.wechat {
                    publishers.push(Arc::new(WechatPublisher::from_config(wechat, timeout)?));
                }
            }
        }
    }
    Ok(Collaborators {
        source: Arc::new(TwitterSource::from_config(&cfg.source, timeout)?),
        translator: Arc::new(OpenAiTranslator::from_config(&cfg.translator, timeout)?),
        publishers,
    })
}
