use anyhow::Result;
use outreach_api::run as run_api;
use outreach_approval::run as run_auto_approval;
use outreach_core::{ChannelAdapter, Config, OutreachContext};
use outreach_delivery::CrmChannel;
use outreach_dispatch::run as run_dispatcher;
use std::sync::Arc;
use tokio;
use tracing;
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting outreach pipeline");

    let config = Config::from_env();
    let channel: Arc<dyn ChannelAdapter> = Arc::new(CrmChannel::new(&config.crm)?);
    let ctx = OutreachContext::new(config).await?;

    tracing::info!("Outreach context initialized");

    // interval 0 leaves the job to the HTTP trigger
    if ctx.config.dispatch.interval_secs > 0 {
        let ctx_clone = ctx.clone();
        let channel_clone = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_dispatcher(ctx_clone, channel_clone).await {
                tracing::error!("Dispatcher error: {}", e);
            }
        });
    }

    if ctx.config.approval.interval_secs > 0 {
        let ctx_clone = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_auto_approval(ctx_clone).await {
                tracing::error!("Auto-approval scheduler error: {}", e);
            }
        });
    }

    tracing::info!("Starting API server");
    run_api(ctx, channel).await?;

    Ok(())
}
