use std::sync::Arc;

use tracing::info;
use vercel_runtime::Error;

use douplus_sync::scheduler::build_scheduler;
use douplus_sync::telemetry::init_tracing;
use douplus_sync::worker::SyncContext;

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();

  let ctx = Arc::new(SyncContext::from_env().await?);
  info!(
    api_base_url = %ctx.cfg.api_base_url,
    worker_concurrency = ctx.cfg.worker_concurrency,
    tick_limit = ctx.cfg.tick_limit,
    "douplus sync daemon starting"
  );

  let mut scheduler = build_scheduler(Arc::clone(&ctx)).await?;
  scheduler.start().await.map_err(|e| -> Error { Box::new(e) })?;
  info!("scheduler started; waiting for ctrl-c");

  tokio::signal::ctrl_c().await?;
  info!("shutdown requested");

  scheduler.shutdown().await.map_err(|e| -> Error { Box::new(e) })?;
  ctx.pool.close().await;
  info!("douplus sync daemon stopped");
  Ok(())
}
