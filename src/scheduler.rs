use std::future::Future;
use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use vercel_runtime::Error;

use crate::sync_task::{SyncMode, TaskType};
use crate::token_refresh::refresh_expiring_tokens;
use crate::video_agg::aggregate_current_window;
use crate::worker::{run_tick, sync_all_accounts, SyncContext};

/// Seconds-resolution cron expressions. Each stage trails its producer by a minute.
pub const ORDER_SYNC_CRON: &str = "0 0/5 * * * *";
pub const STATS_SYNC_CRON: &str = "0 1/5 * * * *";
pub const VIDEO_AGG_CRON: &str = "0 2/5 * * * *";
pub const WORKER_TICK_CRON: &str = "*/15 * * * * *";
/// Jobs fire in UTC; 18:00 UTC is 02:00 platform time.
pub const TOKEN_REFRESH_CRON: &str = "0 0 18 * * *";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  OrderSync,
  StatsSync,
  VideoAgg,
  WorkerTick,
  TokenRefresh,
}

impl Stage {
  pub const ALL: [Stage; 5] = [
    Stage::OrderSync,
    Stage::StatsSync,
    Stage::VideoAgg,
    Stage::WorkerTick,
    Stage::TokenRefresh,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Stage::OrderSync => "order_sync",
      Stage::StatsSync => "stats_sync",
      Stage::VideoAgg => "video_agg",
      Stage::WorkerTick => "worker_tick",
      Stage::TokenRefresh => "token_refresh",
    }
  }

  pub fn cron(self) -> &'static str {
    match self {
      Stage::OrderSync => ORDER_SYNC_CRON,
      Stage::StatsSync => STATS_SYNC_CRON,
      Stage::VideoAgg => VIDEO_AGG_CRON,
      Stage::WorkerTick => WORKER_TICK_CRON,
      Stage::TokenRefresh => TOKEN_REFRESH_CRON,
    }
  }
}

/// Runs one stage to completion and returns a one-line outcome for logs and HTTP replies.
pub async fn run_stage(ctx: &SyncContext, stage: Stage) -> Result<serde_json::Value, Error> {
  let outcome = match stage {
    Stage::OrderSync => serde_json::to_value(sync_all_accounts(ctx, TaskType::Order, SyncMode::Incremental).await?)?,
    Stage::StatsSync => serde_json::to_value(sync_all_accounts(ctx, TaskType::Stats, SyncMode::Incremental).await?)?,
    Stage::VideoAgg => serde_json::json!({ "videos": aggregate_current_window(&ctx.pool).await? }),
    Stage::WorkerTick => serde_json::to_value(run_tick(ctx, ctx.cfg.tick_limit).await?)?,
    Stage::TokenRefresh => {
      serde_json::to_value(refresh_expiring_tokens(&ctx.pool, &ctx.cfg, &ctx.client, &ctx.cipher).await?)?
    }
  };
  Ok(outcome)
}

fn stage_job<F, Fut>(cron: &str, name: &'static str, ctx: Arc<SyncContext>, body: F) -> Result<Job, Error>
where
  F: Fn(Arc<SyncContext>) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<serde_json::Value, Error>> + Send + 'static,
{
  let body = Arc::new(body);
  Job::new_async(cron, move |_uuid, _lock| {
    let ctx = Arc::clone(&ctx);
    let body = Arc::clone(&body);
    Box::pin(async move {
      info!(job = name, "scheduled job starting");
      match body(ctx).await {
        Ok(outcome) => info!(job = name, %outcome, "scheduled job finished"),
        Err(err) => error!(job = name, error = %err, "scheduled job failed"),
      }
    })
  })
  .map_err(|e| -> Error { Box::new(e) })
}

/// Registers every stage on a fresh scheduler. The caller starts and shuts it down.
pub async fn build_scheduler(ctx: Arc<SyncContext>) -> Result<JobScheduler, Error> {
  let scheduler = JobScheduler::new().await.map_err(|e| -> Error { Box::new(e) })?;

  for stage in Stage::ALL {
    let job = stage_job(stage.cron(), stage.name(), Arc::clone(&ctx), move |ctx| async move {
      run_stage(&ctx, stage).await
    })?;
    scheduler.add(job).await.map_err(|e| -> Error { Box::new(e) })?;
    info!(job = stage.name(), cron = stage.cron(), "scheduled job registered");
  }

  Ok(scheduler)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::window::PLATFORM_UTC_OFFSET_HOURS;

  #[test]
  fn stages_are_staggered_within_each_five_minute_slot() {
    let minute_field = |expr: &str| expr.split_whitespace().nth(1).unwrap_or("").to_string();
    assert_eq!(minute_field(ORDER_SYNC_CRON), "0/5");
    assert_eq!(minute_field(STATS_SYNC_CRON), "1/5");
    assert_eq!(minute_field(VIDEO_AGG_CRON), "2/5");
  }

  #[test]
  fn token_refresh_runs_at_two_in_the_morning_platform_time() {
    let fields: Vec<&str> = TOKEN_REFRESH_CRON.split_whitespace().collect();
    assert_eq!(&fields[..2], &["0", "0"]);
    let utc_hour: i64 = fields[2].parse().unwrap();
    assert_eq!((utc_hour + PLATFORM_UTC_OFFSET_HOURS) % 24, 2);
  }

  #[test]
  fn every_stage_has_a_six_field_cron() {
    for stage in Stage::ALL {
      assert_eq!(stage.cron().split_whitespace().count(), 6, "{}", stage.name());
    }
  }

  #[tokio::test]
  async fn cron_expressions_are_accepted_by_the_scheduler() {
    for stage in Stage::ALL {
      let job = Job::new_async(stage.cron(), |_uuid, _lock| Box::pin(async {}));
      assert!(job.is_ok(), "{} rejected", stage.name());
    }
  }
}
