use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sqlx::MySqlPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use vercel_runtime::Error;

use crate::config::SyncConfig;
use crate::crypto::TokenCipher;
use crate::db::{fetch_active_accounts, get_pool};
use crate::order_sync::sync_account_orders;
use crate::providers::douyin::DouyinClient;
use crate::stats_sync::sync_account_stats;
use crate::sync_task::{
  claim_pending_details, complete_detail, fail_detail, reclaim_stale_details, ClaimedDetail, SyncMode, TaskType,
};

/// Everything a unit of sync work needs. Cheap to clone.
#[derive(Clone)]
pub struct SyncContext {
  pub pool: MySqlPool,
  pub cfg: SyncConfig,
  pub client: DouyinClient,
  pub cipher: TokenCipher,
}

impl SyncContext {
  pub fn new(pool: MySqlPool, cfg: SyncConfig) -> Result<Self, Error> {
    let client = DouyinClient::from_config(&cfg).map_err(|e| -> Error { Box::new(e) })?;
    let cipher = TokenCipher::from_key_material(cfg.encryption_key()?).map_err(|e| -> Error { Box::new(e) })?;
    Ok(Self {
      pool,
      cfg,
      client,
      cipher,
    })
  }

  pub async fn from_env() -> Result<Self, Error> {
    let cfg = SyncConfig::from_env();
    let pool = get_pool().await?.clone();
    Self::new(pool, cfg)
  }
}

/// Runs `f` over `items` with at most `concurrency` futures in flight.
/// Results come back in input order; a panicked unit is logged and omitted.
pub async fn run_bounded<T, R, F, Fut>(items: Vec<T>, concurrency: usize, f: F) -> Vec<R>
where
  F: Fn(T) -> Fut,
  Fut: Future<Output = R> + Send + 'static,
  R: Send + 'static,
{
  let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
  let total = items.len();
  let mut set = JoinSet::new();

  for (idx, item) in items.into_iter().enumerate() {
    let semaphore = Arc::clone(&semaphore);
    let unit = f(item);
    set.spawn(async move {
      let _permit = semaphore.acquire_owned().await;
      (idx, unit.await)
    });
  }

  let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
  while let Some(joined) = set.join_next().await {
    match joined {
      Ok((idx, result)) => slots[idx] = Some(result),
      Err(err) => error!(error = %err, "sync unit panicked"),
    }
  }
  slots.into_iter().flatten().collect()
}

/// One account's share of a sync run.
pub async fn run_unit(ctx: &SyncContext, task_type: TaskType, mode: SyncMode, account_id: i64) -> Result<u64, Error> {
  match task_type {
    TaskType::Order => {
      sync_account_orders(&ctx.pool, &ctx.client, &ctx.cipher, ctx.cfg.page_size, account_id, mode).await
    }
    TaskType::Stats => {
      sync_account_stats(
        &ctx.pool,
        &ctx.client,
        &ctx.cipher,
        ctx.cfg.stats_window_days,
        account_id,
        Utc::now(),
      )
      .await
    }
  }
}

async fn execute_detail(ctx: &SyncContext, detail: &ClaimedDetail) -> bool {
  let outcome = run_unit(ctx, detail.task_type, detail.mode, detail.account_id).await;
  let (succeeded, recorded) = match outcome {
    Ok(records) => {
      info!(task_id = detail.task_id, account_id = detail.account_id, records, "sync unit completed");
      (true, complete_detail(&ctx.pool, detail, records).await)
    }
    Err(err) => {
      error!(task_id = detail.task_id, account_id = detail.account_id, error = %err, "sync unit failed");
      (false, fail_detail(&ctx.pool, detail, &err.to_string()).await)
    }
  };

  if let Err(err) = recorded {
    error!(task_id = detail.task_id, detail_id = detail.detail_id, error = %err, "failed to record unit outcome");
  }
  succeeded
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
  pub reclaimed: usize,
  pub claimed: usize,
  pub succeeded: usize,
  pub failed: usize,
}

/// Fails details abandoned past their lease, then claims up to `limit` pending details and
/// runs them on the bounded pool.
pub async fn run_tick(ctx: &SyncContext, limit: i64) -> Result<TickSummary, Error> {
  let reclaimed = reclaim_stale_details(&ctx.pool, Utc::now(), ctx.cfg.detail_lease_secs).await?;
  let claimed = claim_pending_details(&ctx.pool, limit).await?;
  if claimed.is_empty() {
    return Ok(TickSummary {
      reclaimed,
      ..TickSummary::default()
    });
  }

  let claimed_count = claimed.len();
  let outcomes = run_bounded(claimed, ctx.cfg.worker_concurrency, move |detail| {
    let ctx = ctx.clone();
    async move { execute_detail(&ctx, &detail).await }
  })
  .await;

  let succeeded = outcomes.iter().filter(|ok| **ok).count();
  let summary = TickSummary {
    reclaimed,
    claimed: claimed_count,
    succeeded,
    failed: claimed_count - succeeded,
  };
  info!(reclaimed = summary.reclaimed, claimed = summary.claimed, succeeded = summary.succeeded, failed = summary.failed, "worker tick finished");
  Ok(summary)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanoutSummary {
  pub accounts: usize,
  pub succeeded: usize,
  pub failed: usize,
  pub records: u64,
}

impl FanoutSummary {
  fn from_outcomes(outcomes: &[Result<u64, String>]) -> Self {
    let mut summary = FanoutSummary {
      accounts: outcomes.len(),
      ..FanoutSummary::default()
    };
    for outcome in outcomes {
      match outcome {
        Ok(records) => {
          summary.succeeded += 1;
          summary.records += records;
        }
        Err(_) => summary.failed += 1,
      }
    }
    summary
  }
}

/// Scheduled sync across every active account, without task bookkeeping.
pub async fn sync_all_accounts(ctx: &SyncContext, task_type: TaskType, mode: SyncMode) -> Result<FanoutSummary, Error> {
  let accounts = fetch_active_accounts(&ctx.pool).await?;
  let account_ids: Vec<i64> = accounts.iter().map(|a| a.id).collect();

  let outcomes = run_bounded(account_ids, ctx.cfg.worker_concurrency, move |account_id| {
    let ctx = ctx.clone();
    async move {
      run_unit(&ctx, task_type, mode, account_id).await.map_err(|err| {
        warn!(account_id, task_type = task_type.as_str(), error = %err, "scheduled account sync failed");
        err.to_string()
      })
    }
  })
  .await;

  let summary = FanoutSummary::from_outcomes(&outcomes);
  info!(
    task_type = task_type.as_str(),
    mode = mode.as_str(),
    accounts = summary.accounts,
    succeeded = summary.succeeded,
    failed = summary.failed,
    records = summary.records,
    "scheduled sync finished"
  );
  Ok(summary)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync_task::{TaskProgress, TaskStatus};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn never_exceeds_the_concurrency_bound() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let results = run_bounded((0..20).collect::<Vec<u64>>(), 3, |n| {
      let in_flight = Arc::clone(&in_flight);
      let peak = Arc::clone(&peak);
      async move {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);
        n * 2
      }
    })
    .await;

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(results, (0..20).map(|n| n * 2).collect::<Vec<u64>>());
  }

  #[tokio::test]
  async fn zero_concurrency_still_makes_progress() {
    let results = run_bounded(vec![1, 2, 3], 0, |n| async move { n + 1 }).await;
    assert_eq!(results, vec![2, 3, 4]);
  }

  #[tokio::test]
  async fn one_failing_account_of_five_fails_the_task() {
    let outcomes = run_bounded((1..=5).collect::<Vec<i64>>(), 2, |account_id| async move {
      if account_id == 3 {
        Err(format!("account {account_id}: douyin api error code=50000: internal error"))
      } else {
        Ok(account_id as u64 * 10)
      }
    })
    .await;

    let details: Vec<(TaskStatus, i64)> = outcomes
      .iter()
      .map(|o| match o {
        Ok(records) => (TaskStatus::Completed, *records as i64),
        Err(_) => (TaskStatus::Failed, 0),
      })
      .collect();
    let progress = TaskProgress::from_details(5, &details);

    assert_eq!(progress.terminal_status, Some(TaskStatus::Failed));
    assert_eq!(details.iter().filter(|(s, _)| *s == TaskStatus::Completed).count(), 4);
    assert_eq!(details.iter().filter(|(s, _)| *s == TaskStatus::Failed).count(), 1);
    assert_eq!(progress.fail_count, 1);

    let fanout = FanoutSummary::from_outcomes(&outcomes);
    assert_eq!(fanout.accounts, 5);
    assert_eq!(fanout.failed, 1);
    assert_eq!(fanout.records, 10 + 20 + 40 + 50);
  }
}
