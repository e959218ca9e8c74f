use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use sqlx::{MySql, MySqlPool, Transaction};
use tracing::{error, info, warn};
use vercel_runtime::Error;

use crate::crypto::TokenCipher;
use crate::db::fetch_account;
use crate::order_agg;
use crate::providers::douyin::{DouyinClient, OrderMetrics, MAX_REPORT_ORDER_IDS};
use crate::token_refresh::account_access_token;
use crate::window::{floor5, platform_date};

/// One `order_stats` snapshot row.
#[derive(Debug, Clone, PartialEq)]
pub struct StatRow {
  pub item_id: String,
  pub stat_time: DateTime<Utc>,
  pub metrics: OrderMetrics,
}

/// First day of the current platform-local month through first day of the next.
pub fn report_date_range(now: DateTime<Utc>) -> (NaiveDate, NaiveDate) {
  let today = platform_date(now);
  let start = today.with_day(1).unwrap_or(today);
  let (year, month) = if start.month() == 12 {
    (start.year() + 1, 1)
  } else {
    (start.year(), start.month() + 1)
  };
  let end = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(start);
  (start, end)
}

/// Resolves the video id for a report row: the report's own value, then the stored order,
/// then the empty-string sentinel.
pub fn resolve_item_id(metrics: &OrderMetrics, known_items: &HashMap<String, String>) -> Option<String> {
  metrics
    .item_id
    .as_deref()
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .map(str::to_string)
    .or_else(|| {
      known_items
        .get(&metrics.order_id)
        .filter(|v| !v.is_empty())
        .cloned()
    })
}

/// Turns one report batch into snapshot rows at `stat_time`. Orders the report omitted get no row.
pub fn build_stat_rows(
  metrics: HashMap<String, OrderMetrics>,
  known_items: &HashMap<String, String>,
  stat_time: DateTime<Utc>,
) -> Vec<StatRow> {
  let mut rows: Vec<StatRow> = metrics
    .into_values()
    .map(|m| StatRow {
      item_id: resolve_item_id(&m, known_items).unwrap_or_default(),
      stat_time,
      metrics: m,
    })
    .collect();
  rows.sort_by(|a, b| a.metrics.order_id.cmp(&b.metrics.order_id));
  rows
}

async fn lookup_item_id(tx: &mut Transaction<'_, MySql>, order_id: &str) -> Result<Option<String>, Error> {
  let row = sqlx::query_as::<_, (String,)>(
    r#"
      SELECT item_id
      FROM orders
      WHERE order_id = ?
      LIMIT 1;
    "#,
  )
  .bind(order_id)
  .fetch_optional(&mut **tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;
  Ok(row.map(|(item_id,)| item_id).filter(|v| !v.is_empty()))
}

pub async fn upsert_stat_row(tx: &mut Transaction<'_, MySql>, row: &StatRow, synced_at: DateTime<Utc>) -> Result<(), Error> {
  let m = &row.metrics;
  sqlx::query(
    r#"
      INSERT INTO order_stats (
        order_id, item_id, stat_time,
        stat_cost, total_play, custom_like, dy_comment, dy_share, dy_follow,
        play_duration_5s_rank, dy_home_visited, dp_target_convert_cnt, custom_convert_cost,
        show_cnt, live_click_source_cnt, live_gift_uv, live_gift_amount,
        live_comment_cnt, live_follow_count, live_gift_cnt, sync_time
      )
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      ON DUPLICATE KEY UPDATE
        item_id = VALUES(item_id),
        stat_cost = VALUES(stat_cost),
        total_play = VALUES(total_play),
        custom_like = VALUES(custom_like),
        dy_comment = VALUES(dy_comment),
        dy_share = VALUES(dy_share),
        dy_follow = VALUES(dy_follow),
        play_duration_5s_rank = VALUES(play_duration_5s_rank),
        dy_home_visited = VALUES(dy_home_visited),
        dp_target_convert_cnt = VALUES(dp_target_convert_cnt),
        custom_convert_cost = VALUES(custom_convert_cost),
        show_cnt = VALUES(show_cnt),
        live_click_source_cnt = VALUES(live_click_source_cnt),
        live_gift_uv = VALUES(live_gift_uv),
        live_gift_amount = VALUES(live_gift_amount),
        live_comment_cnt = VALUES(live_comment_cnt),
        live_follow_count = VALUES(live_follow_count),
        live_gift_cnt = VALUES(live_gift_cnt),
        sync_time = VALUES(sync_time);
    "#,
  )
  .bind(&m.order_id)
  .bind(&row.item_id)
  .bind(row.stat_time)
  .bind(m.stat_cost)
  .bind(m.total_play)
  .bind(m.custom_like)
  .bind(m.dy_comment)
  .bind(m.dy_share)
  .bind(m.dy_follow)
  .bind(m.play_duration_5s_rank)
  .bind(m.dy_home_visited)
  .bind(m.dp_target_convert_cnt)
  .bind(m.custom_convert_cost)
  .bind(m.show_cnt)
  .bind(m.live_click_source_cnt)
  .bind(m.live_gift_uv)
  .bind(m.live_gift_amount)
  .bind(m.live_comment_cnt)
  .bind(m.live_follow_count)
  .bind(m.live_gift_cnt)
  .bind(synced_at)
  .execute(&mut **tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;
  Ok(())
}

async fn fetch_candidate_orders(
  pool: &MySqlPool,
  account_id: i64,
  synced_since: DateTime<Utc>,
) -> Result<Vec<(String, String)>, Error> {
  sqlx::query_as::<_, (String, String)>(
    r#"
      SELECT order_id, item_id
      FROM orders
      WHERE account_id = ?
        AND deleted = 0
        AND last_sync_time >= ?
      ORDER BY id ASC;
    "#,
  )
  .bind(account_id)
  .bind(synced_since)
  .fetch_all(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })
}

/// Snapshots report metrics for the account's recently synced orders into the window
/// containing `now`, then refreshes the account's order roll-up.
pub async fn sync_account_stats(
  pool: &MySqlPool,
  client: &DouyinClient,
  cipher: &TokenCipher,
  window_days: i64,
  account_id: i64,
  now: DateTime<Utc>,
) -> Result<u64, Error> {
  let account = fetch_account(pool, account_id).await?.ok_or_else(|| -> Error {
    Box::new(std::io::Error::other(format!("account {account_id} not found")))
  })?;

  let candidates = fetch_candidate_orders(pool, account_id, now - Duration::days(window_days)).await?;
  if candidates.is_empty() {
    info!(account_id, "no recently synced orders; skipping stats");
    return Ok(0);
  }

  let access_token = account_access_token(cipher, &account)?;
  let (begin_date, end_date) = report_date_range(now);
  let stat_time = floor5(now);

  let order_ids: Vec<String> = candidates.iter().map(|(order_id, _)| order_id.clone()).collect();
  let known_items: HashMap<String, String> = candidates.into_iter().collect();

  let mut total_saved = 0u64;
  for (batch_idx, batch) in order_ids.chunks(MAX_REPORT_ORDER_IDS).enumerate() {
    let metrics = client
      .get_metrics(&access_token, &account.aweme_sec_uid, Some(batch), begin_date, end_date)
      .await
      .map_err(|e| -> Error { Box::new(e) })?;
    if metrics.is_empty() {
      continue;
    }

    let synced_at = Utc::now();
    let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;
    for mut row in build_stat_rows(metrics, &known_items, stat_time) {
      if row.item_id.is_empty() {
        match lookup_item_id(&mut tx, &row.metrics.order_id).await {
          Ok(Some(item_id)) => row.item_id = item_id,
          Ok(None) => {}
          Err(err) => warn!(account_id, order_id = %row.metrics.order_id, error = %err, "item_id lookup failed"),
        }
      }
      match upsert_stat_row(&mut tx, &row, synced_at).await {
        Ok(()) => total_saved += 1,
        Err(err) => warn!(account_id, order_id = %row.metrics.order_id, error = %err, "failed to save order stats"),
      }
    }
    tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;
    info!(account_id, batch = batch_idx + 1, size = batch.len(), "stats batch committed");
  }

  info!(account_id, %stat_time, rows = total_saved, "stats sync finished");

  if let Err(err) = order_agg::aggregate_account(pool, account_id).await {
    error!(account_id, error = %err, "order roll-up after stats sync failed");
  }

  Ok(total_saved)
}
