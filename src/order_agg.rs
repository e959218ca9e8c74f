use chrono::{DateTime, Utc};
use sqlx::MySqlPool;
use tracing::info;
use vercel_runtime::Error;

use crate::metrics::{derive, Totals};

/// Lifetime sums of an order's snapshots, as read from `order_stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSums {
  pub order_id: String,
  pub item_id: String,
  pub account_id: i64,
  pub total_cost: f64,
  pub total_play: i64,
  pub total_like: i64,
  pub total_comment: i64,
  pub total_share: i64,
  pub total_follow: i64,
  pub total_convert: i64,
  pub play_duration_5s: f64,
  pub stat_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAggRow {
  pub sums: OrderSums,
  pub play_per_100_cost: f64,
  pub avg_convert_cost: Option<f64>,
  pub share_rate: f64,
  pub like_rate: f64,
}

pub fn summarize(sums: OrderSums) -> OrderAggRow {
  let derived = derive(&Totals {
    cost: sums.total_cost,
    plays: sums.total_play,
    likes: sums.total_like,
    shares: sums.total_share,
    conversions: sums.total_convert,
  });
  OrderAggRow {
    play_per_100_cost: derived.play_per_100_cost,
    avg_convert_cost: derived.avg_convert_cost,
    share_rate: derived.share_rate,
    like_rate: derived.like_rate,
    sums,
  }
}

type SumsTuple = (String, String, i64, f64, i64, i64, i64, i64, i64, i64, f64, DateTime<Utc>);

async fn fetch_order_sums(pool: &MySqlPool, account_id: Option<i64>) -> Result<Vec<OrderSums>, Error> {
  let rows = sqlx::query_as::<_, SumsTuple>(
    r#"
      SELECT s.order_id,
             COALESCE(MAX(NULLIF(s.item_id, '')), MAX(o.item_id), '') AS item_id,
             o.account_id,
             CAST(COALESCE(SUM(s.stat_cost), 0) AS DOUBLE) AS total_cost,
             CAST(COALESCE(SUM(s.total_play), 0) AS SIGNED) AS total_play,
             CAST(COALESCE(SUM(s.custom_like), 0) AS SIGNED) AS total_like,
             CAST(COALESCE(SUM(s.dy_comment), 0) AS SIGNED) AS total_comment,
             CAST(COALESCE(SUM(s.dy_share), 0) AS SIGNED) AS total_share,
             CAST(COALESCE(SUM(s.dy_follow), 0) AS SIGNED) AS total_follow,
             CAST(COALESCE(SUM(s.dp_target_convert_cnt), 0) AS SIGNED) AS total_convert,
             CAST(COALESCE(AVG(s.play_duration_5s_rank), 0) AS DOUBLE) AS play_duration_5s,
             MAX(s.stat_time) AS stat_time
      FROM order_stats s
      INNER JOIN orders o ON o.order_id = s.order_id
      WHERE (? IS NULL OR o.account_id = ?)
      GROUP BY s.order_id, o.account_id;
    "#,
  )
  .bind(account_id)
  .bind(account_id)
  .fetch_all(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(
    rows
      .into_iter()
      .map(
        |(
          order_id,
          item_id,
          account_id,
          total_cost,
          total_play,
          total_like,
          total_comment,
          total_share,
          total_follow,
          total_convert,
          play_duration_5s,
          stat_time,
        )| OrderSums {
          order_id,
          item_id,
          account_id,
          total_cost,
          total_play,
          total_like,
          total_comment,
          total_share,
          total_follow,
          total_convert,
          play_duration_5s,
          stat_time,
        },
      )
      .collect(),
  )
}

async fn upsert_order_aggs(pool: &MySqlPool, rows: &[OrderAggRow]) -> Result<u64, Error> {
  let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;
  for row in rows {
    let s = &row.sums;
    sqlx::query(
      r#"
        INSERT INTO order_agg (
          order_id, item_id, account_id,
          total_cost, total_play, total_like, total_comment, total_share, total_follow, total_convert,
          play_duration_5s, play_per_100_cost, avg_convert_cost, share_rate, like_rate, stat_time
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
          item_id = VALUES(item_id),
          account_id = VALUES(account_id),
          total_cost = VALUES(total_cost),
          total_play = VALUES(total_play),
          total_like = VALUES(total_like),
          total_comment = VALUES(total_comment),
          total_share = VALUES(total_share),
          total_follow = VALUES(total_follow),
          total_convert = VALUES(total_convert),
          play_duration_5s = VALUES(play_duration_5s),
          play_per_100_cost = VALUES(play_per_100_cost),
          avg_convert_cost = VALUES(avg_convert_cost),
          share_rate = VALUES(share_rate),
          like_rate = VALUES(like_rate),
          stat_time = VALUES(stat_time);
      "#,
    )
    .bind(&s.order_id)
    .bind(&s.item_id)
    .bind(s.account_id)
    .bind(s.total_cost)
    .bind(s.total_play)
    .bind(s.total_like)
    .bind(s.total_comment)
    .bind(s.total_share)
    .bind(s.total_follow)
    .bind(s.total_convert)
    .bind(s.play_duration_5s)
    .bind(row.play_per_100_cost)
    .bind(row.avg_convert_cost)
    .bind(row.share_rate)
    .bind(row.like_rate)
    .bind(s.stat_time)
    .execute(&mut *tx)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;
  }
  tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;
  Ok(rows.len() as u64)
}

async fn aggregate(pool: &MySqlPool, account_id: Option<i64>) -> Result<u64, Error> {
  let rows: Vec<OrderAggRow> = fetch_order_sums(pool, account_id)
    .await?
    .into_iter()
    .map(summarize)
    .collect();
  if rows.is_empty() {
    return Ok(0);
  }
  upsert_order_aggs(pool, &rows).await
}

/// Re-derives `order_agg` for one account's orders. Idempotent.
pub async fn aggregate_account(pool: &MySqlPool, account_id: i64) -> Result<u64, Error> {
  let written = aggregate(pool, Some(account_id)).await?;
  info!(account_id, orders = written, "order roll-up refreshed");
  Ok(written)
}

pub async fn aggregate_all(pool: &MySqlPool) -> Result<u64, Error> {
  let written = aggregate(pool, None).await?;
  info!(orders = written, "order roll-up refreshed for all accounts");
  Ok(written)
}
