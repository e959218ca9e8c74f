use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::MySqlPool;
use tracing::{error, info, warn};
use vercel_runtime::Error;

use crate::metrics::{derive, Totals};
use crate::window::{floor5, recent_windows};

/// Default repair span for `aggregate_recent_windows`: one hour.
pub const RECENT_WINDOW_COUNT: usize = 12;

/// One `order_stats` row at the target window, joined to its order.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStatRow {
  pub order_id: String,
  pub item_id: String,
  pub account_id: i64,
  pub user_id: i64,
  pub budget: f64,
  pub cost: f64,
  pub plays: i64,
  pub likes: i64,
  pub comments: i64,
  pub shares: i64,
  pub follows: i64,
  pub conversions: i64,
  pub home_visited: i64,
  pub rank_5s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoAggRow {
  pub item_id: String,
  pub account_id: i64,
  pub user_id: i64,
  pub stat_time: DateTime<Utc>,
  pub order_count: i64,
  pub total_budget: f64,
  pub total_cost: f64,
  pub total_play: i64,
  pub total_like: i64,
  pub total_comment: i64,
  pub total_share: i64,
  pub total_follow: i64,
  pub total_convert: i64,
  pub total_home_visited: i64,
  pub avg_5s_rank: Option<f64>,
  pub avg_convert_cost: Option<f64>,
  pub play_per_100_cost: f64,
  pub like_rate: f64,
  pub share_rate: f64,
  pub share_per_100_play: f64,
}

#[derive(Default)]
struct Accumulator {
  orders: HashSet<String>,
  budget: f64,
  cost: f64,
  plays: i64,
  likes: i64,
  comments: i64,
  shares: i64,
  follows: i64,
  conversions: i64,
  home_visited: i64,
  rank_sum: f64,
  rows: u32,
}

/// Groups one window's rows by (item_id, account_id, user_id), ordered by that key.
pub fn group_window(rows: &[WindowStatRow], stat_time: DateTime<Utc>) -> Vec<VideoAggRow> {
  let mut groups: BTreeMap<(String, i64, i64), Accumulator> = BTreeMap::new();

  for row in rows {
    let acc = groups
      .entry((row.item_id.clone(), row.account_id, row.user_id))
      .or_default();
    if acc.orders.insert(row.order_id.clone()) {
      acc.budget += row.budget;
    }
    acc.cost += row.cost;
    acc.plays += row.plays;
    acc.likes += row.likes;
    acc.comments += row.comments;
    acc.shares += row.shares;
    acc.follows += row.follows;
    acc.conversions += row.conversions;
    acc.home_visited += row.home_visited;
    acc.rank_sum += row.rank_5s;
    acc.rows += 1;
  }

  groups
    .into_iter()
    .map(|((item_id, account_id, user_id), acc)| {
      let derived = derive(&Totals {
        cost: acc.cost,
        plays: acc.plays,
        likes: acc.likes,
        shares: acc.shares,
        conversions: acc.conversions,
      });
      VideoAggRow {
        item_id,
        account_id,
        user_id,
        stat_time,
        order_count: acc.orders.len() as i64,
        total_budget: acc.budget,
        total_cost: acc.cost,
        total_play: acc.plays,
        total_like: acc.likes,
        total_comment: acc.comments,
        total_share: acc.shares,
        total_follow: acc.follows,
        total_convert: acc.conversions,
        total_home_visited: acc.home_visited,
        avg_5s_rank: (acc.rows > 0).then(|| acc.rank_sum / acc.rows as f64),
        avg_convert_cost: derived.avg_convert_cost,
        play_per_100_cost: derived.play_per_100_cost,
        like_rate: derived.like_rate,
        share_rate: derived.share_rate,
        share_per_100_play: derived.share_per_100_play,
      }
    })
    .collect()
}

type WindowTuple = (String, String, i64, i64, f64, f64, i64, i64, i64, i64, i64, i64, i64, f64);

async fn fetch_window_rows(pool: &MySqlPool, stat_time: DateTime<Utc>) -> Result<Vec<WindowStatRow>, Error> {
  let rows = sqlx::query_as::<_, WindowTuple>(
    r#"
      SELECT o.order_id,
             o.item_id,
             o.account_id,
             o.user_id,
             CAST(o.budget AS DOUBLE) AS budget,
             CAST(s.stat_cost AS DOUBLE) AS cost,
             s.total_play,
             s.custom_like,
             s.dy_comment,
             s.dy_share,
             s.dy_follow,
             s.dp_target_convert_cnt,
             s.dy_home_visited,
             s.play_duration_5s_rank
      FROM orders o
      INNER JOIN order_stats s ON s.order_id = o.order_id AND s.stat_time = ?
      WHERE o.deleted = 0;
    "#,
  )
  .bind(stat_time)
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
          user_id,
          budget,
          cost,
          plays,
          likes,
          comments,
          shares,
          follows,
          conversions,
          home_visited,
          rank_5s,
        )| WindowStatRow {
          order_id,
          item_id,
          account_id,
          user_id,
          budget,
          cost,
          plays,
          likes,
          comments,
          shares,
          follows,
          conversions,
          home_visited,
          rank_5s,
        },
      )
      .collect(),
  )
}

async fn upsert_video_aggs(pool: &MySqlPool, rows: &[VideoAggRow], agg_time: DateTime<Utc>) -> Result<u64, Error> {
  let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;
  for row in rows {
    sqlx::query(
      r#"
        INSERT INTO video_stats_agg (
          item_id, account_id, user_id, stat_time,
          order_count, total_budget, total_cost,
          total_play, total_like, total_comment, total_share, total_follow,
          total_convert, total_home_visited,
          avg_5s_rank, avg_convert_cost,
          play_per_100_cost, like_rate, share_rate, share_per_100_play,
          agg_time, data_version
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
        ON DUPLICATE KEY UPDATE
          user_id = VALUES(user_id),
          order_count = VALUES(order_count),
          total_budget = VALUES(total_budget),
          total_cost = VALUES(total_cost),
          total_play = VALUES(total_play),
          total_like = VALUES(total_like),
          total_comment = VALUES(total_comment),
          total_share = VALUES(total_share),
          total_follow = VALUES(total_follow),
          total_convert = VALUES(total_convert),
          total_home_visited = VALUES(total_home_visited),
          avg_5s_rank = VALUES(avg_5s_rank),
          avg_convert_cost = VALUES(avg_convert_cost),
          play_per_100_cost = VALUES(play_per_100_cost),
          like_rate = VALUES(like_rate),
          share_rate = VALUES(share_rate),
          share_per_100_play = VALUES(share_per_100_play),
          agg_time = VALUES(agg_time),
          data_version = data_version + 1;
      "#,
    )
    .bind(&row.item_id)
    .bind(row.account_id)
    .bind(row.user_id)
    .bind(row.stat_time)
    .bind(row.order_count)
    .bind(row.total_budget)
    .bind(row.total_cost)
    .bind(row.total_play)
    .bind(row.total_like)
    .bind(row.total_comment)
    .bind(row.total_share)
    .bind(row.total_follow)
    .bind(row.total_convert)
    .bind(row.total_home_visited)
    .bind(row.avg_5s_rank)
    .bind(row.avg_convert_cost)
    .bind(row.play_per_100_cost)
    .bind(row.like_rate)
    .bind(row.share_rate)
    .bind(row.share_per_100_play)
    .bind(agg_time)
    .execute(&mut *tx)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;
  }
  tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;
  Ok(rows.len() as u64)
}

/// Rolls one window up into `video_stats_agg`. Re-running a window bumps `data_version`.
pub async fn aggregate_window(pool: &MySqlPool, stat_time: DateTime<Utc>) -> Result<u64, Error> {
  let stat_time = floor5(stat_time);
  let rows = fetch_window_rows(pool, stat_time).await?;
  let groups = group_window(&rows, stat_time);
  if groups.is_empty() {
    info!(%stat_time, "no stats in window; nothing to roll up");
    return Ok(0);
  }
  let written = upsert_video_aggs(pool, &groups, Utc::now()).await?;
  info!(%stat_time, videos = written, stat_rows = rows.len(), "video roll-up written");
  Ok(written)
}

pub async fn aggregate_current_window(pool: &MySqlPool) -> Result<u64, Error> {
  aggregate_window(pool, Utc::now()).await
}

/// Re-runs the last `count` windows ending at `now`. A failing window is logged and skipped.
pub async fn aggregate_recent_windows(pool: &MySqlPool, now: DateTime<Utc>, count: usize) -> Result<u64, Error> {
  let mut written = 0u64;
  for stat_time in recent_windows(now, count) {
    match aggregate_window(pool, stat_time).await {
      Ok(n) => written += n,
      Err(err) => warn!(%stat_time, error = %err, "video roll-up for window failed"),
    }
  }
  Ok(written)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RebuildSummary {
  pub windows: usize,
  pub succeeded: usize,
  pub failed: usize,
}

/// Clears `video_stats_agg` and recomputes every window present in `order_stats`.
pub async fn rebuild_all(pool: &MySqlPool) -> Result<RebuildSummary, Error> {
  warn!("rebuilding video_stats_agg from order_stats");

  sqlx::query("DELETE FROM video_stats_agg;")
    .execute(pool)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;

  let windows = sqlx::query_as::<_, (DateTime<Utc>,)>(
    r#"
      SELECT DISTINCT stat_time
      FROM order_stats
      ORDER BY stat_time DESC;
    "#,
  )
  .fetch_all(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  let mut summary = RebuildSummary {
    windows: windows.len(),
    ..RebuildSummary::default()
  };
  for (stat_time,) in windows {
    match aggregate_window(pool, stat_time).await {
      Ok(_) => summary.succeeded += 1,
      Err(err) => {
        summary.failed += 1;
        error!(%stat_time, error = %err, "rebuild of window failed");
      }
    }
  }

  info!(
    windows = summary.windows,
    succeeded = summary.succeeded,
    failed = summary.failed,
    "video_stats_agg rebuild finished"
  );
  Ok(summary)
}
