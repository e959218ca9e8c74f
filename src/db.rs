use chrono::{DateTime, Utc};
use sqlx::{mysql::MySqlPoolOptions, MySqlPool};
use tokio::sync::OnceCell;
use vercel_runtime::Error;

static POOL: OnceCell<MySqlPool> = OnceCell::const_new();

async fn ensure_schema(pool: &MySqlPool) -> Result<(), Error> {
  // Accounts are owned by the account service; created here so a fresh database is usable.
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS accounts (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        user_id BIGINT NOT NULL,
        open_id VARCHAR(100) NULL,
        advertiser_id VARCHAR(100) NULL,
        aweme_sec_uid VARCHAR(200) NULL,
        nickname VARCHAR(100) NULL,
        avatar VARCHAR(500) NULL,
        access_token TEXT NULL,
        refresh_token TEXT NULL,
        token_expires_at TIMESTAMP(3) NULL,
        status INT NOT NULL DEFAULT 1,
        deleted TINYINT NOT NULL DEFAULT 0,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        KEY idx_accounts_user (user_id, status, deleted),
        KEY idx_accounts_token_expiry (deleted, token_expires_at)
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS orders (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        order_id VARCHAR(64) NOT NULL,
        task_id VARCHAR(64) NULL,
        item_id VARCHAR(64) NOT NULL DEFAULT '',
        account_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        status VARCHAR(32) NULL,
        budget DECIMAL(12,2) NOT NULL DEFAULT 0,
        duration INT NOT NULL DEFAULT 24,
        aweme_title VARCHAR(500) NULL,
        aweme_cover VARCHAR(500) NULL,
        aweme_nick VARCHAR(100) NULL,
        aweme_avatar VARCHAR(500) NULL,
        order_create_time DATETIME NULL,
        order_start_time DATETIME NULL,
        order_end_time DATETIME NULL,
        sync_version BIGINT NOT NULL DEFAULT 0,
        last_sync_time TIMESTAMP(3) NULL,
        deleted TINYINT NOT NULL DEFAULT 0,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        UNIQUE KEY uq_orders_order_id (order_id),
        KEY idx_orders_account_sync (account_id, last_sync_time),
        KEY idx_orders_item (item_id, account_id)
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS order_stats (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        order_id VARCHAR(64) NOT NULL,
        item_id VARCHAR(64) NOT NULL DEFAULT '',
        stat_time DATETIME NOT NULL,
        stat_cost DECIMAL(12,2) NOT NULL DEFAULT 0,
        total_play BIGINT NOT NULL DEFAULT 0,
        custom_like BIGINT NOT NULL DEFAULT 0,
        dy_comment BIGINT NOT NULL DEFAULT 0,
        dy_share BIGINT NOT NULL DEFAULT 0,
        dy_follow BIGINT NOT NULL DEFAULT 0,
        play_duration_5s_rank DOUBLE NOT NULL DEFAULT 0,
        dy_home_visited BIGINT NOT NULL DEFAULT 0,
        dp_target_convert_cnt BIGINT NOT NULL DEFAULT 0,
        custom_convert_cost DECIMAL(12,2) NOT NULL DEFAULT 0,
        show_cnt BIGINT NOT NULL DEFAULT 0,
        live_click_source_cnt BIGINT NOT NULL DEFAULT 0,
        live_gift_uv BIGINT NOT NULL DEFAULT 0,
        live_gift_amount DECIMAL(12,2) NOT NULL DEFAULT 0,
        live_comment_cnt BIGINT NOT NULL DEFAULT 0,
        live_follow_count BIGINT NOT NULL DEFAULT 0,
        live_gift_cnt BIGINT NOT NULL DEFAULT 0,
        sync_time TIMESTAMP(3) NULL,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        UNIQUE KEY uq_order_stats_window (order_id, stat_time),
        KEY idx_order_stats_time (stat_time)
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS order_agg (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        order_id VARCHAR(64) NOT NULL,
        item_id VARCHAR(64) NOT NULL DEFAULT '',
        account_id BIGINT NOT NULL,
        total_cost DECIMAL(14,2) NOT NULL DEFAULT 0,
        total_play BIGINT NOT NULL DEFAULT 0,
        total_like BIGINT NOT NULL DEFAULT 0,
        total_comment BIGINT NOT NULL DEFAULT 0,
        total_share BIGINT NOT NULL DEFAULT 0,
        total_follow BIGINT NOT NULL DEFAULT 0,
        total_convert BIGINT NOT NULL DEFAULT 0,
        play_duration_5s DOUBLE NOT NULL DEFAULT 0,
        play_per_100_cost DECIMAL(14,2) NOT NULL DEFAULT 0,
        avg_convert_cost DECIMAL(14,2) NULL,
        share_rate DECIMAL(10,4) NOT NULL DEFAULT 0,
        like_rate DECIMAL(10,4) NOT NULL DEFAULT 0,
        stat_time DATETIME NOT NULL,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        UNIQUE KEY uq_order_agg_order (order_id),
        KEY idx_order_agg_account (account_id),
        KEY idx_order_agg_play_per_100 (play_per_100_cost),
        KEY idx_order_agg_convert_cost (avg_convert_cost)
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS video_stats_agg (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        item_id VARCHAR(64) NOT NULL,
        account_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        stat_time DATETIME NOT NULL,
        order_count INT NOT NULL DEFAULT 0,
        total_budget DECIMAL(14,2) NOT NULL DEFAULT 0,
        total_cost DECIMAL(14,2) NOT NULL DEFAULT 0,
        total_play BIGINT NOT NULL DEFAULT 0,
        total_like BIGINT NOT NULL DEFAULT 0,
        total_comment BIGINT NOT NULL DEFAULT 0,
        total_share BIGINT NOT NULL DEFAULT 0,
        total_follow BIGINT NOT NULL DEFAULT 0,
        total_convert BIGINT NOT NULL DEFAULT 0,
        total_home_visited BIGINT NOT NULL DEFAULT 0,
        avg_5s_rank DOUBLE NULL,
        avg_convert_cost DECIMAL(14,2) NULL,
        play_per_100_cost DECIMAL(14,2) NOT NULL DEFAULT 0,
        like_rate DECIMAL(10,4) NOT NULL DEFAULT 0,
        share_rate DECIMAL(10,4) NOT NULL DEFAULT 0,
        share_per_100_play DECIMAL(10,2) NOT NULL DEFAULT 0,
        agg_time TIMESTAMP(3) NULL,
        data_version BIGINT NOT NULL DEFAULT 1,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        UNIQUE KEY uq_video_stats_agg_window (item_id, account_id, stat_time),
        KEY idx_video_stats_agg_user (user_id, stat_time),
        KEY idx_video_stats_agg_time (stat_time)
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS sync_task_log (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        user_id BIGINT NOT NULL,
        task_type VARCHAR(20) NOT NULL,
        sync_mode VARCHAR(20) NOT NULL,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        total_accounts INT NOT NULL DEFAULT 0,
        completed_accounts INT NOT NULL DEFAULT 0,
        total_records INT NOT NULL DEFAULT 0,
        success_count INT NOT NULL DEFAULT 0,
        fail_count INT NOT NULL DEFAULT 0,
        error_message TEXT NULL,
        start_time TIMESTAMP(3) NULL,
        end_time TIMESTAMP(3) NULL,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        KEY idx_sync_task_log_user (user_id, task_type, status)
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS sync_task_detail (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        task_id BIGINT NOT NULL,
        account_id BIGINT NOT NULL,
        account_name VARCHAR(100) NULL,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        record_count INT NOT NULL DEFAULT 0,
        error_message TEXT NULL,
        start_time TIMESTAMP(3) NULL,
        end_time TIMESTAMP(3) NULL,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        UNIQUE KEY uq_sync_task_detail (task_id, account_id),
        KEY idx_sync_task_detail_claim (status, id)
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(())
}

pub async fn get_pool() -> Result<&'static MySqlPool, Error> {
  POOL
    .get_or_try_init(|| async {
      let url = crate::config::database_url().ok_or_else(|| -> Error {
        Box::new(std::io::Error::other(
          "Missing TIDB_DATABASE_URL (or DATABASE_URL)",
        ))
      })?;

      let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .map_err(|e| -> Error { Box::new(e) })?;

      ensure_schema(&pool).await?;
      Ok::<_, Error>(pool)
    })
    .await
}

#[derive(Debug, Clone)]
pub struct AccountRow {
  pub id: i64,
  pub user_id: i64,
  pub aweme_sec_uid: String,
  pub nickname: Option<String>,
  pub access_token: Option<String>,
  pub refresh_token: Option<String>,
  pub token_expires_at: Option<DateTime<Utc>>,
}

type AccountTuple = (
  i64,
  i64,
  Option<String>,
  Option<String>,
  Option<String>,
  Option<String>,
  Option<DateTime<Utc>>,
);

fn account_from_tuple(row: AccountTuple) -> AccountRow {
  let (id, user_id, aweme_sec_uid, nickname, access_token, refresh_token, token_expires_at) = row;
  AccountRow {
    id,
    user_id,
    aweme_sec_uid: aweme_sec_uid.unwrap_or_default(),
    nickname,
    access_token,
    refresh_token,
    token_expires_at,
  }
}

pub async fn fetch_account(pool: &MySqlPool, account_id: i64) -> Result<Option<AccountRow>, Error> {
  let row = sqlx::query_as::<_, AccountTuple>(
    r#"
      SELECT id, user_id, aweme_sec_uid, nickname, access_token, refresh_token, token_expires_at
      FROM accounts
      WHERE id = ? AND deleted = 0
      LIMIT 1;
    "#,
  )
  .bind(account_id)
  .fetch_optional(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(row.map(account_from_tuple))
}

pub async fn fetch_active_accounts(pool: &MySqlPool) -> Result<Vec<AccountRow>, Error> {
  let rows = sqlx::query_as::<_, AccountTuple>(
    r#"
      SELECT id, user_id, aweme_sec_uid, nickname, access_token, refresh_token, token_expires_at
      FROM accounts
      WHERE status = 1 AND deleted = 0
      ORDER BY id ASC;
    "#,
  )
  .fetch_all(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(rows.into_iter().map(account_from_tuple).collect())
}

pub async fn fetch_active_accounts_for_user(pool: &MySqlPool, user_id: i64) -> Result<Vec<AccountRow>, Error> {
  let rows = sqlx::query_as::<_, AccountTuple>(
    r#"
      SELECT id, user_id, aweme_sec_uid, nickname, access_token, refresh_token, token_expires_at
      FROM accounts
      WHERE user_id = ? AND status = 1 AND deleted = 0
      ORDER BY id ASC;
    "#,
  )
  .bind(user_id)
  .fetch_all(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(rows.into_iter().map(account_from_tuple).collect())
}

pub async fn fetch_accounts_with_expiring_tokens(
  pool: &MySqlPool,
  expires_before: DateTime<Utc>,
) -> Result<Vec<AccountRow>, Error> {
  let rows = sqlx::query_as::<_, AccountTuple>(
    r#"
      SELECT id, user_id, aweme_sec_uid, nickname, access_token, refresh_token, token_expires_at
      FROM accounts
      WHERE deleted = 0
        AND refresh_token IS NOT NULL
        AND refresh_token <> ''
        AND token_expires_at < ?
      ORDER BY token_expires_at ASC;
    "#,
  )
  .bind(expires_before)
  .fetch_all(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(rows.into_iter().map(account_from_tuple).collect())
}

pub fn truncate_string(value: &str, max_chars: usize) -> String {
  value.chars().take(max_chars).collect()
}

/// Helpers for tests that need a live database; they skip when no URL is configured.
#[cfg(test)]
pub(crate) mod test_support {
  use super::*;

  /// A fresh pool per test so each `#[tokio::test]` runtime owns its connections.
  pub(crate) async fn test_pool() -> Option<MySqlPool> {
    let url = crate::config::database_url()?;
    let pool = MySqlPoolOptions::new()
      .max_connections(2)
      .connect(&url)
      .await
      .unwrap();
    ensure_schema(&pool).await.unwrap();
    Some(pool)
  }

  /// Positive id that does not collide with other runs.
  pub(crate) fn unique_id() -> i64 {
    use std::sync::atomic::{AtomicI64, Ordering};
    static SEQ: AtomicI64 = AtomicI64::new(0);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    (nanos / 1_000 % 1_000_000_000_000) * 100 + SEQ.fetch_add(1, Ordering::Relaxed) % 100 + 1
  }

  pub(crate) async fn insert_account(pool: &MySqlPool, user_id: i64, nickname: &str) -> i64 {
    sqlx::query("INSERT INTO accounts (user_id, aweme_sec_uid, nickname) VALUES (?, ?, ?);")
      .bind(user_id)
      .bind(format!("sec-{user_id}-{nickname}"))
      .bind(nickname)
      .execute(pool)
      .await
      .unwrap()
      .last_insert_id() as i64
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn account_tuple_defaults_missing_sec_uid_to_empty() {
    let row = account_from_tuple((7, 3, None, Some("nick".to_string()), None, None, None));
    assert_eq!(row.id, 7);
    assert_eq!(row.user_id, 3);
    assert_eq!(row.aweme_sec_uid, "");
    assert_eq!(row.nickname.as_deref(), Some("nick"));
  }

  #[test]
  fn truncate_string_counts_chars_not_bytes() {
    assert_eq!(truncate_string("账号同步失败", 2), "账号");
    assert_eq!(truncate_string("abc", 0), "");
    assert_eq!(truncate_string("abc", 10), "abc");
  }
}
