use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{MySql, MySqlPool, Transaction};
use tracing::{info, warn};
use vercel_runtime::Error;

use crate::crypto::TokenCipher;
use crate::db::{fetch_account, truncate_string};
use crate::providers::douyin::{DouyinClient, OrderEnvelope};
use crate::sync_task::SyncMode;
use crate::token_refresh::account_access_token;

/// The listing does not carry a delivery duration.
pub const DEFAULT_DURATION_HOURS: i32 = 24;
const MAX_PAGES: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
  Unpaid,
  Auditing,
  Delivering,
  Deliveried,
  Undeliveried,
  AuditPause,
  AuditRejected,
  Running,
  Other(String),
}

impl OrderStatus {
  pub fn parse(raw: &str) -> Self {
    match raw.trim().to_ascii_uppercase().as_str() {
      "UNPAID" => OrderStatus::Unpaid,
      "AUDITING" => OrderStatus::Auditing,
      "DELIVERING" => OrderStatus::Delivering,
      "DELIVERIED" => OrderStatus::Deliveried,
      "UNDELIVERIED" => OrderStatus::Undeliveried,
      "AUDIT_PAUSE" => OrderStatus::AuditPause,
      "AUDIT_REJECTED" => OrderStatus::AuditRejected,
      "RUNNING" => OrderStatus::Running,
      _ => OrderStatus::Other(raw.trim().to_string()),
    }
  }

  pub fn as_str(&self) -> &str {
    match self {
      OrderStatus::Unpaid => "UNPAID",
      OrderStatus::Auditing => "AUDITING",
      OrderStatus::Delivering => "DELIVERING",
      OrderStatus::Deliveried => "DELIVERIED",
      OrderStatus::Undeliveried => "UNDELIVERIED",
      OrderStatus::AuditPause => "AUDIT_PAUSE",
      OrderStatus::AuditRejected => "AUDIT_REJECTED",
      OrderStatus::Running => "RUNNING",
      OrderStatus::Other(raw) => raw.as_str(),
    }
  }

  pub fn is_renewable(&self) -> bool {
    matches!(self, OrderStatus::Delivering | OrderStatus::Running)
  }
}

/// Flattened row for `orders`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
  pub order_id: String,
  pub task_id: Option<String>,
  pub item_id: String,
  pub status: Option<OrderStatus>,
  pub budget: f64,
  pub duration: i32,
  pub aweme_title: Option<String>,
  pub aweme_cover: Option<String>,
  pub aweme_nick: Option<String>,
  pub aweme_avatar: Option<String>,
  pub order_create_time: Option<NaiveDateTime>,
  pub order_start_time: Option<NaiveDateTime>,
  pub order_end_time: Option<NaiveDateTime>,
}

fn parse_platform_time(raw: Option<&str>) -> Option<NaiveDateTime> {
  let raw = raw?.trim();
  if raw.is_empty() {
    return None;
  }
  NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()
}

fn non_empty(value: Option<&String>) -> Option<String> {
  value
    .map(|v| v.trim())
    .filter(|v| !v.is_empty())
    .map(str::to_string)
}

impl OrderRecord {
  /// `None` when the envelope has no order id.
  pub fn from_envelope(envelope: &OrderEnvelope) -> Option<Self> {
    let order = &envelope.order;
    let order_id = order.order_id.clone()?;
    let item = envelope.item_info_list.first().cloned().unwrap_or_default();

    Some(OrderRecord {
      order_id: truncate_string(&order_id, 64),
      task_id: order.task_id.clone(),
      item_id: item.aweme_item_id.unwrap_or_default(),
      status: non_empty(order.task_status.as_ref()).map(|s| OrderStatus::parse(&s)),
      budget: order.budget.unwrap_or(0.0) / 100.0,
      duration: DEFAULT_DURATION_HOURS,
      aweme_title: non_empty(item.aweme_item_title.as_ref()).map(|s| truncate_string(&s, 500)),
      aweme_cover: non_empty(item.aweme_item_cover.first()),
      aweme_nick: non_empty(item.aweme_author_name.as_ref()).map(|s| truncate_string(&s, 100)),
      aweme_avatar: non_empty(item.aweme_author_avatar.first()),
      order_create_time: parse_platform_time(order.order_create_time.as_deref()),
      order_start_time: parse_platform_time(order.order_start_time.as_deref()),
      order_end_time: parse_platform_time(order.order_end_time.as_deref()),
    })
  }
}

/// Inserts or refreshes one order. The creation time is only written on insert.
pub async fn upsert_order(
  tx: &mut Transaction<'_, MySql>,
  record: &OrderRecord,
  account_id: i64,
  user_id: i64,
  synced_at: DateTime<Utc>,
) -> Result<(), Error> {
  sqlx::query(
    r#"
      INSERT INTO orders (
        order_id, task_id, item_id, account_id, user_id, status, budget, duration,
        aweme_title, aweme_cover, aweme_nick, aweme_avatar,
        order_create_time, order_start_time, order_end_time,
        sync_version, last_sync_time
      )
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
      ON DUPLICATE KEY UPDATE
        task_id = COALESCE(VALUES(task_id), task_id),
        item_id = IF(VALUES(item_id) = '', item_id, VALUES(item_id)),
        account_id = VALUES(account_id),
        user_id = VALUES(user_id),
        status = VALUES(status),
        budget = VALUES(budget),
        aweme_title = VALUES(aweme_title),
        aweme_cover = VALUES(aweme_cover),
        aweme_nick = VALUES(aweme_nick),
        aweme_avatar = VALUES(aweme_avatar),
        order_start_time = COALESCE(VALUES(order_start_time), order_start_time),
        order_end_time = COALESCE(VALUES(order_end_time), order_end_time),
        sync_version = sync_version + 1,
        last_sync_time = VALUES(last_sync_time);
    "#,
  )
  .bind(&record.order_id)
  .bind(record.task_id.as_deref())
  .bind(&record.item_id)
  .bind(account_id)
  .bind(user_id)
  .bind(record.status.as_ref().map(|s| s.as_str()))
  .bind(record.budget)
  .bind(record.duration)
  .bind(record.aweme_title.as_deref())
  .bind(record.aweme_cover.as_deref())
  .bind(record.aweme_nick.as_deref())
  .bind(record.aweme_avatar.as_deref())
  .bind(record.order_create_time)
  .bind(record.order_start_time)
  .bind(record.order_end_time)
  .bind(synced_at)
  .execute(&mut **tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;
  Ok(())
}

/// Pages through the account's order listing, committing once per page.
/// Returns the number of orders written.
pub async fn sync_account_orders(
  pool: &MySqlPool,
  client: &DouyinClient,
  cipher: &TokenCipher,
  page_size: u32,
  account_id: i64,
  mode: SyncMode,
) -> Result<u64, Error> {
  let account = fetch_account(pool, account_id).await?.ok_or_else(|| -> Error {
    Box::new(std::io::Error::other(format!("account {account_id} not found")))
  })?;
  let access_token = account_access_token(cipher, &account)?;

  let mut page = 1u32;
  let mut total_synced = 0u64;

  loop {
    let envelopes = client
      .list_orders(&access_token, &account.aweme_sec_uid, page, page_size)
      .await
      .map_err(|e| -> Error { Box::new(e) })?;
    if envelopes.is_empty() {
      break;
    }

    let synced_at = Utc::now();
    let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;
    for envelope in &envelopes {
      let Some(record) = OrderRecord::from_envelope(envelope) else {
        warn!(account_id, page, "skipping order envelope without order_id");
        continue;
      };
      match upsert_order(&mut tx, &record, account.id, account.user_id, synced_at).await {
        Ok(()) => total_synced += 1,
        Err(err) => warn!(account_id, order_id = %record.order_id, error = %err, "failed to save order"),
      }
    }
    tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;

    if (envelopes.len() as u32) < page_size || page >= MAX_PAGES {
      break;
    }
    page += 1;
  }

  info!(account_id, mode = mode.as_str(), pages = page, orders = total_synced, "order sync finished");
  Ok(total_synced)
}
