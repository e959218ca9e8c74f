use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::MySqlPool;
use tracing::{info, warn};
use vercel_runtime::Error;

use crate::db::{fetch_active_accounts_for_user, truncate_string};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
  Order,
  Stats,
}

impl TaskType {
  pub fn as_str(self) -> &'static str {
    match self {
      TaskType::Order => "order",
      TaskType::Stats => "stats",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "order" | "orders" => Some(TaskType::Order),
      "stats" => Some(TaskType::Stats),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
  Full,
  Incremental,
}

impl SyncMode {
  pub fn as_str(self) -> &'static str {
    match self {
      SyncMode::Full => "full",
      SyncMode::Incremental => "incremental",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "full" => Some(SyncMode::Full),
      "incremental" => Some(SyncMode::Incremental),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Pending,
  Running,
  Completed,
  Failed,
}

impl TaskStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Running => "running",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw {
      "pending" => Some(TaskStatus::Pending),
      "running" => Some(TaskStatus::Running),
      "completed" => Some(TaskStatus::Completed),
      "failed" => Some(TaskStatus::Failed),
      _ => None,
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed)
  }
}

/// Parent-log counters recomputed from every sibling detail row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
  pub completed_accounts: i64,
  pub success_count: i64,
  pub fail_count: i64,
  pub total_records: i64,
  /// `Some` once every detail is terminal.
  pub terminal_status: Option<TaskStatus>,
}

impl TaskProgress {
  pub fn from_details(total_accounts: i64, details: &[(TaskStatus, i64)]) -> Self {
    let success_count = details.iter().filter(|(s, _)| *s == TaskStatus::Completed).count() as i64;
    let fail_count = details.iter().filter(|(s, _)| *s == TaskStatus::Failed).count() as i64;
    let completed_accounts = success_count + fail_count;
    let total_records = details.iter().map(|(_, n)| *n).sum();

    let all_terminal = completed_accounts >= total_accounts && details.iter().all(|(s, _)| s.is_terminal());
    let terminal_status = all_terminal.then(|| {
      if fail_count == 0 {
        TaskStatus::Completed
      } else {
        TaskStatus::Failed
      }
    });

    TaskProgress {
      completed_accounts,
      success_count,
      fail_count,
      total_records,
      terminal_status,
    }
  }

  pub fn error_message(&self) -> Option<String> {
    (self.terminal_status == Some(TaskStatus::Failed)).then(|| format!("{} account(s) failed", self.fail_count))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerOutcome {
  pub task_id: i64,
  /// `false` when an in-flight task for the same user and type was returned instead.
  pub created: bool,
  pub total_accounts: i64,
}

async fn find_in_flight_task(pool: &MySqlPool, user_id: i64, task_type: TaskType) -> Result<Option<(i64, i64)>, Error> {
  sqlx::query_as::<_, (i64, i64)>(
    r#"
      SELECT id, CAST(total_accounts AS SIGNED)
      FROM sync_task_log
      WHERE user_id = ?
        AND task_type = ?
        AND status IN ('pending','running')
      ORDER BY id DESC
      LIMIT 1;
    "#,
  )
  .bind(user_id)
  .bind(task_type.as_str())
  .fetch_optional(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })
}

/// Creates a task with one pending detail per active account of the user, then moves it to
/// `running`. Details are executed by the worker tick. The in-flight check is a plain read,
/// so two simultaneous triggers can both create tasks.
pub async fn trigger_sync(
  pool: &MySqlPool,
  user_id: i64,
  task_type: TaskType,
  mode: SyncMode,
) -> Result<TriggerOutcome, Error> {
  if let Some((task_id, total_accounts)) = find_in_flight_task(pool, user_id, task_type).await? {
    info!(user_id, task_id, task_type = task_type.as_str(), "sync already in flight");
    return Ok(TriggerOutcome {
      task_id,
      created: false,
      total_accounts,
    });
  }

  let accounts = fetch_active_accounts_for_user(pool, user_id).await?;
  let total_accounts = accounts.len() as i64;

  let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;
  let task_id = sqlx::query(
    r#"
      INSERT INTO sync_task_log (user_id, task_type, sync_mode, status, total_accounts)
      VALUES (?, ?, ?, 'pending', ?);
    "#,
  )
  .bind(user_id)
  .bind(task_type.as_str())
  .bind(mode.as_str())
  .bind(total_accounts)
  .execute(&mut *tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?
  .last_insert_id() as i64;

  for account in &accounts {
    let account_name = account.nickname.as_deref().map(|n| truncate_string(n, 100));
    sqlx::query(
      r#"
        INSERT INTO sync_task_detail (task_id, account_id, account_name, status)
        VALUES (?, ?, ?, 'pending');
      "#,
    )
    .bind(task_id)
    .bind(account.id)
    .bind(account_name)
    .execute(&mut *tx)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;
  }
  tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;

  let now = Utc::now();
  if accounts.is_empty() {
    sqlx::query(
      r#"
        UPDATE sync_task_log
        SET status = 'completed', start_time = ?, end_time = ?
        WHERE id = ?;
      "#,
    )
    .bind(now)
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;
    info!(user_id, task_id, "sync task has no active accounts; completed immediately");
  } else {
    sqlx::query(
      r#"
        UPDATE sync_task_log
        SET status = 'running', start_time = ?
        WHERE id = ? AND status = 'pending';
      "#,
    )
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;
    info!(user_id, task_id, total_accounts, task_type = task_type.as_str(), mode = mode.as_str(), "sync task started");
  }

  Ok(TriggerOutcome {
    task_id,
    created: true,
    total_accounts,
  })
}

/// A detail row handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedDetail {
  pub detail_id: i64,
  pub task_id: i64,
  pub account_id: i64,
  pub task_type: TaskType,
  pub mode: SyncMode,
}

pub const LEASE_EXPIRED_MESSAGE: &str = "worker lease expired";

/// Running details that started before the returned instant are treated as abandoned.
pub fn stale_cutoff(now: DateTime<Utc>, lease_secs: i64) -> DateTime<Utc> {
  now - Duration::seconds(lease_secs.max(1))
}

/// A running detail without a start time never got a proper claim and is also expired.
pub fn is_lease_expired(start_time: Option<DateTime<Utc>>, cutoff: DateTime<Utc>) -> bool {
  start_time.map_or(true, |started| started < cutoff)
}

/// Fails details left in `running` past the lease (worker killed, timed out or unable to
/// record its outcome) and recomputes their tasks so they can reach a terminal state.
pub async fn reclaim_stale_details(pool: &MySqlPool, now: DateTime<Utc>, lease_secs: i64) -> Result<usize, Error> {
  let cutoff = stale_cutoff(now, lease_secs);
  let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;
  let running: Vec<(i64, i64, Option<DateTime<Utc>>)> = sqlx::query_as(
    r#"
      SELECT id, task_id, start_time
      FROM sync_task_detail
      WHERE status = 'running'
      FOR UPDATE;
    "#,
  )
  .fetch_all(&mut *tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  let mut affected_tasks = BTreeSet::new();
  let mut reclaimed = 0usize;
  for (detail_id, task_id, start_time) in running {
    if !is_lease_expired(start_time, cutoff) {
      continue;
    }
    sqlx::query(
      r#"
        UPDATE sync_task_detail
        SET status = 'failed', error_message = ?, end_time = ?
        WHERE id = ? AND status = 'running';
      "#,
    )
    .bind(LEASE_EXPIRED_MESSAGE)
    .bind(now)
    .bind(detail_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;
    warn!(detail_id, task_id, ?start_time, "reclaimed running detail past its lease");
    affected_tasks.insert(task_id);
    reclaimed += 1;
  }
  tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;

  for task_id in affected_tasks {
    refresh_task_progress(pool, task_id).await?;
  }
  Ok(reclaimed)
}

type PendingRow = (i64, i64, i64, String, String);

/// Splits locked pending rows into claimable details and the `(detail_id, task_id)` pairs
/// whose task type or mode cannot be parsed.
fn partition_pending(rows: Vec<PendingRow>) -> (Vec<ClaimedDetail>, Vec<(i64, i64)>) {
  let mut claimed = Vec::with_capacity(rows.len());
  let mut rejected = Vec::new();
  for (detail_id, task_id, account_id, task_type, sync_mode) in rows {
    match (TaskType::parse(&task_type), SyncMode::parse(&sync_mode)) {
      (Some(task_type), Some(mode)) => claimed.push(ClaimedDetail {
        detail_id,
        task_id,
        account_id,
        task_type,
        mode,
      }),
      _ => {
        warn!(detail_id, task_id, %task_type, %sync_mode, "detail has unknown task type or mode; failing it");
        rejected.push((detail_id, task_id));
      }
    }
  }
  (claimed, rejected)
}

/// Locks up to `limit` pending details and flips them to `running`. Details that cannot be
/// run are failed in the same transaction and their tasks recomputed afterwards.
pub async fn claim_pending_details(pool: &MySqlPool, limit: i64) -> Result<Vec<ClaimedDetail>, Error> {
  let now = Utc::now();
  let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;
  let rows: Vec<PendingRow> = sqlx::query_as(
    r#"
      SELECT d.id, d.task_id, d.account_id, l.task_type, l.sync_mode
      FROM sync_task_detail d
      INNER JOIN sync_task_log l ON l.id = d.task_id
      WHERE d.status = 'pending'
      ORDER BY d.id ASC
      LIMIT ?
      FOR UPDATE;
    "#,
  )
  .bind(limit)
  .fetch_all(&mut *tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  let (claimed, rejected) = partition_pending(rows);
  let mut rejected_tasks = BTreeSet::new();
  for (detail_id, task_id) in rejected {
    sqlx::query(
      r#"
        UPDATE sync_task_detail
        SET status = 'failed', error_message = 'unknown task type or sync mode', start_time = ?, end_time = ?
        WHERE id = ?;
      "#,
    )
    .bind(now)
    .bind(now)
    .bind(detail_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;
    rejected_tasks.insert(task_id);
  }

  for detail in &claimed {
    sqlx::query(
      r#"
        UPDATE sync_task_detail
        SET status = 'running', start_time = ?
        WHERE id = ?;
      "#,
    )
    .bind(now)
    .bind(detail.detail_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;
  }

  tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;

  for task_id in rejected_tasks {
    refresh_task_progress(pool, task_id).await?;
  }
  Ok(claimed)
}

pub async fn complete_detail(pool: &MySqlPool, detail: &ClaimedDetail, record_count: u64) -> Result<(), Error> {
  sqlx::query(
    r#"
      UPDATE sync_task_detail
      SET status = 'completed', record_count = ?, error_message = NULL, end_time = ?
      WHERE id = ? AND status = 'running';
    "#,
  )
  .bind(record_count.min(i32::MAX as u64) as i64)
  .bind(Utc::now())
  .bind(detail.detail_id)
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  refresh_task_progress(pool, detail.task_id).await
}

pub async fn fail_detail(pool: &MySqlPool, detail: &ClaimedDetail, error_message: &str) -> Result<(), Error> {
  sqlx::query(
    r#"
      UPDATE sync_task_detail
      SET status = 'failed', error_message = ?, end_time = ?
      WHERE id = ? AND status = 'running';
    "#,
  )
  .bind(truncate_string(error_message, 2000))
  .bind(Utc::now())
  .bind(detail.detail_id)
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  refresh_task_progress(pool, detail.task_id).await
}

/// Recomputes the log's counters from its details and closes it when every detail is terminal.
pub async fn refresh_task_progress(pool: &MySqlPool, task_id: i64) -> Result<(), Error> {
  let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;

  let Some((total_accounts, status)) = sqlx::query_as::<_, (i64, String)>(
    r#"
      SELECT CAST(total_accounts AS SIGNED), status
      FROM sync_task_log
      WHERE id = ?
      FOR UPDATE;
    "#,
  )
  .bind(task_id)
  .fetch_optional(&mut *tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?
  else {
    warn!(task_id, "progress refresh for missing task");
    return Ok(());
  };

  let details: Vec<(TaskStatus, i64)> = sqlx::query_as::<_, (String, i64)>(
    r#"
      SELECT status, CAST(record_count AS SIGNED)
      FROM sync_task_detail
      WHERE task_id = ?;
    "#,
  )
  .bind(task_id)
  .fetch_all(&mut *tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?
  .into_iter()
  .map(|(s, n)| (TaskStatus::parse(&s).unwrap_or(TaskStatus::Pending), n))
  .collect();

  let progress = TaskProgress::from_details(total_accounts, &details);
  let already_terminal = TaskStatus::parse(&status).is_some_and(TaskStatus::is_terminal);

  match progress.terminal_status {
    Some(terminal) if !already_terminal => {
      sqlx::query(
        r#"
          UPDATE sync_task_log
          SET completed_accounts = ?, success_count = ?, fail_count = ?, total_records = ?,
              status = ?, error_message = ?, end_time = ?
          WHERE id = ?;
        "#,
      )
      .bind(progress.completed_accounts)
      .bind(progress.success_count)
      .bind(progress.fail_count)
      .bind(progress.total_records)
      .bind(terminal.as_str())
      .bind(progress.error_message())
      .bind(Utc::now())
      .bind(task_id)
      .execute(&mut *tx)
      .await
      .map_err(|e| -> Error { Box::new(e) })?;
    }
    _ => {
      sqlx::query(
        r#"
          UPDATE sync_task_log
          SET completed_accounts = ?, success_count = ?, fail_count = ?, total_records = ?
          WHERE id = ?;
        "#,
      )
      .bind(progress.completed_accounts)
      .bind(progress.success_count)
      .bind(progress.fail_count)
      .bind(progress.total_records)
      .bind(task_id)
      .execute(&mut *tx)
      .await
      .map_err(|e| -> Error { Box::new(e) })?;
    }
  }

  tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;

  info!(
    task_id,
    completed = progress.completed_accounts,
    total = total_accounts,
    success = progress.success_count,
    failed = progress.fail_count,
    "task progress updated"
  );
  Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncTaskDetailView {
  pub account_id: i64,
  pub account_name: Option<String>,
  pub status: String,
  pub record_count: i64,
  pub error_message: Option<String>,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncTaskView {
  pub task_id: i64,
  pub user_id: i64,
  pub task_type: String,
  pub sync_mode: String,
  pub status: String,
  pub total_accounts: i64,
  pub completed_accounts: i64,
  pub total_records: i64,
  pub success_count: i64,
  pub fail_count: i64,
  pub error_message: Option<String>,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
  pub details: Vec<SyncTaskDetailView>,
}

type TaskTuple = (
  i64,
  i64,
  String,
  String,
  String,
  i64,
  i64,
  i64,
  i64,
  i64,
  Option<String>,
  Option<DateTime<Utc>>,
  Option<DateTime<Utc>>,
);

const TASK_COLUMNS: &str = r#"
  SELECT id, user_id, task_type, sync_mode, status,
         CAST(total_accounts AS SIGNED), CAST(completed_accounts AS SIGNED),
         CAST(total_records AS SIGNED), CAST(success_count AS SIGNED), CAST(fail_count AS SIGNED),
         error_message, start_time, end_time
  FROM sync_task_log
"#;

async fn load_task_view(pool: &MySqlPool, row: TaskTuple) -> Result<SyncTaskView, Error> {
  let (
    task_id,
    user_id,
    task_type,
    sync_mode,
    status,
    total_accounts,
    completed_accounts,
    total_records,
    success_count,
    fail_count,
    error_message,
    start_time,
    end_time,
  ) = row;

  let details = sqlx::query_as::<
    _,
    (i64, Option<String>, String, i64, Option<String>, Option<DateTime<Utc>>, Option<DateTime<Utc>>),
  >(
    r#"
      SELECT account_id, account_name, status, CAST(record_count AS SIGNED), error_message, start_time, end_time
      FROM sync_task_detail
      WHERE task_id = ?
      ORDER BY id ASC;
    "#,
  )
  .bind(task_id)
  .fetch_all(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?
  .into_iter()
  .map(
    |(account_id, account_name, status, record_count, error_message, start_time, end_time)| SyncTaskDetailView {
      account_id,
      account_name,
      status,
      record_count,
      error_message,
      start_time,
      end_time,
    },
  )
  .collect();

  Ok(SyncTaskView {
    task_id,
    user_id,
    task_type,
    sync_mode,
    status,
    total_accounts,
    completed_accounts,
    total_records,
    success_count,
    fail_count,
    error_message,
    start_time,
    end_time,
    details,
  })
}

pub async fn fetch_task(pool: &MySqlPool, task_id: i64) -> Result<Option<SyncTaskView>, Error> {
  let sql = format!("{TASK_COLUMNS} WHERE id = ? LIMIT 1;");
  let row = sqlx::query_as::<_, TaskTuple>(&sql)
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;

  match row {
    Some(row) => Ok(Some(load_task_view(pool, row).await?)),
    None => Ok(None),
  }
}

pub async fn latest_task_for_user(
  pool: &MySqlPool,
  user_id: i64,
  task_type: TaskType,
) -> Result<Option<SyncTaskView>, Error> {
  let sql = format!("{TASK_COLUMNS} WHERE user_id = ? AND task_type = ? ORDER BY id DESC LIMIT 1;");
  let row = sqlx::query_as::<_, TaskTuple>(&sql)
    .bind(user_id)
    .bind(task_type.as_str())
    .fetch_optional(pool)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;

  match row {
    Some(row) => Ok(Some(load_task_view(pool, row).await?)),
    None => Ok(None),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn one_failed_account_fails_the_task_once_all_are_terminal() {
    let details = vec![
      (TaskStatus::Completed, 12),
      (TaskStatus::Completed, 3),
      (TaskStatus::Failed, 0),
      (TaskStatus::Completed, 7),
      (TaskStatus::Completed, 0),
    ];
    let progress = TaskProgress::from_details(5, &details);
    assert_eq!(progress.completed_accounts, 5);
    assert_eq!(progress.success_count, 4);
    assert_eq!(progress.fail_count, 1);
    assert_eq!(progress.total_records, 22);
    assert_eq!(progress.terminal_status, Some(TaskStatus::Failed));
    assert_eq!(progress.error_message().as_deref(), Some("1 account(s) failed"));
  }

  #[test]
  fn task_stays_open_while_any_detail_is_not_terminal() {
    let details = vec![
      (TaskStatus::Completed, 1),
      (TaskStatus::Failed, 0),
      (TaskStatus::Running, 0),
    ];
    let progress = TaskProgress::from_details(3, &details);
    assert_eq!(progress.completed_accounts, 2);
    assert_eq!(progress.terminal_status, None);
    assert_eq!(progress.error_message(), None);

    let details = vec![(TaskStatus::Completed, 1), (TaskStatus::Pending, 0)];
    assert_eq!(TaskProgress::from_details(2, &details).terminal_status, None);
  }

  #[test]
  fn all_completed_details_complete_the_task() {
    let details = vec![(TaskStatus::Completed, 4), (TaskStatus::Completed, 6)];
    let progress = TaskProgress::from_details(2, &details);
    assert_eq!(progress.terminal_status, Some(TaskStatus::Completed));
    assert_eq!(progress.total_records, 10);
    assert_eq!(progress.error_message(), None);
  }

  #[test]
  fn recompute_is_independent_of_detail_order() {
    let mut details = vec![
      (TaskStatus::Failed, 0),
      (TaskStatus::Completed, 5),
      (TaskStatus::Completed, 2),
    ];
    let a = TaskProgress::from_details(3, &details);
    details.reverse();
    let b = TaskProgress::from_details(3, &details);
    assert_eq!(a, b);
  }

  #[test]
  fn parses_task_type_and_mode() {
    assert_eq!(TaskType::parse("orders"), Some(TaskType::Order));
    assert_eq!(TaskType::parse("Stats"), Some(TaskType::Stats));
    assert_eq!(TaskType::parse("video"), None);
    assert_eq!(SyncMode::parse("FULL"), Some(SyncMode::Full));
    assert_eq!(SyncMode::parse("incremental"), Some(SyncMode::Incremental));
    assert_eq!(SyncMode::parse("delta"), None);
    assert!(TaskStatus::Failed.is_terminal());
    assert!(!TaskStatus::Running.is_terminal());
  }

  #[test]
  fn stale_cutoff_subtracts_the_lease() {
    let now = Utc::now();
    assert_eq!(stale_cutoff(now, 900), now - Duration::seconds(900));
    assert_eq!(stale_cutoff(now, 0), now - Duration::seconds(1));
    assert_eq!(stale_cutoff(now, -30), now - Duration::seconds(1));
  }

  #[test]
  fn only_details_started_before_the_cutoff_are_expired() {
    let now = Utc::now();
    let cutoff = stale_cutoff(now, 900);
    assert!(is_lease_expired(Some(now - Duration::seconds(901)), cutoff));
    assert!(is_lease_expired(None, cutoff));
    assert!(!is_lease_expired(Some(cutoff), cutoff));
    assert!(!is_lease_expired(Some(now - Duration::seconds(60)), cutoff));
  }

  #[test]
  fn unparseable_pending_rows_are_rejected_with_their_task() {
    let rows = vec![
      (1, 10, 100, "order".to_string(), "incremental".to_string()),
      (2, 20, 200, "video".to_string(), "full".to_string()),
      (3, 10, 101, "stats".to_string(), "full".to_string()),
      (4, 30, 300, "order".to_string(), "weekly".to_string()),
    ];
    let (claimed, rejected) = partition_pending(rows);
    assert_eq!(claimed.iter().map(|d| d.detail_id).collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(claimed[1].task_type, TaskType::Stats);
    assert_eq!(claimed[1].mode, SyncMode::Full);
    assert_eq!(rejected, vec![(2, 20), (4, 30)]);
  }

  type LogCounters = (String, i64, i64, i64, i64, Option<String>);

  async fn read_log(pool: &MySqlPool, task_id: i64) -> LogCounters {
    sqlx::query_as(
      r#"
        SELECT status,
               CAST(completed_accounts AS SIGNED),
               CAST(success_count AS SIGNED),
               CAST(fail_count AS SIGNED),
               CAST(total_records AS SIGNED),
               error_message
        FROM sync_task_log
        WHERE id = ?;
      "#,
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .unwrap()
  }

  async fn detail_status(pool: &MySqlPool, detail_id: i64) -> (String, Option<String>) {
    sqlx::query_as("SELECT status, error_message FROM sync_task_detail WHERE id = ?;")
      .bind(detail_id)
      .fetch_one(pool)
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn five_accounts_with_one_failure_end_as_failed_task() {
    use crate::db::test_support::{insert_account, test_pool, unique_id};

    let Some(pool) = test_pool().await else {
      return;
    };
    let user_id = unique_id();
    for n in 0..5 {
      insert_account(&pool, user_id, &format!("acct{n}")).await;
    }

    let outcome = trigger_sync(&pool, user_id, TaskType::Order, SyncMode::Incremental).await.unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.total_accounts, 5);

    sqlx::query("UPDATE sync_task_detail SET status = 'running', start_time = ? WHERE task_id = ?;")
      .bind(Utc::now())
      .bind(outcome.task_id)
      .execute(&pool)
      .await
      .unwrap();
    let details: Vec<ClaimedDetail> =
      sqlx::query_as::<_, (i64, i64)>("SELECT id, account_id FROM sync_task_detail WHERE task_id = ? ORDER BY id;")
        .bind(outcome.task_id)
        .fetch_all(&pool)
        .await
        .unwrap()
        .into_iter()
        .map(|(detail_id, account_id)| ClaimedDetail {
          detail_id,
          task_id: outcome.task_id,
          account_id,
          task_type: TaskType::Order,
          mode: SyncMode::Incremental,
        })
        .collect();
    assert_eq!(details.len(), 5);

    for (n, detail) in details.iter().enumerate().take(4) {
      if n == 2 {
        fail_detail(&pool, detail, "token expired").await.unwrap();
      } else {
        complete_detail(&pool, detail, 10).await.unwrap();
      }
    }
    let (status, completed, ..) = read_log(&pool, outcome.task_id).await;
    assert_eq!(status, "running");
    assert_eq!(completed, 4);

    complete_detail(&pool, &details[4], 10).await.unwrap();
    let (status, completed, success, failed, records, message) = read_log(&pool, outcome.task_id).await;
    assert_eq!(status, "failed");
    assert_eq!((completed, success, failed, records), (5, 4, 1, 40));
    assert_eq!(message.as_deref(), Some("1 account(s) failed"));
  }

  #[tokio::test]
  async fn stale_running_detail_is_failed_and_late_outcome_ignored() {
    use crate::db::test_support::{test_pool, unique_id};

    let Some(pool) = test_pool().await else {
      return;
    };
    let now = Utc::now();
    let user_id = unique_id();
    let task_id = sqlx::query(
      r#"
        INSERT INTO sync_task_log (user_id, task_type, sync_mode, status, total_accounts, start_time)
        VALUES (?, 'order', 'incremental', 'running', 2, ?);
      "#,
    )
    .bind(user_id)
    .bind(now - Duration::hours(2))
    .execute(&pool)
    .await
    .unwrap()
    .last_insert_id() as i64;

    let mut ids = Vec::new();
    for (account_id, started) in [(1, now - Duration::hours(2)), (2, now)] {
      let id = sqlx::query(
        r#"
          INSERT INTO sync_task_detail (task_id, account_id, status, start_time)
          VALUES (?, ?, 'running', ?);
        "#,
      )
      .bind(task_id)
      .bind(account_id)
      .bind(started)
      .execute(&pool)
      .await
      .unwrap()
      .last_insert_id() as i64;
      ids.push(id);
    }
    let claimed = |detail_id: i64, account_id: i64| ClaimedDetail {
      detail_id,
      task_id,
      account_id,
      task_type: TaskType::Order,
      mode: SyncMode::Incremental,
    };

    assert!(reclaim_stale_details(&pool, now, 900).await.unwrap() >= 1);
    assert_eq!(
      detail_status(&pool, ids[0]).await,
      ("failed".to_string(), Some(LEASE_EXPIRED_MESSAGE.to_string()))
    );
    assert_eq!(detail_status(&pool, ids[1]).await.0, "running");
    let (status, _, _, failed, ..) = read_log(&pool, task_id).await;
    assert_eq!((status.as_str(), failed), ("running", 1));

    complete_detail(&pool, &claimed(ids[0], 1), 99).await.unwrap();
    assert_eq!(detail_status(&pool, ids[0]).await.0, "failed");

    complete_detail(&pool, &claimed(ids[1], 2), 3).await.unwrap();
    let (status, completed, success, failed, records, _) = read_log(&pool, task_id).await;
    assert_eq!(status, "failed");
    assert_eq!((completed, success, failed, records), (2, 1, 1, 3));
  }
}
