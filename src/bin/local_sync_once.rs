use chrono::{DateTime, NaiveDateTime, Utc};
use vercel_runtime::Error;

use douplus_sync::config::database_url;
use douplus_sync::order_agg::aggregate_account;
use douplus_sync::sync_task::{SyncMode, TaskType};
use douplus_sync::telemetry::init_tracing;
use douplus_sync::token_refresh::refresh_single_account;
use douplus_sync::video_agg::{aggregate_recent_windows, aggregate_window, rebuild_all, RECENT_WINDOW_COUNT};
use douplus_sync::window::floor5;
use douplus_sync::worker::{run_unit, SyncContext};

fn validate_database_url() -> Result<(), Error> {
  let url = database_url().unwrap_or_default();
  if !url.contains("://") {
    return Err(Box::new(std::io::Error::other(
      "Missing or invalid TIDB_DATABASE_URL/DATABASE_URL (expected URL scheme like mysql://...)",
    )) as Error);
  }
  Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
  args
    .iter()
    .position(|a| a == flag)
    .and_then(|idx| args.get(idx + 1))
    .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
  args.iter().any(|a| a == flag)
}

/// Accepts `YYYY-MM-DD HH:MM[:SS]` or `YYYY-MM-DDTHH:MM[:SS]`, interpreted as UTC.
fn parse_window(input: &str) -> Option<DateTime<Utc>> {
  let normalized = input.trim().replace('T', " ");
  ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
    .iter()
    .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
    .map(|naive| floor5(naive.and_utc()))
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
  Sync {
    account_id: i64,
    task_type: TaskType,
    mode: SyncMode,
  },
  RefreshToken(i64),
  RebuildVideoAgg,
  Window(DateTime<Utc>),
  RecentWindows(usize),
}

fn parse_command(args: &[String]) -> Result<Command, String> {
  if has_flag(args, "--rebuild-video-agg") {
    return Ok(Command::RebuildVideoAgg);
  }
  if let Some(raw) = parse_flag_value(args, "--window") {
    return parse_window(&raw)
      .map(Command::Window)
      .ok_or_else(|| format!("Invalid --window {raw:?}; expected YYYY-MM-DD HH:MM"));
  }
  if has_flag(args, "--recent-windows") {
    let count = parse_flag_value(args, "--recent-windows")
      .and_then(|v| v.parse::<usize>().ok())
      .unwrap_or(RECENT_WINDOW_COUNT);
    return Ok(Command::RecentWindows(count.max(1)));
  }

  let account_id = parse_flag_value(args, "--account-id")
    .and_then(|v| v.trim().parse::<i64>().ok())
    .filter(|v| *v > 0)
    .ok_or_else(|| "Missing required --account-id".to_string())?;

  if has_flag(args, "--refresh-token") {
    return Ok(Command::RefreshToken(account_id));
  }

  let task_type = if has_flag(args, "--stats") {
    TaskType::Stats
  } else {
    TaskType::Order
  };
  let mode = if has_flag(args, "--full") {
    SyncMode::Full
  } else {
    SyncMode::Incremental
  };
  Ok(Command::Sync {
    account_id,
    task_type,
    mode,
  })
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  let args: Vec<String> = std::env::args().collect();

  let command = match parse_command(&args) {
    Ok(command) => command,
    Err(message) => {
      eprintln!("{message}");
      eprintln!("Example: cargo run --bin local_sync_once -- --account-id 12 --stats");
      eprintln!("         cargo run --bin local_sync_once -- --account-id 12 --refresh-token");
      eprintln!("         cargo run --bin local_sync_once -- --window \"2026-01-01 10:05\"");
      eprintln!("         cargo run --bin local_sync_once -- --rebuild-video-agg");
      return Ok(());
    }
  };

  validate_database_url()?;
  let ctx = SyncContext::from_env().await?;

  match command {
    Command::Sync {
      account_id,
      task_type,
      mode,
    } => {
      let records = run_unit(&ctx, task_type, mode, account_id).await?;
      println!(
        "account_id={account_id} task_type={} mode={} records={records}",
        task_type.as_str(),
        mode.as_str()
      );
      if task_type == TaskType::Order {
        let aggs = aggregate_account(&ctx.pool, account_id).await?;
        println!("order_agg_rows={aggs}");
      }
    }
    Command::RefreshToken(account_id) => {
      let expires_at = refresh_single_account(&ctx.pool, &ctx.cfg, &ctx.client, &ctx.cipher, account_id).await?;
      println!("account_id={account_id} token_expires_at={}", expires_at.to_rfc3339());
    }
    Command::RebuildVideoAgg => {
      let summary = rebuild_all(&ctx.pool).await?;
      println!(
        "rebuild windows={} succeeded={} failed={}",
        summary.windows, summary.succeeded, summary.failed
      );
    }
    Command::Window(stat_time) => {
      let rows = aggregate_window(&ctx.pool, stat_time).await?;
      println!("window={} video_agg_rows={rows}", stat_time.to_rfc3339());
    }
    Command::RecentWindows(count) => {
      let rows = aggregate_recent_windows(&ctx.pool, Utc::now(), count).await?;
      println!("recent_windows={count} video_agg_rows={rows}");
    }
  }

  Ok(())
}
