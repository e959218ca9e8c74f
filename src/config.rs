use std::time::Duration;

use vercel_runtime::Error;

pub const DEFAULT_API_BASE_URL: &str = "https://api.oceanengine.com/open_api/v3.0";
pub const DEFAULT_OAUTH_BASE_URL: &str = "https://ad.oceanengine.com/open_api";

#[derive(Debug, Clone)]
pub struct SyncConfig {
  pub api_base_url: String,
  pub oauth_base_url: String,
  pub app_id: Option<String>,
  pub app_secret: Option<String>,
  pub token_encryption_key: Option<String>,
  pub page_size: u32,
  pub stats_window_days: i64,
  pub worker_concurrency: usize,
  pub tick_limit: i64,
  /// Seconds a claimed detail may stay `running` before the next tick fails it.
  pub detail_lease_secs: i64,
  pub refresh_ahead_days: i64,
  pub http_timeout: Duration,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      api_base_url: DEFAULT_API_BASE_URL.to_string(),
      oauth_base_url: DEFAULT_OAUTH_BASE_URL.to_string(),
      app_id: None,
      app_secret: None,
      token_encryption_key: None,
      page_size: 100,
      stats_window_days: 7,
      worker_concurrency: 4,
      tick_limit: 20,
      detail_lease_secs: 900,
      refresh_ahead_days: 7,
      http_timeout: Duration::from_secs(30),
    }
  }
}

fn env_string(key: &str) -> Option<String> {
  std::env::var(key)
    .ok()
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
}

fn env_i64(key: &str, default: i64, min: i64, max: i64) -> i64 {
  env_string(key)
    .and_then(|v| v.parse::<i64>().ok())
    .unwrap_or(default)
    .clamp(min, max)
}

impl SyncConfig {
  pub fn from_env() -> Self {
    let defaults = Self::default();
    Self {
      api_base_url: env_string("DOUPLUS_API_BASE_URL").unwrap_or(defaults.api_base_url),
      oauth_base_url: env_string("DOUPLUS_OAUTH_BASE_URL").unwrap_or(defaults.oauth_base_url),
      app_id: env_string("DOUPLUS_APP_ID"),
      app_secret: env_string("DOUPLUS_APP_SECRET"),
      token_encryption_key: env_string("TOKEN_ENCRYPTION_KEY"),
      page_size: env_i64("SYNC_PAGE_SIZE", 100, 10, 100) as u32,
      stats_window_days: env_i64("SYNC_STATS_WINDOW_DAYS", 7, 1, 90),
      worker_concurrency: env_i64("SYNC_WORKER_CONCURRENCY", 4, 1, 32) as usize,
      tick_limit: env_i64("SYNC_TICK_LIMIT", 20, 1, 200),
      detail_lease_secs: env_i64("SYNC_DETAIL_LEASE_SECS", 900, 60, 7200),
      refresh_ahead_days: env_i64("TOKEN_REFRESH_AHEAD_DAYS", 7, 1, 30),
      http_timeout: Duration::from_secs(env_i64("SYNC_HTTP_TIMEOUT_SECS", 30, 5, 120) as u64),
    }
  }

  pub fn encryption_key(&self) -> Result<&str, Error> {
    self
      .token_encryption_key
      .as_deref()
      .ok_or_else(|| Box::new(std::io::Error::other("Missing TOKEN_ENCRYPTION_KEY")) as Error)
  }

  pub fn app_credentials(&self) -> Result<(&str, &str), Error> {
    let app_id = self
      .app_id
      .as_deref()
      .ok_or_else(|| Box::new(std::io::Error::other("Missing DOUPLUS_APP_ID")) as Error)?;
    let app_secret = self
      .app_secret
      .as_deref()
      .ok_or_else(|| Box::new(std::io::Error::other("Missing DOUPLUS_APP_SECRET")) as Error)?;
    Ok((app_id, app_secret))
  }
}

pub fn database_url() -> Option<String> {
  env_string("TIDB_DATABASE_URL").or_else(|| env_string("DATABASE_URL"))
}

pub fn has_database_url() -> bool {
  database_url().is_some()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clamps_numeric_env_values() {
    std::env::set_var("SYNC_PAGE_SIZE_TEST_ONLY", "5000");
    assert_eq!(env_i64("SYNC_PAGE_SIZE_TEST_ONLY", 100, 10, 100), 100);
    std::env::set_var("SYNC_PAGE_SIZE_TEST_ONLY", "nope");
    assert_eq!(env_i64("SYNC_PAGE_SIZE_TEST_ONLY", 100, 10, 100), 100);
    std::env::set_var("SYNC_PAGE_SIZE_TEST_ONLY", "3");
    assert_eq!(env_i64("SYNC_PAGE_SIZE_TEST_ONLY", 100, 10, 100), 10);
    std::env::remove_var("SYNC_PAGE_SIZE_TEST_ONLY");
  }

  #[test]
  fn missing_app_credentials_is_an_error() {
    let cfg = SyncConfig::default();
    assert!(cfg.app_credentials().is_err());
    assert!(cfg.encryption_key().is_err());
  }
}
