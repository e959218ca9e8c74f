use chrono::{DateTime, Duration, Utc};
use sqlx::MySqlPool;
use tracing::{error, info, warn};
use vercel_runtime::Error;

use crate::config::SyncConfig;
use crate::crypto::TokenCipher;
use crate::db::{fetch_account, fetch_accounts_with_expiring_tokens, AccountRow};
use crate::providers::douyin::{DouyinClient, TokenGrant};

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RefreshSummary {
  pub candidates: usize,
  pub refreshed: usize,
  pub failed: usize,
}

/// Opens the account's sealed access token.
pub fn account_access_token(cipher: &TokenCipher, account: &AccountRow) -> Result<String, Error> {
  let sealed = account
    .access_token
    .as_deref()
    .filter(|v| !v.trim().is_empty())
    .ok_or_else(|| -> Error {
      Box::new(std::io::Error::other(format!(
        "account {} has no access token",
        account.id
      )))
    })?;
  cipher.decrypt(sealed).map_err(|e| -> Error { Box::new(e) })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RotatedTokens {
  pub access_token: String,
  pub refresh_token: String,
  pub expires_at: DateTime<Utc>,
}

/// The platform does not always rotate refresh tokens; keep the old one when none is returned.
pub fn rotate_tokens(previous_refresh_token: &str, grant: TokenGrant, now: DateTime<Utc>) -> RotatedTokens {
  RotatedTokens {
    access_token: grant.access_token,
    refresh_token: grant
      .refresh_token
      .unwrap_or_else(|| previous_refresh_token.to_string()),
    expires_at: now + Duration::seconds(grant.expires_in),
  }
}

async fn store_rotated_tokens(
  pool: &MySqlPool,
  cipher: &TokenCipher,
  account_id: i64,
  tokens: &RotatedTokens,
) -> Result<(), Error> {
  let sealed_access = cipher
    .encrypt(&tokens.access_token)
    .map_err(|e| -> Error { Box::new(e) })?;
  let sealed_refresh = cipher
    .encrypt(&tokens.refresh_token)
    .map_err(|e| -> Error { Box::new(e) })?;

  let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;
  sqlx::query(
    r#"
      UPDATE accounts
      SET access_token = ?,
          refresh_token = ?,
          token_expires_at = ?
      WHERE id = ?;
    "#,
  )
  .bind(sealed_access)
  .bind(sealed_refresh)
  .bind(tokens.expires_at)
  .bind(account_id)
  .execute(&mut *tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;
  tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;
  Ok(())
}

async fn refresh_account(
  pool: &MySqlPool,
  cfg: &SyncConfig,
  client: &DouyinClient,
  cipher: &TokenCipher,
  account: &AccountRow,
) -> Result<DateTime<Utc>, Error> {
  let (app_id, app_secret) = cfg.app_credentials()?;

  let sealed_refresh = account
    .refresh_token
    .as_deref()
    .filter(|v| !v.trim().is_empty())
    .ok_or_else(|| -> Error {
      Box::new(std::io::Error::other(format!(
        "account {} has no refresh token",
        account.id
      )))
    })?;
  let refresh_token = cipher
    .decrypt(sealed_refresh)
    .map_err(|e| -> Error { Box::new(e) })?;

  let grant = client
    .refresh_access_token(app_id, app_secret, &refresh_token)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;

  let tokens = rotate_tokens(&refresh_token, grant, Utc::now());
  store_rotated_tokens(pool, cipher, account.id, &tokens).await?;
  Ok(tokens.expires_at)
}

/// Refreshes every account whose token expires within `cfg.refresh_ahead_days`.
/// One account failing does not stop the scan.
pub async fn refresh_expiring_tokens(
  pool: &MySqlPool,
  cfg: &SyncConfig,
  client: &DouyinClient,
  cipher: &TokenCipher,
) -> Result<RefreshSummary, Error> {
  let horizon = Utc::now() + Duration::days(cfg.refresh_ahead_days);
  let accounts = fetch_accounts_with_expiring_tokens(pool, horizon).await?;

  let mut summary = RefreshSummary {
    candidates: accounts.len(),
    ..RefreshSummary::default()
  };
  if accounts.is_empty() {
    info!("no tokens due for refresh");
    return Ok(summary);
  }

  // Missing app credentials fail every account the same way.
  cfg.app_credentials()?;

  for account in &accounts {
    match refresh_account(pool, cfg, client, cipher, account).await {
      Ok(expires_at) => {
        summary.refreshed += 1;
        info!(account_id = account.id, %expires_at, "token refreshed");
      }
      Err(err) => {
        summary.failed += 1;
        error!(account_id = account.id, error = %err, "token refresh failed");
      }
    }
  }

  info!(
    candidates = summary.candidates,
    refreshed = summary.refreshed,
    failed = summary.failed,
    "token refresh scan finished"
  );
  Ok(summary)
}

pub async fn refresh_single_account(
  pool: &MySqlPool,
  cfg: &SyncConfig,
  client: &DouyinClient,
  cipher: &TokenCipher,
  account_id: i64,
) -> Result<DateTime<Utc>, Error> {
  let account = fetch_account(pool, account_id).await?.ok_or_else(|| -> Error {
    Box::new(std::io::Error::other(format!("account {account_id} not found")))
  })?;

  match refresh_account(pool, cfg, client, cipher, &account).await {
    Ok(expires_at) => {
      info!(account_id, %expires_at, "token refreshed on demand");
      Ok(expires_at)
    }
    Err(err) => {
      warn!(account_id, error = %err, "on-demand token refresh failed");
      Err(err)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 26, 2, 0, 0).unwrap()
  }

  #[test]
  fn keeps_previous_refresh_token_when_not_rotated() {
    let grant = TokenGrant {
      access_token: "at-new".to_string(),
      refresh_token: None,
      expires_in: 86_400,
    };
    let rotated = rotate_tokens("rt-old", grant, now());
    assert_eq!(rotated.access_token, "at-new");
    assert_eq!(rotated.refresh_token, "rt-old");
    assert_eq!(rotated.expires_at, now() + Duration::days(1));
  }

  #[test]
  fn replaces_refresh_token_when_rotated() {
    let grant = TokenGrant {
      access_token: "at-new".to_string(),
      refresh_token: Some("rt-new".to_string()),
      expires_in: 3600,
    };
    let rotated = rotate_tokens("rt-old", grant, now());
    assert_eq!(rotated.refresh_token, "rt-new");
    assert_eq!(rotated.expires_at, now() + Duration::hours(1));
  }

  #[test]
  fn opens_sealed_access_token_and_rejects_missing_one() {
    let cipher = TokenCipher::from_key_material("k").unwrap();
    let mut account = AccountRow {
      id: 9,
      user_id: 1,
      aweme_sec_uid: "sec".to_string(),
      nickname: None,
      access_token: Some(cipher.encrypt("at-1").unwrap()),
      refresh_token: None,
      token_expires_at: None,
    };
    assert_eq!(account_access_token(&cipher, &account).unwrap(), "at-1");

    account.access_token = Some("   ".to_string());
    assert!(account_access_token(&cipher, &account).is_err());

    account.access_token = Some("not-sealed".to_string());
    assert!(account_access_token(&cipher, &account).is_err());
  }
}
