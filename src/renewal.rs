use serde::Serialize;
use serde_json::Value;
use sqlx::MySqlPool;
use tracing::{info, warn};

use crate::crypto::TokenCipher;
use crate::order_sync::OrderStatus;
use crate::providers::douyin::{DouyinApiError, DouyinClient};

pub const MIN_BUDGET_YUAN: i64 = 100;
pub const MAX_BUDGET_YUAN: i64 = 5_000_000;
pub const MAX_EXTRA_HOURS: u32 = 720;

/// Validated renewal: budget in yuan, whole multiple of 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalRequest {
  pub budget_yuan: i64,
  pub extra_hours: u32,
}

impl RenewalRequest {
  pub fn budget_cents(&self) -> i64 {
    self.budget_yuan * 100
  }
}

/// Platform rejections, mapped to what the operator can do about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalFailure {
  BelowMinimumBudget,
  OrderNotFound,
  DurationTooLong,
  PlatformUnavailable,
  Other,
}

impl RenewalFailure {
  pub fn http_status(self) -> u16 {
    match self {
      RenewalFailure::BelowMinimumBudget | RenewalFailure::DurationTooLong => 400,
      RenewalFailure::OrderNotFound => 404,
      RenewalFailure::PlatformUnavailable => 503,
      RenewalFailure::Other => 502,
    }
  }

  pub fn user_message(self) -> &'static str {
    match self {
      RenewalFailure::BelowMinimumBudget => "renewal budget must be at least 100 yuan",
      RenewalFailure::OrderNotFound => "order not found on the platform or already finished",
      RenewalFailure::DurationTooLong => "a single renewal can extend delivery by at most 720 hours",
      RenewalFailure::PlatformUnavailable => "the ad platform is temporarily unavailable, retry later",
      RenewalFailure::Other => "the ad platform rejected the renewal",
    }
  }
}

const PLATFORM_INTERNAL_ERROR_CODE: i64 = 50000;

/// Prefers the structured code; falls back to the platform's message text.
pub fn classify_failure(err: &DouyinApiError) -> RenewalFailure {
  match err {
    DouyinApiError::Api { code, .. } if *code == PLATFORM_INTERNAL_ERROR_CODE => RenewalFailure::PlatformUnavailable,
    DouyinApiError::Timeout(_) | DouyinApiError::Transport(_) => RenewalFailure::PlatformUnavailable,
    DouyinApiError::Http { status, .. } if *status >= 500 => RenewalFailure::PlatformUnavailable,
    DouyinApiError::Api { message, .. } => {
      let lower = message.to_ascii_lowercase();
      if lower.contains("must be at least 10000") || lower.contains("minimum budget") {
        RenewalFailure::BelowMinimumBudget
      } else if lower.contains("record not found") {
        RenewalFailure::OrderNotFound
      } else if lower.contains("over 30 days") {
        RenewalFailure::DurationTooLong
      } else if lower.contains("internal error") || message.contains("服务内部错误") {
        RenewalFailure::PlatformUnavailable
      } else {
        RenewalFailure::Other
      }
    }
    _ => RenewalFailure::Other,
  }
}

#[derive(Debug, thiserror::Error)]
pub enum RenewalError {
  #[error("invalid renewal request: {0}")]
  Invalid(String),
  #[error("order {0} not found")]
  OrderNotFound(String),
  #[error("order {order_id} is {status}; only delivering orders can be renewed")]
  NotRenewable { order_id: String, status: String },
  #[error("order {0} has no task_id; resync orders first")]
  MissingTaskId(String),
  #[error("account credentials unusable: {0}")]
  Credential(String),
  #[error("{}: {source}", .failure.user_message())]
  Platform {
    failure: RenewalFailure,
    #[source]
    source: DouyinApiError,
  },
  #[error("storage error: {0}")]
  Storage(#[from] sqlx::Error),
}

impl RenewalError {
  pub fn http_status(&self) -> u16 {
    match self {
      RenewalError::Invalid(_) | RenewalError::NotRenewable { .. } | RenewalError::MissingTaskId(_) => 400,
      RenewalError::OrderNotFound(_) => 404,
      RenewalError::Credential(_) | RenewalError::Storage(_) => 500,
      RenewalError::Platform { failure, .. } => failure.http_status(),
    }
  }
}

/// Budget must be positive (duration-only renewals are rejected), 100..=5,000,000 yuan and
/// a multiple of 10. Hours are 0, 2, 6 or a multiple of 12, at most 720.
pub fn validate_request(budget_yuan: f64, extra_hours: u32) -> Result<RenewalRequest, RenewalError> {
  if !budget_yuan.is_finite() || budget_yuan <= 0.0 {
    return Err(RenewalError::Invalid(
      "budget must be greater than 0; duration cannot be extended alone".to_string(),
    ));
  }
  if budget_yuan.fract() != 0.0 {
    return Err(RenewalError::Invalid("budget must be a whole number of yuan".to_string()));
  }
  let budget = budget_yuan as i64;
  if !(MIN_BUDGET_YUAN..=MAX_BUDGET_YUAN).contains(&budget) {
    return Err(RenewalError::Invalid(format!(
      "budget must be between {MIN_BUDGET_YUAN} and {MAX_BUDGET_YUAN} yuan"
    )));
  }
  if budget % 10 != 0 {
    return Err(RenewalError::Invalid("budget must be a multiple of 10".to_string()));
  }
  if extra_hours > MAX_EXTRA_HOURS {
    return Err(RenewalError::Invalid(format!("extra hours must be at most {MAX_EXTRA_HOURS}")));
  }
  if !matches!(extra_hours, 0 | 2 | 6) && extra_hours % 12 != 0 {
    return Err(RenewalError::Invalid(
      "extra hours must be 0, 2, 6 or a multiple of 12".to_string(),
    ));
  }

  Ok(RenewalRequest {
    budget_yuan: budget,
    extra_hours,
  })
}

/// Adds budget and hours to a delivering order using its stored `task_id`.
pub async fn renew_order(
  pool: &MySqlPool,
  client: &DouyinClient,
  cipher: &TokenCipher,
  user_id: i64,
  order_id: &str,
  request: RenewalRequest,
) -> Result<Value, RenewalError> {
  let row = sqlx::query_as::<_, (Option<String>, Option<String>, String, Option<String>)>(
    r#"
      SELECT o.task_id, o.status, COALESCE(a.aweme_sec_uid, ''), a.access_token
      FROM orders o
      INNER JOIN accounts a ON a.id = o.account_id
      WHERE o.order_id = ? AND o.user_id = ? AND o.deleted = 0 AND a.deleted = 0
      LIMIT 1;
    "#,
  )
  .bind(order_id)
  .bind(user_id)
  .fetch_optional(pool)
  .await?;

  let Some((task_id, status, aweme_sec_uid, sealed_token)) = row else {
    return Err(RenewalError::OrderNotFound(order_id.to_string()));
  };

  let status = OrderStatus::parse(status.as_deref().unwrap_or(""));
  if !status.is_renewable() {
    return Err(RenewalError::NotRenewable {
      order_id: order_id.to_string(),
      status: status.as_str().to_string(),
    });
  }

  let task_id = task_id
    .filter(|t| !t.trim().is_empty())
    .ok_or_else(|| RenewalError::MissingTaskId(order_id.to_string()))?;

  let access_token = sealed_token
    .as_deref()
    .ok_or_else(|| RenewalError::Credential("account has no access token".to_string()))
    .and_then(|sealed| cipher.decrypt(sealed).map_err(|e| RenewalError::Credential(e.to_string())))?;

  match client
    .renew_order(&access_token, &aweme_sec_uid, &task_id, request.budget_cents(), request.extra_hours)
    .await
  {
    Ok(ack) => {
      info!(user_id, order_id, task_id = %task_id, budget_yuan = request.budget_yuan, extra_hours = request.extra_hours, "order renewed");
      Ok(ack)
    }
    Err(err) => {
      let failure = classify_failure(&err);
      warn!(user_id, order_id, failure = ?failure, error = %err, "order renewal rejected");
      Err(RenewalError::Platform { failure, source: err })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn api(code: i64, message: &str) -> DouyinApiError {
    DouyinApiError::Api {
      code,
      message: message.to_string(),
    }
  }

  #[test]
  fn accepts_valid_budget_and_hours() {
    let req = validate_request(100.0, 0).unwrap();
    assert_eq!(req.budget_cents(), 10_000);
    assert!(validate_request(5_000_000.0, 720).is_ok());
    for hours in [2, 6, 12, 24, 36, 48] {
      assert!(validate_request(200.0, hours).is_ok(), "hours={hours}");
    }
  }

  #[test]
  fn rejects_duration_only_and_out_of_range_budgets() {
    assert!(validate_request(0.0, 24).is_err());
    assert!(validate_request(-10.0, 0).is_err());
    assert!(validate_request(90.0, 0).is_err());
    assert!(validate_request(5_000_010.0, 0).is_err());
    assert!(validate_request(105.0, 0).is_err());
    assert!(validate_request(100.5, 0).is_err());
    assert!(validate_request(f64::NAN, 0).is_err());
  }

  #[test]
  fn rejects_unsupported_hours() {
    assert!(validate_request(100.0, 3).is_err());
    assert!(validate_request(100.0, 13).is_err());
    assert!(validate_request(100.0, 732).is_err());
  }

  #[test]
  fn classifies_platform_failures() {
    assert_eq!(classify_failure(&api(50000, "anything")), RenewalFailure::PlatformUnavailable);
    assert_eq!(
      classify_failure(&api(40000, "renewal_budget must be at least 10000")),
      RenewalFailure::BelowMinimumBudget
    );
    assert_eq!(classify_failure(&api(40002, "Record not found")), RenewalFailure::OrderNotFound);
    assert_eq!(
      classify_failure(&api(40000, "deliverySeconds over 30 days")),
      RenewalFailure::DurationTooLong
    );
    assert_eq!(classify_failure(&api(40100, "服务内部错误")), RenewalFailure::PlatformUnavailable);
    assert_eq!(classify_failure(&api(40000, "bad aweme_sec_uid")), RenewalFailure::Other);
    assert_eq!(
      classify_failure(&DouyinApiError::Timeout(Duration::from_secs(30))),
      RenewalFailure::PlatformUnavailable
    );
    assert_eq!(
      classify_failure(&DouyinApiError::Http {
        status: 502,
        body: String::new()
      }),
      RenewalFailure::PlatformUnavailable
    );
    assert_eq!(
      classify_failure(&DouyinApiError::Decode("x".to_string())),
      RenewalFailure::Other
    );
  }

  #[test]
  fn renewal_errors_map_to_http_statuses() {
    let err = RenewalError::Platform {
      failure: RenewalFailure::OrderNotFound,
      source: api(40002, "record not found"),
    };
    assert_eq!(err.http_status(), 404);
    assert!(err.to_string().contains("record not found"));
    assert_eq!(RenewalError::MissingTaskId("o1".to_string()).http_status(), 400);
    assert_eq!(RenewalError::OrderNotFound("o1".to_string()).http_status(), 404);
  }
}
