use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use douplus_sync::config::has_database_url;
use douplus_sync::db::truncate_string;
use douplus_sync::renewal::{renew_order, validate_request, RenewalError, RenewalRequest};
use douplus_sync::telemetry::init_tracing;
use douplus_sync::worker::SyncContext;

fn bearer_token(header_value: Option<&str>) -> Option<&str> {
  let value = header_value?;
  value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Result<Response<ResponseBody>, Error> {
  Ok(
    Response::builder()
      .status(status)
      .header("content-type", "application/json; charset=utf-8")
      .body(ResponseBody::from(value))?,
  )
}

#[derive(Deserialize)]
struct RenewBody {
  user_id: i64,
  order_id: String,
  budget: f64,
  #[serde(default)]
  hours: u32,
}

fn parse_renew_body(body: &[u8]) -> Result<(i64, String, RenewalRequest), RenewalError> {
  let parsed: RenewBody =
    serde_json::from_slice(body).map_err(|e| RenewalError::Invalid(format!("invalid json body: {e}")))?;
  if parsed.user_id <= 0 {
    return Err(RenewalError::Invalid("user_id is required".to_string()));
  }
  let order_id = parsed.order_id.trim().to_string();
  if order_id.is_empty() {
    return Err(RenewalError::Invalid("order_id is required".to_string()));
  }
  let request = validate_request(parsed.budget, parsed.hours)?;
  Ok((parsed.user_id, order_id, request))
}

fn renewal_error_response(err: &RenewalError) -> Result<Response<ResponseBody>, Error> {
  let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  let code = match err {
    RenewalError::Platform { failure, .. } => serde_json::to_value(failure)?,
    RenewalError::Invalid(_) => serde_json::json!("bad_request"),
    RenewalError::OrderNotFound(_) => serde_json::json!("not_found"),
    RenewalError::NotRenewable { .. } => serde_json::json!("not_renewable"),
    RenewalError::MissingTaskId(_) => serde_json::json!("missing_task_id"),
    RenewalError::Credential(_) | RenewalError::Storage(_) => serde_json::json!("internal_error"),
  };
  json_response(
    status,
    serde_json::json!({"ok": false, "error": code, "message": truncate_string(&err.to_string(), 2000)}),
  )
}

async fn handle_renew(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
  if method != Method::POST {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }

  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(headers.get("authorization").and_then(|v| v.to_str().ok())).unwrap_or("");

  if expected.is_empty() || provided != expected {
    return json_response(
      StatusCode::UNAUTHORIZED,
      serde_json::json!({"ok": false, "error": "unauthorized"}),
    );
  }

  let (user_id, order_id, request) = match parse_renew_body(&body) {
    Ok(parsed) => parsed,
    Err(err) => return renewal_error_response(&err),
  };

  if !has_database_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let ctx = SyncContext::from_env().await?;
  match renew_order(&ctx.pool, &ctx.client, &ctx.cipher, user_id, &order_id, request).await {
    Ok(ack) => json_response(
      StatusCode::OK,
      serde_json::json!({
        "ok": true,
        "order_id": order_id,
        "budget": request.budget_yuan,
        "hours": request.extra_hours,
        "platform": ack,
      }),
    ),
    Err(err) => renewal_error_response(&err),
  }
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();

  match handle_renew(&method, &headers, bytes).await {
    Ok(resp) => Ok(resp),
    Err(err) => {
      let message = truncate_string(&err.to_string(), 2000);
      json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        serde_json::json!({"ok": false, "error": "internal_error", "message": message}),
      )
    }
  }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  run(service_fn(handler)).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn returns_unauthorized_when_missing_internal_token() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let headers = HeaderMap::new();
    let response = handle_renew(&Method::POST, &headers, Bytes::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn rejects_invalid_budget_before_touching_storage() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());
    let body = Bytes::from(r#"{"user_id":1,"order_id":"7001","budget":0,"hours":24}"#);
    let response = handle_renew(&Method::POST, &headers, body).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn returns_not_configured_when_tidb_env_missing() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");
    std::env::remove_var("TIDB_DATABASE_URL");
    std::env::remove_var("DATABASE_URL");

    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());
    let body = Bytes::from(r#"{"user_id":1,"order_id":"7001","budget":200,"hours":24}"#);
    let response = handle_renew(&Method::POST, &headers, body).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
  }

  #[test]
  fn parses_renew_body() {
    let (user_id, order_id, request) =
      parse_renew_body(br#"{"user_id":9,"order_id":" 7001 ","budget":300}"#).unwrap();
    assert_eq!(user_id, 9);
    assert_eq!(order_id, "7001");
    assert_eq!(request.budget_cents(), 30_000);
    assert_eq!(request.extra_hours, 0);

    assert!(parse_renew_body(br#"{"user_id":9,"order_id":"","budget":300}"#).is_err());
    assert!(parse_renew_body(br#"{"user_id":9,"order_id":"1","budget":300,"hours":5}"#).is_err());
  }
}
