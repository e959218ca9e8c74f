use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use douplus_sync::config::has_database_url;
use douplus_sync::db::truncate_string;
use douplus_sync::telemetry::init_tracing;
use douplus_sync::worker::{run_tick, SyncContext};

const MAX_TICK_LIMIT: i64 = 200;

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

#[derive(Deserialize, Default)]
struct TickRequest {
  #[serde(default)]
  limit: Option<i64>,
}

fn parse_tick_request(body: &[u8]) -> Result<TickRequest, Error> {
  if body.iter().all(|b| b.is_ascii_whitespace()) {
    return Ok(TickRequest::default());
  }
  serde_json::from_slice(body)
    .map_err(|e| -> Error { Box::new(std::io::Error::other(format!("invalid json body: {e}"))) })
}

fn effective_limit(requested: Option<i64>, default_limit: i64) -> i64 {
  requested.filter(|v| *v > 0).unwrap_or(default_limit).clamp(1, MAX_TICK_LIMIT)
}

async fn handle_tick(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
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

  let parsed = match parse_tick_request(&body) {
    Ok(parsed) => parsed,
    Err(err) => {
      return json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({"ok": false, "error": "bad_request", "message": err.to_string()}),
      )
    }
  };

  if !has_database_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let ctx = SyncContext::from_env().await?;
  let limit = effective_limit(parsed.limit, ctx.cfg.tick_limit);
  let summary = run_tick(&ctx, limit).await?;

  json_response(
    StatusCode::OK,
    serde_json::json!({
      "ok": true,
      "limit": limit,
      "reclaimed": summary.reclaimed,
      "claimed": summary.claimed,
      "succeeded": summary.succeeded,
      "failed": summary.failed,
    }),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();

  match handle_tick(&method, &headers, bytes).await {
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
