use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use douplus_sync::config::has_database_url;
use douplus_sync::db::{get_pool, truncate_string};
use douplus_sync::sync_task::{fetch_task, latest_task_for_user, trigger_sync, SyncMode, TaskType};
use douplus_sync::telemetry::init_tracing;

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

fn query_value<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
  let query = query?;
  for part in query.split('&') {
    let Some((k, v)) = part.split_once('=') else {
      continue;
    };
    if k == key {
      return Some(v);
    }
  }
  None
}

fn bad_request(message: &str) -> Result<Response<ResponseBody>, Error> {
  json_response(
    StatusCode::BAD_REQUEST,
    serde_json::json!({"ok": false, "error": "bad_request", "message": message}),
  )
}

fn authorize(headers: &HeaderMap) -> Option<Result<Response<ResponseBody>, Error>> {
  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(headers.get("authorization").and_then(|v| v.to_str().ok())).unwrap_or("");

  if expected.is_empty() || provided != expected {
    return Some(json_response(
      StatusCode::UNAUTHORIZED,
      serde_json::json!({"ok": false, "error": "unauthorized"}),
    ));
  }

  if !has_database_url() {
    return Some(json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    ));
  }
  None
}

#[derive(Deserialize)]
struct TriggerRequest {
  user_id: i64,
  task_type: String,
  #[serde(default)]
  sync_mode: Option<String>,
}

fn parse_trigger(body: &[u8]) -> Result<(i64, TaskType, SyncMode), String> {
  let parsed: TriggerRequest = serde_json::from_slice(body).map_err(|e| format!("invalid json body: {e}"))?;
  if parsed.user_id <= 0 {
    return Err("user_id is required".to_string());
  }
  let task_type = TaskType::parse(&parsed.task_type).ok_or("task_type must be order or stats")?;
  let mode = match parsed.sync_mode.as_deref() {
    None | Some("") => SyncMode::Incremental,
    Some(raw) => SyncMode::parse(raw).ok_or("sync_mode must be full or incremental")?,
  };
  Ok((parsed.user_id, task_type, mode))
}

async fn handle_trigger(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
  if method != Method::POST {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }
  if let Some(denied) = authorize(headers) {
    return denied;
  }

  let (user_id, task_type, mode) = match parse_trigger(&body) {
    Ok(parsed) => parsed,
    Err(message) => return bad_request(&message),
  };

  let pool = get_pool().await?;
  let outcome = trigger_sync(pool, user_id, task_type, mode).await?;

  let status = if outcome.created {
    StatusCode::ACCEPTED
  } else {
    StatusCode::OK
  };
  json_response(
    status,
    serde_json::json!({
      "ok": true,
      "task_id": outcome.task_id,
      "created": outcome.created,
      "total_accounts": outcome.total_accounts,
      "task_type": task_type.as_str(),
      "sync_mode": mode.as_str(),
    }),
  )
}

#[derive(Debug, PartialEq, Eq)]
enum StatusLookup {
  ByTask(i64),
  LatestForUser(i64, TaskType),
}

fn parse_status_query(query: Option<&str>) -> Result<StatusLookup, &'static str> {
  if let Some(raw) = query_value(query, "task_id") {
    return raw
      .parse::<i64>()
      .ok()
      .filter(|v| *v > 0)
      .map(StatusLookup::ByTask)
      .ok_or("task_id must be a positive integer");
  }

  let user_id = query_value(query, "user_id")
    .and_then(|v| v.parse::<i64>().ok())
    .filter(|v| *v > 0)
    .ok_or("task_id or user_id is required")?;
  let task_type = query_value(query, "task_type")
    .map(|v| TaskType::parse(v).ok_or("task_type must be order or stats"))
    .transpose()?
    .unwrap_or(TaskType::Order);
  Ok(StatusLookup::LatestForUser(user_id, task_type))
}

async fn handle_status(method: &Method, headers: &HeaderMap, query: Option<&str>) -> Result<Response<ResponseBody>, Error> {
  if method != Method::GET {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }
  if let Some(denied) = authorize(headers) {
    return denied;
  }

  let lookup = match parse_status_query(query) {
    Ok(lookup) => lookup,
    Err(message) => return bad_request(message),
  };

  let pool = get_pool().await?;
  let task = match lookup {
    StatusLookup::ByTask(task_id) => fetch_task(pool, task_id).await?,
    StatusLookup::LatestForUser(user_id, task_type) => latest_task_for_user(pool, user_id, task_type).await?,
  };

  match task {
    Some(task) => json_response(StatusCode::OK, serde_json::json!({"ok": true, "task": task})),
    None => json_response(
      StatusCode::NOT_FOUND,
      serde_json::json!({"ok": false, "error": "not_found"}),
    ),
  }
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let query = req.uri().query().map(str::to_string);
  let action = query_value(query.as_deref(), "action").unwrap_or("status");
  let method = req.method().clone();
  let headers = req.headers().clone();

  let result = match action {
    "trigger" => {
      let bytes = req.into_body().collect().await?.to_bytes();
      handle_trigger(&method, &headers, bytes).await
    }
    "" | "status" => handle_status(&method, &headers, query.as_deref()).await,
    _ => json_response(
      StatusCode::NOT_FOUND,
      serde_json::json!({"ok": false, "error": "not_found"}),
    ),
  };

  match result {
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
