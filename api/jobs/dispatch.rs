use hyper::{HeaderMap, Method, StatusCode};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use douplus_sync::config::has_database_url;
use douplus_sync::db::truncate_string;
use douplus_sync::scheduler::{run_stage, Stage};
use douplus_sync::sync_task::{SyncMode, TaskType};
use douplus_sync::telemetry::init_tracing;
use douplus_sync::video_agg::rebuild_all;
use douplus_sync::worker::{sync_all_accounts, SyncContext};

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

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DispatchStage {
  Orders,
  Stats,
  VideoAgg,
  TokenRefresh,
  RebuildVideoAgg,
}

impl DispatchStage {
  fn from_query(query: Option<&str>) -> Option<Self> {
    match query_value(query, "stage")? {
      "orders" => Some(DispatchStage::Orders),
      "stats" => Some(DispatchStage::Stats),
      "video_agg" => Some(DispatchStage::VideoAgg),
      "token_refresh" => Some(DispatchStage::TokenRefresh),
      "rebuild_video_agg" => Some(DispatchStage::RebuildVideoAgg),
      _ => None,
    }
  }

  fn name(&self) -> &'static str {
    match self {
      DispatchStage::Orders => "orders",
      DispatchStage::Stats => "stats",
      DispatchStage::VideoAgg => "video_agg",
      DispatchStage::TokenRefresh => "token_refresh",
      DispatchStage::RebuildVideoAgg => "rebuild_video_agg",
    }
  }
}

fn mode_from_query(query: Option<&str>) -> SyncMode {
  query_value(query, "mode")
    .and_then(SyncMode::parse)
    .unwrap_or(SyncMode::Incremental)
}

async fn run_dispatch(stage: DispatchStage, mode: SyncMode) -> Result<serde_json::Value, Error> {
  let ctx = SyncContext::from_env().await?;
  let outcome = match stage {
    DispatchStage::Orders if mode == SyncMode::Full => {
      serde_json::to_value(sync_all_accounts(&ctx, TaskType::Order, mode).await?)?
    }
    DispatchStage::Stats if mode == SyncMode::Full => {
      serde_json::to_value(sync_all_accounts(&ctx, TaskType::Stats, mode).await?)?
    }
    DispatchStage::Orders => run_stage(&ctx, Stage::OrderSync).await?,
    DispatchStage::Stats => run_stage(&ctx, Stage::StatsSync).await?,
    DispatchStage::VideoAgg => run_stage(&ctx, Stage::VideoAgg).await?,
    DispatchStage::TokenRefresh => run_stage(&ctx, Stage::TokenRefresh).await?,
    DispatchStage::RebuildVideoAgg => serde_json::to_value(rebuild_all(&ctx.pool).await?)?,
  };
  Ok(outcome)
}

async fn handle_dispatch(
  stage: Option<DispatchStage>,
  mode: SyncMode,
  method: &Method,
  headers: &HeaderMap,
) -> Result<Response<ResponseBody>, Error> {
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

  let Some(stage) = stage else {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({
        "ok": false,
        "error": "bad_request",
        "message": "stage must be one of orders, stats, video_agg, token_refresh, rebuild_video_agg"
      }),
    );
  };

  if !has_database_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let outcome = run_dispatch(stage, mode).await?;
  json_response(
    StatusCode::OK,
    serde_json::json!({
      "ok": true,
      "stage": stage.name(),
      "mode": mode.as_str(),
      "result": outcome
    }),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let stage = DispatchStage::from_query(req.uri().query());
  let mode = mode_from_query(req.uri().query());
  let method = req.method().clone();
  let headers = req.headers().clone();

  match handle_dispatch(stage, mode, &method, &headers).await {
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
