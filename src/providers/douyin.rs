use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::NaiveDate;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::config::SyncConfig;

/// Upper bound on `order_ids` per report call; callers chunk.
pub const MAX_REPORT_ORDER_IDS: usize = 100;

const ACCESS_TOKEN_HEADER: &str = "Access-Token";
const DEFAULT_TOKEN_TTL_SECS: i64 = 86_400;

#[derive(Debug, thiserror::Error)]
pub enum DouyinApiError {
  #[error("douyin transport error: {0}")]
  Transport(String),
  #[error("douyin request timed out after {0:?}")]
  Timeout(Duration),
  #[error("douyin http status {status}: {body}")]
  Http { status: u16, body: String },
  #[error("douyin api error code={code}: {message}")]
  Api { code: i64, message: String },
  #[error("douyin response decode error: {0}")]
  Decode(String),
  #[error("invalid douyin request: {0}")]
  InvalidRequest(String),
}

impl DouyinApiError {
  pub fn code(&self) -> Option<i64> {
    match self {
      DouyinApiError::Api { code, .. } => Some(*code),
      _ => None,
    }
  }

  /// Raw platform message for application errors, the rendered error otherwise.
  pub fn message(&self) -> String {
    match self {
      DouyinApiError::Api { message, .. } => message.clone(),
      other => other.to_string(),
    }
  }
}

pub fn id_from_value(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => {
      let trimmed = s.trim();
      (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Option::<Value>::deserialize(deserializer)?;
  Ok(value.as_ref().and_then(id_from_value))
}

fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Option::<Value>::deserialize(deserializer)?;
  Ok(value.as_ref().and_then(value_f64))
}

fn de_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Option::<Value>::deserialize(deserializer)?;
  Ok(match value {
    Some(Value::Array(items)) => items
      .iter()
      .filter_map(|v| v.as_str().map(str::to_string))
      .collect(),
    Some(Value::String(s)) => vec![s],
    _ => Vec::new(),
  })
}

fn value_f64(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse::<f64>().ok(),
    _ => None,
  }
}

fn metric_f64(metrics: &Value, key: &str) -> f64 {
  metrics.get(key).and_then(value_f64).unwrap_or(0.0)
}

fn metric_i64(metrics: &Value, key: &str) -> i64 {
  metric_f64(metrics, key).round() as i64
}

fn cents_to_yuan(cents: f64) -> f64 {
  cents / 100.0
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteOrder {
  #[serde(default, deserialize_with = "de_opt_id")]
  pub order_id: Option<String>,
  #[serde(default, deserialize_with = "de_opt_id")]
  pub task_id: Option<String>,
  #[serde(default)]
  pub task_status: Option<String>,
  /// Minor units.
  #[serde(default, deserialize_with = "de_opt_f64")]
  pub budget: Option<f64>,
  #[serde(default)]
  pub order_create_time: Option<String>,
  #[serde(default)]
  pub order_start_time: Option<String>,
  #[serde(default)]
  pub order_end_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteItemInfo {
  #[serde(default, deserialize_with = "de_opt_id")]
  pub aweme_item_id: Option<String>,
  #[serde(default)]
  pub aweme_item_title: Option<String>,
  #[serde(default, deserialize_with = "de_string_list")]
  pub aweme_item_cover: Vec<String>,
  #[serde(default)]
  pub aweme_author_name: Option<String>,
  #[serde(default, deserialize_with = "de_string_list")]
  pub aweme_author_avatar: Vec<String>,
}

/// One entry of the order listing, kept in the platform's nested shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderEnvelope {
  #[serde(default)]
  pub order: RemoteOrder,
  #[serde(default)]
  pub item_info_list: Vec<RemoteItemInfo>,
}

/// Report metrics for one order; money already converted to major units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderMetrics {
  pub order_id: String,
  pub item_id: Option<String>,
  pub stat_cost: f64,
  pub total_play: i64,
  pub custom_like: i64,
  pub dy_comment: i64,
  pub dy_share: i64,
  pub dy_follow: i64,
  pub play_duration_5s_rank: f64,
  pub dy_home_visited: i64,
  pub dp_target_convert_cnt: i64,
  pub custom_convert_cost: f64,
  pub show_cnt: i64,
  pub live_click_source_cnt: i64,
  pub live_gift_uv: i64,
  pub live_gift_amount: f64,
  pub live_comment_cnt: i64,
  pub live_follow_count: i64,
  pub live_gift_cnt: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub expires_in: i64,
}

pub fn parse_order_list(data: &Value) -> Result<Vec<OrderEnvelope>, DouyinApiError> {
  match data.get("order_list") {
    None | Some(Value::Null) => Ok(Vec::new()),
    Some(list) => serde_json::from_value::<Vec<OrderEnvelope>>(list.clone())
      .map_err(|e| DouyinApiError::Decode(format!("order_list: {e}"))),
  }
}

pub fn parse_metrics_report(data: &Value) -> HashMap<String, OrderMetrics> {
  let mut out = HashMap::new();
  let Some(items) = data.get("data").and_then(Value::as_array) else {
    return out;
  };

  for item in items {
    let dimension = item.get("dimension_data").unwrap_or(&Value::Null);
    let metrics = item.get("metrics_data").unwrap_or(&Value::Null);

    let Some(order_id) = dimension.get("order_id").and_then(id_from_value) else {
      continue;
    };

    let row = OrderMetrics {
      item_id: dimension.get("item_id").and_then(id_from_value),
      stat_cost: cents_to_yuan(metric_f64(metrics, "stat_cost")),
      total_play: metric_i64(metrics, "total_play"),
      custom_like: metric_i64(metrics, "custom_like"),
      dy_comment: metric_i64(metrics, "dy_comment"),
      dy_share: metric_i64(metrics, "dy_share"),
      dy_follow: metric_i64(metrics, "dy_follow"),
      play_duration_5s_rank: metric_f64(metrics, "play_duration_5s_rank"),
      dy_home_visited: metric_i64(metrics, "dy_home_visited"),
      dp_target_convert_cnt: metric_i64(metrics, "dp_target_convert_cnt"),
      custom_convert_cost: cents_to_yuan(metric_f64(metrics, "custom_convert_cost")),
      show_cnt: metric_i64(metrics, "show_cnt"),
      live_click_source_cnt: metric_i64(metrics, "live_click_source_cnt"),
      live_gift_uv: metric_i64(metrics, "live_gift_uv"),
      live_gift_amount: cents_to_yuan(metric_f64(metrics, "live_gift_amount")),
      live_comment_cnt: metric_i64(metrics, "live_comment_cnt"),
      live_follow_count: metric_i64(metrics, "douplus_live_follow_count"),
      live_gift_cnt: metric_i64(metrics, "live_gift_cnt"),
      order_id: order_id.clone(),
    };
    out.insert(order_id, row);
  }

  out
}

pub fn parse_token_grant(data: &Value) -> Result<TokenGrant, DouyinApiError> {
  let access_token = data
    .get("access_token")
    .and_then(Value::as_str)
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .ok_or_else(|| DouyinApiError::Decode("refresh response missing access_token".to_string()))?
    .to_string();

  let refresh_token = data
    .get("refresh_token")
    .and_then(Value::as_str)
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(str::to_string);

  let expires_in = data
    .get("expires_in")
    .and_then(value_f64)
    .map(|v| v as i64)
    .filter(|v| *v > 0)
    .unwrap_or(DEFAULT_TOKEN_TTL_SECS);

  Ok(TokenGrant {
    access_token,
    refresh_token,
    expires_in,
  })
}

/// Unwraps `{code, message, data}`; `code != 0` is the failure signal regardless of HTTP status.
pub fn unwrap_envelope(body: &Value) -> Result<Value, DouyinApiError> {
  let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
  if code != 0 {
    let message = body
      .get("message")
      .and_then(Value::as_str)
      .unwrap_or("unknown error")
      .to_string();
    return Err(DouyinApiError::Api { code, message });
  }
  Ok(body.get("data").cloned().unwrap_or(Value::Null))
}

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Clone)]
pub struct DouyinClient {
  api_base_url: String,
  oauth_base_url: String,
  timeout: Duration,
  http: HttpsClient,
}

impl DouyinClient {
  pub fn new(api_base_url: &str, oauth_base_url: &str, timeout: Duration) -> Result<Self, DouyinApiError> {
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
      .with_native_roots()
      .map_err(|e| DouyinApiError::Transport(e.to_string()))?
      .https_or_http()
      .enable_http1()
      .build();

    let http = Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);

    Ok(Self {
      api_base_url: api_base_url.trim_end_matches('/').to_string(),
      oauth_base_url: oauth_base_url.trim_end_matches('/').to_string(),
      timeout,
      http,
    })
  }

  pub fn from_config(cfg: &SyncConfig) -> Result<Self, DouyinApiError> {
    Self::new(&cfg.api_base_url, &cfg.oauth_base_url, cfg.http_timeout)
  }

  fn endpoint(base: &str, path: &str) -> Result<Url, DouyinApiError> {
    Url::parse(&format!("{base}{path}")).map_err(|e| DouyinApiError::InvalidRequest(e.to_string()))
  }

  async fn send(
    &self,
    method: Method,
    url: &Url,
    access_token: Option<&str>,
    body: Option<&Value>,
  ) -> Result<Value, DouyinApiError> {
    let payload = match body {
      Some(v) => Bytes::from(serde_json::to_vec(v).map_err(|e| DouyinApiError::InvalidRequest(e.to_string()))?),
      None => Bytes::new(),
    };

    let mut builder = Request::builder()
      .method(method)
      .uri(url.as_str())
      .header(ACCEPT, "application/json")
      .header(CONTENT_TYPE, "application/json");
    if let Some(token) = access_token {
      builder = builder.header(ACCESS_TOKEN_HEADER, token);
    }
    let req = builder
      .body(Full::new(payload))
      .map_err(|e| DouyinApiError::InvalidRequest(e.to_string()))?;

    let exchange = async {
      let resp = self
        .http
        .request(req)
        .await
        .map_err(|e| DouyinApiError::Transport(e.to_string()))?;
      let status = resp.status();
      let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| DouyinApiError::Transport(e.to_string()))?
        .to_bytes();
      Ok::<_, DouyinApiError>((status, bytes))
    };

    let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
      .await
      .map_err(|_| DouyinApiError::Timeout(self.timeout))??;

    if status != StatusCode::OK {
      return Err(DouyinApiError::Http {
        status: status.as_u16(),
        body: String::from_utf8_lossy(&bytes).chars().take(500).collect(),
      });
    }

    let json = serde_json::from_slice::<Value>(&bytes)
      .map_err(|e| DouyinApiError::Decode(format!("invalid json response: {e}")))?;
    unwrap_envelope(&json)
  }

  pub async fn list_orders(
    &self,
    access_token: &str,
    aweme_sec_uid: &str,
    page: u32,
    page_size: u32,
  ) -> Result<Vec<OrderEnvelope>, DouyinApiError> {
    let mut url = Self::endpoint(&self.api_base_url, "/douplus/order/list/")?;
    url
      .query_pairs_mut()
      .append_pair("aweme_sec_uid", aweme_sec_uid)
      .append_pair("page", &page.to_string())
      .append_pair("page_size", &page_size.to_string());

    let data = self.send(Method::GET, &url, Some(access_token), None).await?;
    let orders = parse_order_list(&data)?;
    debug!(page, page_size, returned = orders.len(), "douyin order list page");
    Ok(orders)
  }

  /// Report metrics keyed by order id. `order_ids = None` asks for every order in the range.
  pub async fn get_metrics(
    &self,
    access_token: &str,
    aweme_sec_uid: &str,
    order_ids: Option<&[String]>,
    begin_date: NaiveDate,
    end_date: NaiveDate,
  ) -> Result<HashMap<String, OrderMetrics>, DouyinApiError> {
    let mut body = json!({
      "aweme_sec_uid": aweme_sec_uid,
      "begin_time": begin_date.format("%Y-%m-%d").to_string(),
      "end_time": end_date.format("%Y-%m-%d").to_string(),
    });

    if let Some(ids) = order_ids {
      if ids.len() > MAX_REPORT_ORDER_IDS {
        return Err(DouyinApiError::InvalidRequest(format!(
          "at most {MAX_REPORT_ORDER_IDS} order ids per report call, got {}",
          ids.len()
        )));
      }
      if !ids.is_empty() {
        body["order_ids"] = json!(ids);
      }
    }

    let url = Self::endpoint(&self.api_base_url, "/douplus/order/report/")?;
    let data = self.send(Method::POST, &url, Some(access_token), Some(&body)).await?;
    let metrics = parse_metrics_report(&data);
    debug!(requested = order_ids.map(|ids| ids.len()), returned = metrics.len(), "douyin order report");
    Ok(metrics)
  }

  pub async fn renew_order(
    &self,
    access_token: &str,
    aweme_sec_uid: &str,
    task_id: &str,
    extra_budget_cents: i64,
    extra_hours: u32,
  ) -> Result<Value, DouyinApiError> {
    let numeric_task_id = task_id
      .trim()
      .parse::<i64>()
      .map_err(|_| DouyinApiError::InvalidRequest(format!("task_id is not numeric: {task_id}")))?;

    let body = json!({
      "aweme_sec_uid": aweme_sec_uid,
      "task_id": numeric_task_id,
      "renewal_budget": extra_budget_cents,
      "renewal_delivery_hour": extra_hours,
    });

    let url = Self::endpoint(&self.api_base_url, "/douplus/order/renew/")?;
    let data = self.send(Method::POST, &url, Some(access_token), Some(&body)).await?;
    info!(task_id = numeric_task_id, extra_budget_cents, extra_hours, "douyin order renewed");
    Ok(data)
  }

  pub async fn refresh_access_token(
    &self,
    app_id: &str,
    app_secret: &str,
    refresh_token: &str,
  ) -> Result<TokenGrant, DouyinApiError> {
    let body = json!({
      "app_id": app_id,
      "secret": app_secret,
      "grant_type": "refresh_token",
      "refresh_token": refresh_token,
    });

    let url = Self::endpoint(&self.oauth_base_url, "/oauth2/refresh_token/")?;
    let data = self.send(Method::POST, &url, None, Some(&body)).await?;
    parse_token_grant(&data)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use hyper::body::Incoming;
  use hyper::server::conn::http1;
  use hyper::service::service_fn;
  use hyper::Response;
  use hyper_util::rt::TokioIo;
  use tokio::net::TcpListener;

  #[test]
  fn parses_nested_order_envelopes_with_numeric_ids() {
    let data = json!({
      "order_list": [
        {
          "order": {
            "order_id": 7312345678901234567u64,
            "task_id": "88001",
            "task_status": "DELIVERING",
            "budget": 10000,
            "order_create_time": "2026-01-26 10:00:00"
          },
          "item_info_list": [
            {
              "aweme_item_id": 7300000000000000001u64,
              "aweme_item_title": "title",
              "aweme_item_cover": ["https://cover/1.jpg", "https://cover/2.jpg"],
              "aweme_author_name": "author",
              "aweme_author_avatar": ["https://avatar/1.jpg"]
            }
          ]
        },
        { "order": { "order_id": "o-2" } }
      ],
      "page_info": { "total_num": 2 }
    });

    let orders = parse_order_list(&data).unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].order.order_id.as_deref(), Some("7312345678901234567"));
    assert_eq!(orders[0].order.task_id.as_deref(), Some("88001"));
    assert_eq!(orders[0].order.budget, Some(10000.0));
    assert_eq!(orders[0].item_info_list[0].aweme_item_id.as_deref(), Some("7300000000000000001"));
    assert_eq!(orders[0].item_info_list[0].aweme_item_cover.len(), 2);
    assert!(orders[1].item_info_list.is_empty());
  }

  #[test]
  fn missing_order_list_is_an_empty_page() {
    assert!(parse_order_list(&json!({"page_info": {"total_num": 0}})).unwrap().is_empty());
    assert!(parse_order_list(&Value::Null).unwrap().is_empty());
  }

  #[test]
  fn metrics_report_converts_cents_and_renames_live_follow() {
    let data = json!({
      "data": [
        {
          "dimension_data": { "order_id": "o1", "item_id": "v1" },
          "metrics_data": {
            "stat_cost": 12345,
            "total_play": 100,
            "custom_like": 7,
            "dy_share": 2,
            "custom_convert_cost": 250,
            "live_gift_amount": 99,
            "douplus_live_follow_count": 3,
            "play_duration_5s_rank": 0.42
          }
        },
        {
          "dimension_data": { "order_id": "o2" },
          "metrics_data": {}
        },
        { "dimension_data": {}, "metrics_data": { "total_play": 5 } }
      ]
    });

    let metrics = parse_metrics_report(&data);
    assert_eq!(metrics.len(), 2);

    let o1 = &metrics["o1"];
    assert_eq!(o1.item_id.as_deref(), Some("v1"));
    assert!((o1.stat_cost - 123.45).abs() < 1e-9);
    assert!((o1.custom_convert_cost - 2.5).abs() < 1e-9);
    assert!((o1.live_gift_amount - 0.99).abs() < 1e-9);
    assert_eq!(o1.total_play, 100);
    assert_eq!(o1.live_follow_count, 3);
    assert_eq!(o1.play_duration_5s_rank, 0.42);

    let o2 = &metrics["o2"];
    assert_eq!(o2.item_id, None);
    assert_eq!(o2.total_play, 0);
    assert_eq!(o2.stat_cost, 0.0);
  }

  #[test]
  fn envelope_with_nonzero_code_is_an_api_error() {
    let err = unwrap_envelope(&json!({"code": 40002, "message": "record not found", "data": {}})).unwrap_err();
    assert_eq!(err.code(), Some(40002));
    assert_eq!(err.message(), "record not found");

    let err = unwrap_envelope(&json!({"message": "no code"})).unwrap_err();
    assert_eq!(err.code(), Some(-1));

    let data = unwrap_envelope(&json!({"code": 0, "data": {"x": 1}})).unwrap();
    assert_eq!(data["x"], 1);
  }

  #[test]
  fn token_grant_defaults_ttl_and_keeps_missing_refresh_token_absent() {
    let grant = parse_token_grant(&json!({"access_token": "new-at"})).unwrap();
    assert_eq!(grant.access_token, "new-at");
    assert_eq!(grant.refresh_token, None);
    assert_eq!(grant.expires_in, 86_400);

    let grant = parse_token_grant(&json!({"access_token": "a", "refresh_token": "r", "expires_in": 3600})).unwrap();
    assert_eq!(grant.refresh_token.as_deref(), Some("r"));
    assert_eq!(grant.expires_in, 3600);

    assert!(parse_token_grant(&json!({"refresh_token": "r"})).is_err());
  }

  async fn serve_one(listener: TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let io = TokioIo::new(stream);
    http1::Builder::new()
      .serve_connection(
        io,
        service_fn(|req: Request<Incoming>| async move {
          let path = req.uri().path().to_string();
          let query = req.uri().query().unwrap_or("").to_string();
          let token = req
            .headers()
            .get(ACCESS_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
          let body = req.into_body().collect().await.unwrap().to_bytes();
          let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

          let reply = match path.as_str() {
            "/douplus/order/list/" if token == "at-1" && query.contains("aweme_sec_uid=sec%2B1") => json!({
              "code": 0,
              "message": "OK",
              "data": { "order_list": [ { "order": { "order_id": "o1", "task_status": "DELIVERING" } } ] }
            }),
            "/douplus/order/report/" if payload["order_ids"] == json!(["o1"]) && payload["begin_time"] == "2026-01-01" => json!({
              "code": 0,
              "data": { "data": [ { "dimension_data": { "order_id": "o1" }, "metrics_data": { "stat_cost": 100, "total_play": 100 } } ] }
            }),
            "/douplus/order/renew/" => json!({ "code": 40001, "message": "renewal budget below minimum budget" }),
            "/oauth2/refresh_token/" if token.is_empty() && payload["grant_type"] == "refresh_token" => json!({
              "code": 0,
              "data": { "access_token": "at-2", "refresh_token": "rt-2", "expires_in": 7200 }
            }),
            _ => json!({ "code": 40100, "message": format!("unexpected request {path}") }),
          };

          Ok::<_, hyper::Error>(
            Response::builder()
              .status(StatusCode::OK)
              .header("content-type", "application/json")
              .body(Full::new(Bytes::from(reply.to_string())))
              .unwrap(),
          )
        }),
      )
      .await
      .unwrap();
  }

  async fn client_against_mock() -> (DouyinClient, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{}", addr);
    let task = tokio::spawn(serve_one(listener));
    let client = DouyinClient::new(&base_url, &base_url, Duration::from_secs(5)).unwrap();
    (client, task)
  }

  #[tokio::test]
  async fn lists_orders_against_mock_server() {
    let (client, task) = client_against_mock().await;
    let orders = client.list_orders("at-1", "sec+1", 1, 100).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].order.order_id.as_deref(), Some("o1"));
    drop(client);
    task.await.unwrap();
  }

  #[tokio::test]
  async fn fetches_scoped_metrics_against_mock_server() {
    let (client, task) = client_against_mock().await;
    let begin = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
    let ids = vec!["o1".to_string()];
    let metrics = client.get_metrics("at-1", "sec", Some(&ids), begin, end).await.unwrap();
    assert_eq!(metrics["o1"].stat_cost, 1.0);
    assert_eq!(metrics["o1"].total_play, 100);
    drop(client);
    task.await.unwrap();
  }

  #[tokio::test]
  async fn renewal_surfaces_platform_message() {
    let (client, task) = client_against_mock().await;
    let err = client.renew_order("at-1", "sec", "88001", 10_000, 0).await.unwrap_err();
    assert_eq!(err.code(), Some(40001));
    assert!(err.message().contains("minimum budget"));
    drop(client);
    task.await.unwrap();
  }

  #[tokio::test]
  async fn refreshes_token_without_access_token_header() {
    let (client, task) = client_against_mock().await;
    let grant = client.refresh_access_token("app", "secret", "rt-1").await.unwrap();
    assert_eq!(grant.access_token, "at-2");
    assert_eq!(grant.refresh_token.as_deref(), Some("rt-2"));
    assert_eq!(grant.expires_in, 7200);
    drop(client);
    task.await.unwrap();
  }

  #[tokio::test]
  async fn rejects_oversized_order_id_batches_before_sending() {
    let client = DouyinClient::new("http://127.0.0.1:9", "http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
    let ids: Vec<String> = (0..101).map(|i| format!("o{i}")).collect();
    let day = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    let err = client.get_metrics("at", "sec", Some(&ids), day, day).await.unwrap_err();
    assert!(matches!(err, DouyinApiError::InvalidRequest(_)));
  }
}
