// HTTP 接口：点播/停止/录像查询/云端录像，以及流媒体服务回调入口

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use flux_gb28181::record_list::Records;
use flux_gb28181::{Gateway, GatewayError, PlayMode, PlayRequest, PlayResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

/// 网关错误到 HTTP 状态码
pub struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::ChannelNotFound(_)
            | GatewayError::DeviceNotFound(_)
            | GatewayError::StreamNotFound(_)
            | GatewayError::RecordingNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RecordingExists(_) => StatusCode::CONFLICT,
            GatewayError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            GatewayError::ChannelOffline(_)
            | GatewayError::DeviceOffline(_)
            | GatewayError::SsrcExhausted => StatusCode::SERVICE_UNAVAILABLE,
            e if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Negotiation(_) | GatewayError::Rejected(..) | GatewayError::Media(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(target: "gb28181d", "Request failed: {}", self.0);
        }

        let body = Json(json!({
            "error": self.0.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct PlayBody {
    #[serde(default)]
    pub mode: PlayMode,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ProxyBody {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: i64,
    pub end: i64,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/channels/:channel_id/play", post(play))
        .route("/api/v1/channels/:channel_id/records", get(record_list))
        .route("/api/v1/proxies", post(play_proxy))
        .route("/api/v1/streams/:stream_id/stop", post(stop))
        .route("/api/v1/streams/:stream_id/record/start", post(start_recording))
        .route("/api/v1/streams/:stream_id/record/stop", post(stop_recording))
        .route("/index/hook/:method", post(hook))
        .with_state(AppState { gateway })
}

async fn play(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    body: Option<Json<PlayBody>>,
) -> ApiResult<Json<PlayResult>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let req = PlayRequest {
        channel_id,
        mode: body.mode,
        start: body.start,
        end: body.end,
    };
    Ok(Json(state.gateway.play(req).await?))
}

async fn play_proxy(
    State(state): State<AppState>,
    Json(body): Json<ProxyBody>,
) -> ApiResult<Json<PlayResult>> {
    Ok(Json(state.gateway.play_proxy(&body.tag, &body.url).await?))
}

async fn stop(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.gateway.stop(&stream_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn record_list(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Records>> {
    Ok(Json(
        state
            .gateway
            .record_list(&channel_id, range.start, range.end)
            .await?,
    ))
}

async fn start_recording(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    params: Option<Json<HashMap<String, String>>>,
) -> ApiResult<Json<Value>> {
    let params = params.map(|Json(p)| p).unwrap_or_default();
    let job_id = state.gateway.start_recording(&stream_id, params).await?;
    Ok(Json(json!({ "job_id": job_id })))
}

async fn stop_recording(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.gateway.stop_recording(&stream_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// 流媒体服务回调，始终 200，结果在 JSON code 中
async fn hook(
    State(state): State<AppState>,
    Path(method): Path<String>,
    body: Bytes,
) -> Json<Value> {
    Json(state.gateway.dispatch_hook(&method, &body).await)
}
