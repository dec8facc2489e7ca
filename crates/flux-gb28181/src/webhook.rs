// 流媒体服务回调
// 按回调名解析为具体类型后驱动会话确认、关闭、重新拉流与录像完成

use crate::gateway::{unix_now, Gateway};
use crate::media::RTP_APP;
use crate::session::{Session, SessionSource, StreamType};
use crate::store::stream;
use sea_orm::Set;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

/// on_stream_changed
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChanged {
    pub regist: bool,
    #[serde(default)]
    pub app: String,
    pub stream: String,
    #[serde(default)]
    pub schema: String,
}

/// on_stream_not_found
#[derive(Debug, Clone, Deserialize)]
pub struct StreamNotFound {
    #[serde(default)]
    pub app: String,
    pub stream: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub params: String,
}

/// on_stream_none_reader
#[derive(Debug, Clone, Deserialize)]
pub struct NoneReader {
    #[serde(default)]
    pub app: String,
    pub stream: String,
    #[serde(default)]
    pub schema: String,
}

/// on_record_mp4
#[derive(Debug, Clone, Deserialize)]
pub struct RecordMp4 {
    #[serde(default)]
    pub app: String,
    pub stream: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub time_len: f64,
    #[serde(default)]
    pub url: String,
}

fn success() -> Value {
    json!({"code": 0, "msg": "success"})
}

fn body_error() -> Value {
    json!({"code": -1, "msg": "body error"})
}

fn parse<T: DeserializeOwned>(method: &str, body: &[u8]) -> Option<T> {
    match serde_json::from_slice(body) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(target: "gb28181::media", %method, "Malformed hook body: {}", e);
            None
        }
    }
}

impl Gateway {
    /// 处理一次回调，返回回复给流媒体服务的 JSON
    pub async fn dispatch_hook(&self, method: &str, body: &[u8]) -> Value {
        tracing::debug!(target: "gb28181::media", %method, "Media hook");
        match method {
            "on_server_started" => success(),
            "on_http_access" => json!({"code": 0, "second": 86400}),
            "on_play" => json!({"code": 0, "msg": ""}),
            "on_publish" => json!({
                "code": 0,
                "enableHls": self.config.stream.hls,
                "enableMP4": false,
                "enableRtxp": self.config.stream.rtmp,
                "msg": "success",
            }),
            "on_stream_changed" => match parse::<StreamChanged>(method, body) {
                Some(hook) => {
                    self.on_stream_changed(&hook).await;
                    success()
                }
                None => body_error(),
            },
            "on_stream_not_found" => match parse::<StreamNotFound>(method, body) {
                Some(hook) => {
                    self.on_stream_not_found(&hook).await;
                    success()
                }
                None => body_error(),
            },
            "on_stream_none_reader" => match parse::<NoneReader>(method, body) {
                Some(hook) => {
                    self.stop_logged(&hook.stream, "no reader").await;
                    json!({"code": 0, "close": true})
                }
                None => body_error(),
            },
            "on_record_mp4" => match parse::<RecordMp4>(method, body) {
                Some(hook) => {
                    if let Err(e) = self.on_record_mp4(&hook.stream, &hook.url).await {
                        tracing::warn!(target: "gb28181::record", stream_id = %hook.stream, "Record completion failed: {}", e);
                    }
                    success()
                }
                None => body_error(),
            },
            _ => body_error(),
        }
    }

    async fn stop_logged(&self, stream_id: &str, reason: &str) {
        tracing::info!(target: "gb28181::media", %stream_id, %reason, "Closing stream");
        if let Err(e) = self.stop(stream_id).await {
            tracing::warn!(target: "gb28181::media", %stream_id, "Stop failed: {}", e);
        }
    }

    async fn on_stream_changed(&self, hook: &StreamChanged) {
        let stream_id = hook.stream.as_str();
        if hook.regist {
            if hook.schema != "rtmp" {
                return;
            }
            match self.sessions.confirm(stream_id) {
                Some(session) => self.on_confirmed(&session).await,
                None if hook.app == RTP_APP => {
                    self.stop_logged(stream_id, "unknown stream registered").await;
                }
                None => {}
            }
        } else if hook.schema == "hls" && self.sessions.get(stream_id).is_some() {
            self.stop_logged(stream_id, "stream unregistered").await;
        }
    }

    async fn on_confirmed(&self, session: &Session) {
        let stream_id = session.stream_id.as_str();
        let confirmed = stream::ActiveModel {
            confirmed: Set(true),
            ..Default::default()
        };
        if let Err(e) = self.store.update_open_stream(stream_id, confirmed).await {
            tracing::warn!(target: "gb28181::media", %stream_id, "Failed to persist confirmation: {}", e);
        }
        tracing::info!(target: "gb28181::media", %stream_id, channel_id = %session.channel_id, "Stream confirmed");

        if session.stream_type() == StreamType::Proxy {
            return;
        }
        if let Err(e) = self.sync_codec(stream_id, &session.channel_id).await {
            tracing::warn!(target: "gb28181::media", %stream_id, "Codec sync failed: {}", e);
        }
    }

    async fn on_stream_not_found(&self, hook: &StreamNotFound) {
        let stream_id = hook.stream.as_str();
        let Some(session) = self.sessions.get(stream_id) else {
            return;
        };

        if session.confirmed {
            match &session.source {
                SessionSource::Push { .. } => {
                    self.stop_logged(stream_id, "pushed stream lost").await;
                }
                SessionSource::Pull { url } | SessionSource::Proxy { url } => {
                    match self.media.add_stream_proxy(stream_id, url).await {
                        Ok(_) => {
                            tracing::info!(target: "gb28181::media", %stream_id, "Stream re-pulled");
                        }
                        Err(e) => {
                            tracing::warn!(target: "gb28181::media", %stream_id, "Re-pull failed: {}", e);
                        }
                    }
                }
            }
        } else if unix_now() > session.expires_at {
            self.stop_logged(stream_id, "no stream before deadline").await;
        }
    }
}
