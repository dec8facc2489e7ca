// 流媒体服务（ZLMediaKit）接口
// 所有接口带 secret 查询参数，返回 `{code:int, ...}`，code != 0 视为失败

use crate::{GatewayError, Result};
use async_trait::async_trait;
use flux_config::MediaConfig;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// 默认虚拟主机
pub const DEFAULT_VHOST: &str = "__defaultVhost__";
/// GB28181 推流使用的应用名
pub const RTP_APP: &str = "rtp";

/// 流媒体服务上的一路流
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub tracks: Vec<MediaTrack>,
}

/// 音视频轨道
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaTrack {
    /// 0 视频 / 1 音频
    #[serde(default)]
    pub codec_type: i32,
    #[serde(default)]
    pub codec_id: i32,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
    #[serde(default)]
    pub fps: i32,
}

impl MediaTrack {
    pub fn is_video(&self) -> bool {
        self.codec_type == 0
    }
}

/// codec_id -> 编码名
pub fn codec_name(codec_id: i32) -> &'static str {
    match codec_id {
        0 => "H264",
        1 => "H265",
        2 => "ACC",
        3 => "G711A",
        4 => "G711U",
        _ => "undefind",
    }
}

/// 流媒体服务能力
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// 推流是否仍然存在（getRtpInfo）
    async fn stream_exists(&self, stream_id: &str) -> Result<bool>;

    /// 查询流的轨道信息（getMediaList）
    async fn media_list(&self, stream_id: &str) -> Result<Vec<MediaInfo>>;

    /// 关闭流
    async fn close_stream(&self, stream_id: &str) -> Result<()>;

    /// 开始 MP4 录制
    async fn start_record(&self, stream_id: &str) -> Result<()>;

    /// 停止 MP4 录制
    async fn stop_record(&self, stream_id: &str) -> Result<()>;

    /// 添加拉流代理，返回代理 key
    async fn add_stream_proxy(&self, stream_id: &str, source_url: &str) -> Result<String>;
}

/// ZLMediaKit RESTful 客户端
pub struct ZlmClient {
    base: Url,
    secret: String,
    client: Client,
}

impl ZlmClient {
    pub fn new(config: &MediaConfig) -> Result<Self> {
        let base = Url::parse(&config.restful)
            .map_err(|e| GatewayError::Media(format!("invalid restful url {}: {}", config.restful, e)))?;
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            base,
            secret: config.secret.clone(),
            client,
        })
    }

    async fn call(&self, api: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = self
            .base
            .join(&format!("/index/api/{}", api))
            .map_err(|e| GatewayError::Media(e.to_string()))?;

        let mut query = vec![("secret", self.secret.as_str())];
        query.extend_from_slice(params);

        let body: Value = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await?
            .json()
            .await?;

        tracing::trace!(target: "gb28181::media", api, %body, "Media server reply");

        match body.get("code").and_then(Value::as_i64) {
            Some(0) => Ok(body),
            code => Err(GatewayError::Media(format!(
                "{} failed: code={:?} msg={}",
                api,
                code,
                body.get("msg").and_then(Value::as_str).unwrap_or_default()
            ))),
        }
    }

    fn record_params(stream_id: &str) -> [(&'static str, &str); 4] {
        [
            ("type", "1"),
            ("vhost", DEFAULT_VHOST),
            ("app", RTP_APP),
            ("stream", stream_id),
        ]
    }
}

#[async_trait]
impl MediaEngine for ZlmClient {
    async fn stream_exists(&self, stream_id: &str) -> Result<bool> {
        let body = self.call("getRtpInfo", &[("stream_id", stream_id)]).await?;
        Ok(body.get("exist").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn media_list(&self, stream_id: &str) -> Result<Vec<MediaInfo>> {
        let mut body = self.call("getMediaList", &[("stream", stream_id)]).await?;
        match body.get_mut("data").map(Value::take) {
            Some(data @ Value::Array(_)) => Ok(serde_json::from_value(data)?),
            _ => Ok(Vec::new()),
        }
    }

    async fn close_stream(&self, stream_id: &str) -> Result<()> {
        self.call("close_streams", &[("stream", stream_id), ("force", "1")])
            .await?;
        tracing::debug!(target: "gb28181::media", %stream_id, "Media stream closed");
        Ok(())
    }

    async fn start_record(&self, stream_id: &str) -> Result<()> {
        self.call("startRecord", &Self::record_params(stream_id)).await?;
        Ok(())
    }

    async fn stop_record(&self, stream_id: &str) -> Result<()> {
        self.call("stopRecord", &Self::record_params(stream_id)).await?;
        Ok(())
    }

    async fn add_stream_proxy(&self, stream_id: &str, source_url: &str) -> Result<String> {
        let body = self
            .call(
                "addStreamProxy",
                &[
                    ("vhost", DEFAULT_VHOST),
                    ("app", RTP_APP),
                    ("stream", stream_id),
                    ("url", source_url),
                ],
            )
            .await?;
        Ok(body
            .pointer("/data/key")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// 内存流媒体服务，记录调用
    #[derive(Default)]
    pub struct FakeMedia {
        pub live: Mutex<HashSet<String>>,
        pub calls: Mutex<Vec<String>>,
        pub fail_probe: std::sync::atomic::AtomicBool,
        pub tracks: Mutex<Vec<MediaTrack>>,
    }

    impl FakeMedia {
        pub fn set_live(&self, stream_id: &str) {
            self.live.lock().unwrap().insert(stream_id.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl MediaEngine for FakeMedia {
        async fn stream_exists(&self, stream_id: &str) -> Result<bool> {
            self.record(format!("probe:{}", stream_id));
            if self.fail_probe.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(GatewayError::Media("probe failed".to_string()));
            }
            Ok(self.live.lock().unwrap().contains(stream_id))
        }

        async fn media_list(&self, stream_id: &str) -> Result<Vec<MediaInfo>> {
            self.record(format!("media_list:{}", stream_id));
            Ok(vec![MediaInfo {
                app: RTP_APP.to_string(),
                stream: stream_id.to_string(),
                schema: "rtmp".to_string(),
                tracks: self.tracks.lock().unwrap().clone(),
            }])
        }

        async fn close_stream(&self, stream_id: &str) -> Result<()> {
            self.record(format!("close:{}", stream_id));
            self.live.lock().unwrap().remove(stream_id);
            Ok(())
        }

        async fn start_record(&self, stream_id: &str) -> Result<()> {
            self.record(format!("start_record:{}", stream_id));
            Ok(())
        }

        async fn stop_record(&self, stream_id: &str) -> Result<()> {
            self.record(format!("stop_record:{}", stream_id));
            Ok(())
        }

        async fn add_stream_proxy(&self, stream_id: &str, source_url: &str) -> Result<String> {
            self.record(format!("proxy:{}:{}", stream_id, source_url));
            Ok(format!("{}/{}/{}", DEFAULT_VHOST, RTP_APP, stream_id))
        }
    }
}
