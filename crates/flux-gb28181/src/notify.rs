// 事件通知
// 按事件名 POST `{method, data}` 到配置的地址，对方应回复 OK

use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEVICES_ACTIVE: &str = "devices.active";
pub const DEVICES_REGISTER: &str = "devices.register";
pub const CHANNELS_ACTIVE: &str = "channels.active";
pub const RECORDS_STOP: &str = "records.stop";

/// 通知消息
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notify {
    pub method: String,
    pub data: Value,
}

impl Notify {
    pub fn devices_active(device_id: &str, status: &str, now: i64) -> Self {
        Self {
            method: DEVICES_ACTIVE.to_string(),
            data: json!({"deviceid": device_id, "status": status, "time": now}),
        }
    }

    pub fn devices_register(device: Value) -> Self {
        Self {
            method: DEVICES_REGISTER.to_string(),
            data: device,
        }
    }

    pub fn channels_active(channel_id: &str, status: &str, now: i64) -> Self {
        Self {
            method: CHANNELS_ACTIVE.to_string(),
            data: json!({"channelid": channel_id, "status": status, "time": now}),
        }
    }

    /// 录像自动停止；附带发起录像时的参数
    pub fn records_stop(url: &str, params: &HashMap<String, String>) -> Self {
        let mut data = serde_json::Map::new();
        for (k, v) in params {
            data.insert(k.clone(), Value::String(v.clone()));
        }
        data.insert("url".to_string(), Value::String(url.to_string()));
        Self {
            method: RECORDS_STOP.to_string(),
            data: Value::Object(data),
        }
    }
}

/// 通知发送器
pub struct Notifier {
    urls: HashMap<String, String>,
    client: Client,
}

impl Notifier {
    pub fn new(urls: HashMap<String, String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { urls, client }
    }

    /// 发送通知，失败只记日志
    pub async fn send(&self, notify: &Notify) {
        let Some(url) = self.urls.get(&notify.method) else {
            tracing::trace!(target: "gb28181::notify", method = %notify.method, "No notify url configured");
            return;
        };

        let reply = match self.client.post(url).json(notify).send().await {
            Ok(resp) => resp.text().await,
            Err(e) => Err(e),
        };

        match reply {
            Ok(body) if body.trim().eq_ignore_ascii_case("OK") => {
                tracing::debug!(target: "gb28181::notify", method = %notify.method, "Notify sent");
            }
            Ok(body) => {
                tracing::warn!(
                    target: "gb28181::notify",
                    method = %notify.method,
                    %url,
                    "Notify rejected: {}",
                    body
                );
            }
            Err(e) => {
                tracing::warn!(target: "gb28181::notify", method = %notify.method, %url, "Notify failed: {}", e);
            }
        }
    }

    /// 后台发送
    pub fn emit(self: &Arc<Self>, notify: Notify) {
        let notifier = self.clone();
        tokio::spawn(async move {
            notifier.send(&notify).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::mpsc;

    async fn spawn_receiver(reply: &'static str) -> (String, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(8);
        let app = Router::new()
            .route(
                "/notify",
                post(move |State(tx): State<mpsc::Sender<Value>>, Json(body): Json<Value>| async move {
                    let _ = tx.send(body).await;
                    reply
                }),
            )
            .with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/notify", addr), rx)
    }

    #[tokio::test]
    async fn test_send_posts_method_and_data() {
        let (url, mut rx) = spawn_receiver("OK").await;
        let notifier = Notifier::new(HashMap::from([(DEVICES_ACTIVE.to_string(), url)]));

        notifier
            .send(&Notify::devices_active("34020000001110000001", "OK", 1700000000))
            .await;

        let body = rx.recv().await.unwrap();
        assert_eq!(body["method"], "devices.active");
        assert_eq!(body["data"]["deviceid"], "34020000001110000001");
        assert_eq!(body["data"]["time"], 1700000000);
    }

    #[tokio::test]
    async fn test_unconfigured_and_rejected_are_not_fatal() {
        let (url, mut rx) = spawn_receiver("FAIL").await;
        let notifier = Notifier::new(HashMap::from([(CHANNELS_ACTIVE.to_string(), url)]));

        // 未配置地址的事件直接跳过
        notifier
            .send(&Notify::devices_active("34020000001110000001", "OK", 0))
            .await;
        notifier
            .send(&Notify::channels_active("34020000001320000001", "ON", 0))
            .await;

        let body = rx.recv().await.unwrap();
        assert_eq!(body["method"], "channels.active");
    }

    #[test]
    fn test_records_stop_payload() {
        let params = HashMap::from([("stream".to_string(), "0BEBC201".to_string())]);
        let notify = Notify::records_stop("http://m/record/a.mp4", &params);
        assert_eq!(notify.data["url"], "http://m/record/a.mp4");
        assert_eq!(notify.data["stream"], "0BEBC201");
    }
}
