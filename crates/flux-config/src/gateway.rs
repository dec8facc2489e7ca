use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// GB28181 网关配置（对应 gb28181.toml）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub sip: SipConfig,
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub media: MediaConfig,
    pub stream: StreamConfig,
    pub record: RecordConfig,
    pub gb28181: SequenceConfig,
    /// 事件通知地址，key 中的 `_` 会被替换为 `.`（devices_active -> devices.active）
    pub notify: HashMap<String, String>,
    pub schedule: ScheduleConfig,
    pub log: LogConfig,
}

impl GatewayConfig {
    /// 事件名到通知地址的映射
    pub fn notify_urls(&self) -> HashMap<String, String> {
        self.notify
            .iter()
            .filter(|(_, url)| !url.is_empty())
            .map(|(k, v)| (k.replace('_', "."), v.clone()))
            .collect()
    }
}

/// SIP 监听配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SipConfig {
    /// UDP 监听地址
    pub udp: String,

    /// TCP 监听地址（为空则不启用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,

    /// 对外通告的地址（Via / Contact），为空时取监听地址
    pub host: String,

    /// 请求等待响应的超时时间（秒）
    pub response_timeout_secs: u64,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            udp: "0.0.0.0:5060".to_string(),
            tcp: None,
            host: String::new(),
            response_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sea-orm 连接串
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/gb28181.db?mode=rwc".to_string(),
        }
    }
}

/// 流媒体服务（ZLMediaKit）地址配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    /// RESTful 接口地址
    pub restful: String,
    /// HTTP 播放地址（HLS / 录像文件）
    pub http: String,
    /// WebSocket-FLV 播放地址
    pub ws: String,
    pub rtmp: String,
    pub rtsp: String,
    /// RTP 收流地址，设备推流的目标
    pub rtp: String,
    /// 接口密钥
    pub secret: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            restful: "http://127.0.0.1:80".to_string(),
            http: "http://127.0.0.1:80".to_string(),
            ws: "ws://127.0.0.1:80".to_string(),
            rtmp: "rtmp://127.0.0.1:1935".to_string(),
            rtsp: "rtsp://127.0.0.1:554".to_string(),
            rtp: "http://127.0.0.1:10000".to_string(),
            secret: String::new(),
        }
    }
}

/// 推流协议开关（on_publish 回复）
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    pub hls: bool,
    pub rtmp: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            hls: true,
            rtmp: true,
        }
    }
}

/// 录像配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordConfig {
    /// 录像根目录，与流媒体服务的 record 目录一致
    pub filepath: PathBuf,

    /// 保留天数，0 按 7 天处理
    pub expire: i64,

    /// 单次录像最长时间（秒），-1 不限制
    pub recordmax: i64,
}

impl RecordConfig {
    pub fn expire_days(&self) -> i64 {
        if self.expire <= 0 {
            7
        } else {
            self.expire
        }
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            filepath: PathBuf::from("./data/record"),
            expire: 7,
            recordmax: 600,
        }
    }
}

/// 平台编号配置，首次启动时写入 sys_info
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// SIP 域 / 行政区划
    pub region: String,
    /// 通道编号前缀
    pub cid: String,
    pub cnum: i64,
    /// 设备编号前缀
    pub did: String,
    pub dnum: i64,
    /// 平台 SIP ID
    pub lid: String,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            region: "3402000000".to_string(),
            cid: "34020000001320".to_string(),
            cnum: 0,
            did: "34020000001110".to_string(),
            dnum: 0,
            lid: "34020000002000000001".to_string(),
        }
    }
}

/// 后台任务周期
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub reconcile_interval_secs: u64,
    pub expiry_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 300,
            expiry_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// text | json
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_gateway_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.sip.udp, "0.0.0.0:5060");
        assert_eq!(config.record.recordmax, 600);
        assert_eq!(config.schedule.reconcile_interval_secs, 300);
        assert_eq!(config.gb28181.region, "3402000000");
    }

    #[test]
    fn test_expire_days_zero_falls_back() {
        let mut record = RecordConfig::default();
        record.expire = 0;
        assert_eq!(record.expire_days(), 7);
        record.expire = 30;
        assert_eq!(record.expire_days(), 30);
    }

    #[test]
    fn test_notify_urls_key_rewrite() {
        let mut config = GatewayConfig::default();
        config
            .notify
            .insert("devices_active".to_string(), "http://hook/a".to_string());
        config.notify.insert("records_stop".to_string(), String::new());

        let urls = config.notify_urls();
        assert_eq!(urls.get("devices.active").map(String::as_str), Some("http://hook/a"));
        assert!(!urls.contains_key("records.stop"));
    }
}
