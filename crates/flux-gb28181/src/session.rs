// 点播会话表
// 按 stream id 与按通道（仅实时点播，用于去重）两张索引

use crate::sip::{Destination, NameAddr, SipMethod, SipRequest, ViaHop};
use crate::store::{channel, stream};
use dashmap::DashMap;
use flux_config::MediaConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 点播类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayMode {
    #[default]
    Live,
    Playback,
}

impl PlayMode {
    /// SSRC 首位与会话行 mode 字段
    pub fn as_i32(self) -> i32 {
        match self {
            PlayMode::Live => 0,
            PlayMode::Playback => 1,
        }
    }

    pub fn from_i32(v: i32) -> Self {
        if v == 1 {
            PlayMode::Playback
        } else {
            PlayMode::Live
        }
    }
}

/// 流来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    /// 设备推流
    Push,
    /// 流媒体服务拉取通道配置的地址
    Pull,
    /// 任意源代理
    Proxy,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Push => channel::STREAM_TYPE_PUSH,
            StreamType::Pull => channel::STREAM_TYPE_PULL,
            StreamType::Proxy => "proxy",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pull" => StreamType::Pull,
            "proxy" => StreamType::Proxy,
            _ => StreamType::Push,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// INVITE 建立的对话，发送 BYE 时使用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialog {
    pub call_id: String,
    pub cseq: u32,
    /// 本端地址（含 from tag）
    pub local: NameAddr,
    /// 通道地址（含 to tag）
    pub remote: NameAddr,
    /// 设备来源地址
    pub destination: Destination,
}

impl Dialog {
    /// 由持久化的会话行恢复对话
    pub fn from_row(
        row: &stream::Model,
        local: NameAddr,
        remote: NameAddr,
        destination: Destination,
    ) -> Self {
        let mut local = local;
        let mut remote = remote;
        local.params = tag_params(&row.ftag);
        remote.params = tag_params(&row.ttag);
        Self {
            call_id: row.call_id.clone(),
            cseq: u32::try_from(row.cseq).unwrap_or(0),
            local,
            remote,
            destination,
        }
    }

    /// 构造 BYE，CSeq 递增
    pub fn bye(&self, via: ViaHop, contact: &NameAddr) -> SipRequest {
        let mut req = SipRequest::new(SipMethod::Bye, self.remote.uri.to_string());
        req.add_header("Via", via.to_string());
        req.add_header("From", self.local.to_string());
        req.add_header("To", self.remote.to_string());
        req.add_header("Call-ID", self.call_id.clone());
        req.add_header("CSeq", format!("{} BYE", self.cseq + 1));
        req.add_header("Contact", contact.to_string());
        req.add_header("Max-Forwards", "70");
        req.add_header("User-Agent", crate::USER_AGENT);
        req
    }
}

fn tag_params(value: &serde_json::Value) -> crate::sip::Params {
    let map = serde_json::from_value(value.clone()).unwrap_or_default();
    crate::sip::Params::from_map(&map)
}

/// 会话来源：推流带对话，拉流/代理只有源地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSource {
    Push { dialog: Dialog },
    Pull { url: String },
    Proxy { url: String },
}

impl SessionSource {
    pub fn stream_type(&self) -> StreamType {
        match self {
            SessionSource::Push { .. } => StreamType::Push,
            SessionSource::Pull { .. } => StreamType::Pull,
            SessionSource::Proxy { .. } => StreamType::Proxy,
        }
    }
}

/// 播放结果（返回给调用方的描述）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayResult {
    #[serde(rename = "channelid")]
    pub channel_id: String,
    #[serde(rename = "streamid")]
    pub stream_id: String,
    pub ssrc: String,
    /// HLS
    pub http: String,
    pub rtmp: String,
    pub rtsp: String,
    #[serde(rename = "ws-flv")]
    pub ws_flv: String,
}

impl PlayResult {
    pub fn new(media: &MediaConfig, channel_id: &str, stream_id: &str, ssrc: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            stream_id: stream_id.to_string(),
            ssrc: ssrc.to_string(),
            http: format!("{}/rtp/{}/hls.m3u8", media.http, stream_id),
            rtmp: format!("{}/rtp/{}", media.rtmp, stream_id),
            rtsp: format!("{}/rtp/{}", media.rtsp, stream_id),
            ws_flv: format!("{}/rtp/{}.live.flv", media.ws, stream_id),
        }
    }
}

/// 运行中的会话
#[derive(Debug, Clone)]
pub struct Session {
    pub stream_id: String,
    pub channel_id: String,
    pub device_id: String,
    pub mode: PlayMode,
    pub source: SessionSource,
    /// 流媒体服务已确认收到流
    pub confirmed: bool,
    /// 未确认时的等待截止时间
    pub expires_at: i64,
    pub result: PlayResult,
}

impl Session {
    pub fn stream_type(&self) -> StreamType {
        self.source.stream_type()
    }

    pub fn dialog(&self) -> Option<&Dialog> {
        match &self.source {
            SessionSource::Push { dialog } => Some(dialog),
            _ => None,
        }
    }
}

/// 会话表
#[derive(Default)]
pub struct SessionTable {
    by_stream: DashMap<String, Session>,
    /// channel_id -> 实时点播结果
    by_channel: DashMap<String, PlayResult>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        if session.mode == PlayMode::Live {
            self.by_channel
                .insert(session.channel_id.clone(), session.result.clone());
        }
        self.by_stream.insert(session.stream_id.clone(), session);
    }

    pub fn get(&self, stream_id: &str) -> Option<Session> {
        self.by_stream.get(stream_id).map(|s| s.value().clone())
    }

    /// 通道当前的实时点播
    pub fn live(&self, channel_id: &str) -> Option<PlayResult> {
        self.by_channel.get(channel_id).map(|r| r.value().clone())
    }

    /// 从两张表中移除
    pub fn remove(&self, stream_id: &str) -> Option<Session> {
        let (_, session) = self.by_stream.remove(stream_id)?;
        if session.mode == PlayMode::Live {
            self.by_channel
                .remove_if(&session.channel_id, |_, r| r.stream_id == stream_id);
        }
        Some(session)
    }

    /// 标记已收流，返回更新后的会话
    pub fn confirm(&self, stream_id: &str) -> Option<Session> {
        let mut entry = self.by_stream.get_mut(stream_id)?;
        entry.confirmed = true;
        Some(entry.value().clone())
    }

    pub fn find_by_call_id(&self, call_id: &str) -> Option<Session> {
        self.by_stream
            .iter()
            .find(|s| s.dialog().map(|d| d.call_id.as_str()) == Some(call_id))
            .map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.by_stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_stream.is_empty()
    }
}
