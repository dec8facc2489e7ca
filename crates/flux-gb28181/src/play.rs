// 点播编排
// 推流通道走 INVITE/200/ACK 协商；拉流通道与代理直接交给流媒体服务拉取

use crate::gateway::{unix_now, Gateway};
use crate::media::codec_name;
use crate::registry::ActiveDevice;
use crate::session::{Dialog, PlayMode, PlayResult, Session, SessionSource, StreamType};
use crate::sip::{random_token, OfferKind, SdpSession, SipError, SipMethod, SipRequest, SipResponse};
use crate::store::{channel, stream};
use crate::{GatewayError, Result};
use sea_orm::Set;
use serde::Deserialize;
use url::Url;

/// 通道最近一次目录上报距今超过该值视为离线（秒）
pub const CHANNEL_ACTIVE_WINDOW: i64 = 1800;

/// 推流建立后等待流媒体确认的时间；也是未完成协商的会话行的宽限期（秒）
pub const CONFIRM_WINDOW: i64 = 120;

/// 点播请求
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayRequest {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub mode: PlayMode,
    /// 回放起止时间（Unix 秒）
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

impl PlayRequest {
    pub fn live(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            ..Default::default()
        }
    }

    pub fn playback(channel_id: impl Into<String>, start: i64, end: i64) -> Self {
        Self {
            channel_id: channel_id.into(),
            mode: PlayMode::Playback,
            start: Some(start),
            end: Some(end),
        }
    }

    fn offer_kind(&self) -> Result<OfferKind> {
        match self.mode {
            PlayMode::Live => Ok(OfferKind::Live),
            PlayMode::Playback => match (self.start, self.end) {
                (Some(start), Some(end)) if start < end => Ok(OfferKind::Playback {
                    channel_id: self.channel_id.clone(),
                    start,
                    end,
                }),
                _ => Err(GatewayError::InvalidMessage(
                    "playback requires start < end".to_string(),
                )),
            },
        }
    }
}

fn stream_row(
    stream_id: &str,
    ssrc: &str,
    channel_id: &str,
    device_id: &str,
    mode: PlayMode,
    stream_type: StreamType,
    status: i32,
    now: i64,
) -> stream::ActiveModel {
    stream::ActiveModel {
        stream_id: Set(stream_id.to_string()),
        ssrc: Set(ssrc.to_string()),
        channel_id: Set(channel_id.to_string()),
        device_id: Set(device_id.to_string()),
        mode: Set(mode.as_i32()),
        stream_type: Set(stream_type.to_string()),
        status: Set(status),
        confirmed: Set(false),
        call_id: Set(String::new()),
        cseq: Set(0),
        ftag: Set(serde_json::json!({})),
        ttag: Set(serde_json::json!({})),
        stop: Set(false),
        msg: Set(String::new()),
        expires_at: Set(0),
        created_at: Set(now),
        ..Default::default()
    }
}

impl Gateway {
    /// 点播通道；实时点播同一通道只建立一路
    pub async fn play(&self, req: PlayRequest) -> Result<PlayResult> {
        let channel = self
            .store
            .find_channel(&req.channel_id)
            .await?
            .ok_or_else(|| GatewayError::ChannelNotFound(req.channel_id.clone()))?;

        match StreamType::parse(&channel.stream_type) {
            StreamType::Push => self.play_push(&channel, &req).await,
            _ => {
                if channel.url.is_empty() {
                    return Err(GatewayError::Negotiation(format!(
                        "channel {} has no pull url",
                        channel.channel_id
                    )));
                }
                self.play_source(
                    &channel.channel_id,
                    &channel.device_id,
                    &channel.url,
                    StreamType::Pull,
                )
                .await
            }
        }
    }

    /// 代理任意源地址，`tag` 作为 stream id
    pub async fn play_proxy(&self, tag: &str, url: &str) -> Result<PlayResult> {
        if tag.is_empty() || url.is_empty() {
            return Err(GatewayError::InvalidMessage(
                "proxy requires tag and url".to_string(),
            ));
        }
        self.play_source(tag, "", url, StreamType::Proxy).await
    }

    /// 拉流 / 代理：stream id 即通道 ID 或 tag
    async fn play_source(
        &self,
        stream_id: &str,
        device_id: &str,
        url: &str,
        stream_type: StreamType,
    ) -> Result<PlayResult> {
        let _guard = self.lock_play(stream_id).await;
        if let Some(session) = self.sessions.get(stream_id) {
            return Ok(session.result);
        }

        let key = self.media.add_stream_proxy(stream_id, url).await?;
        let now = unix_now();
        self.store
            .close_stream(stream_id, false, Some("replaced".to_string()))
            .await?;
        self.store
            .insert_stream(stream_row(
                stream_id,
                "",
                stream_id,
                device_id,
                PlayMode::Live,
                stream_type,
                stream::STATUS_ACTIVE,
                now,
            ))
            .await?;

        let result = PlayResult::new(&self.config.media, stream_id, stream_id, "");
        let source = match stream_type {
            StreamType::Proxy => SessionSource::Proxy {
                url: url.to_string(),
            },
            _ => SessionSource::Pull {
                url: url.to_string(),
            },
        };
        self.sessions.insert(Session {
            stream_id: stream_id.to_string(),
            channel_id: stream_id.to_string(),
            device_id: device_id.to_string(),
            mode: PlayMode::Live,
            source,
            confirmed: false,
            expires_at: now + CONFIRM_WINDOW,
            result: result.clone(),
        });

        tracing::info!(target: "gb28181::play", %stream_id, %stream_type, %key, "Stream proxy added");
        Ok(result)
    }

    async fn play_push(&self, channel: &channel::Model, req: &PlayRequest) -> Result<PlayResult> {
        let channel_id = channel.channel_id.as_str();
        let _guard = match req.mode {
            PlayMode::Live => Some(self.lock_play(channel_id).await),
            PlayMode::Playback => None,
        };
        if req.mode == PlayMode::Live {
            if let Some(result) = self.sessions.live(channel_id) {
                tracing::debug!(target: "gb28181::play", %channel_id, "Reusing live session");
                return Ok(result);
            }
        }

        let now = unix_now();
        if now - channel.active > CHANNEL_ACTIVE_WINDOW {
            return Err(GatewayError::ChannelOffline(channel_id.to_string()));
        }
        if self.store.find_device(&channel.device_id).await?.is_none() {
            return Err(GatewayError::DeviceNotFound(channel.device_id.clone()));
        }
        let device = self
            .devices
            .lookup(&channel.device_id)
            .ok_or_else(|| GatewayError::DeviceOffline(channel.device_id.clone()))?;
        let kind = req.offer_kind()?;

        // 持有计数器锁直到会话行落库
        let (ssrc, stream_id) = {
            let lease = self.ssrc.reserve(req.mode.as_i32(), &self.store).await?;
            self.store
                .insert_stream(stream_row(
                    &lease.stream_id,
                    &lease.ssrc,
                    channel_id,
                    &channel.device_id,
                    req.mode,
                    StreamType::Push,
                    stream::STATUS_PENDING,
                    now,
                ))
                .await?;
            (lease.ssrc.clone(), lease.stream_id.clone())
        };

        let dialog = match self.invite(channel, &device, &ssrc, &kind).await {
            Ok(dialog) => dialog,
            Err(e) => {
                // 行保持 PENDING，SSRC 不释放；由巡检在宽限期后关闭
                tracing::warn!(target: "gb28181::play", %channel_id, %stream_id, "INVITE failed: {}", e);
                if let Err(store_err) = self.store.mark_stream_error(&stream_id, e.to_string()).await {
                    tracing::warn!(target: "gb28181::play", %stream_id, "Record INVITE error failed: {}", store_err);
                }
                return Err(e);
            }
        };

        let expires_at = unix_now() + CONFIRM_WINDOW;
        let update = stream::ActiveModel {
            call_id: Set(dialog.call_id.clone()),
            cseq: Set(dialog.cseq as i32),
            ftag: Set(serde_json::to_value(dialog.local.params.to_map())?),
            ttag: Set(serde_json::to_value(dialog.remote.params.to_map())?),
            status: Set(stream::STATUS_ACTIVE),
            expires_at: Set(expires_at),
            ..Default::default()
        };

        // 先登记内存会话再写对话，巡检不会把刚建立的行当作残留
        let result = PlayResult::new(&self.config.media, channel_id, &stream_id, &ssrc);
        self.sessions.insert(Session {
            stream_id: stream_id.clone(),
            channel_id: channel_id.to_string(),
            device_id: channel.device_id.clone(),
            mode: req.mode,
            source: SessionSource::Push { dialog },
            confirmed: false,
            expires_at,
            result: result.clone(),
        });
        if let Err(e) = self.store.update_open_stream(&stream_id, update).await {
            self.sessions.remove(&stream_id);
            return Err(e);
        }

        tracing::info!(target: "gb28181::play", %channel_id, %stream_id, %ssrc, mode = ?req.mode, "Play established");
        Ok(result)
    }

    /// 流媒体 RTP 收流地址
    fn rtp_endpoint(&self) -> Result<(String, u16)> {
        let url = Url::parse(&self.config.media.rtp)
            .map_err(|e| GatewayError::Other(format!("invalid media.rtp: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| GatewayError::Other("media.rtp has no host".to_string()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(10000);
        Ok((host, port))
    }

    /// INVITE -> 200 -> ACK，返回建立的对话
    async fn invite(
        &self,
        channel: &channel::Model,
        device: &ActiveDevice,
        ssrc: &str,
        kind: &OfferKind,
    ) -> Result<Dialog> {
        let (rtp_host, rtp_port) = self.rtp_endpoint()?;
        let to = self.channel_addr(&channel.channel_id, &channel.uri);
        let from = self.sip.server_addr().with_tag(random_token(20));
        let call_id = random_token(32);
        let protocol = device.source.protocol;

        let mut req = SipRequest::new(SipMethod::Invite, to.uri.to_string());
        req.add_header("Via", self.sip.via(protocol).to_string());
        req.add_header("From", from.to_string());
        req.add_header("To", to.to_string());
        req.add_header("Call-ID", call_id.clone());
        req.add_header("CSeq", "1 INVITE");
        req.add_header("Contact", self.sip.contact().to_string());
        req.add_header("Max-Forwards", "70");
        req.add_header("User-Agent", crate::USER_AGENT);
        req.add_header(
            "Subject",
            format!("{}:{},{}:{}", channel.channel_id, ssrc, self.sys.lid, ssrc),
        );
        req.add_header("Content-Type", "application/sdp");
        req.set_body(SdpSession::offer(&self.sys.lid, &rtp_host, rtp_port, ssrc, kind).to_sdp_string());

        let tx = self.sip.request(&req, device.source).await?;
        let resp = tx
            .wait_response(self.sip.response_timeout())
            .await
            .map_err(|e| match e {
                SipError::Timeout => GatewayError::Timeout,
                other => other.into(),
            })?;
        if !resp.is_success() {
            return Err(GatewayError::Negotiation(format!(
                "{} {}",
                resp.status_code, resp.reason_phrase
            )));
        }

        let local = resp.headers.from().unwrap_or(from);
        let remote = resp
            .headers
            .to()
            .ok_or_else(|| GatewayError::InvalidMessage("200 OK without To".to_string()))?;
        let cseq = resp.headers.cseq().map(|(n, _)| n).unwrap_or(1);

        let mut ack = SipRequest::new(SipMethod::Ack, to.uri.to_string());
        ack.add_header("Via", self.sip.via(protocol).to_string());
        ack.add_header("From", local.to_string());
        ack.add_header("To", remote.to_string());
        ack.add_header("Call-ID", call_id.clone());
        ack.add_header("CSeq", format!("{} ACK", cseq));
        ack.add_header("Max-Forwards", "70");
        ack.add_header("User-Agent", crate::USER_AGENT);
        self.sip.send_request(&ack, device.source).await?;

        Ok(Dialog {
            call_id,
            cseq,
            local,
            remote,
            destination: device.source,
        })
    }

    /// 对推流会话发送 BYE 并等待终结响应
    pub(crate) async fn send_bye(&self, dialog: &Dialog) -> std::result::Result<SipResponse, SipError> {
        let bye = dialog.bye(self.sip.via(dialog.destination.protocol), &self.sip.contact());
        let tx = self.sip.request(&bye, dialog.destination).await?;
        tx.wait_response(self.sip.response_timeout()).await
    }

    /// 停止点播；未知 stream id 只尝试关闭流媒体侧
    pub async fn stop(&self, stream_id: &str) -> Result<()> {
        let Some(session) = self.sessions.remove(stream_id) else {
            tracing::debug!(target: "gb28181::play", %stream_id, "Stop for unknown session");
            if let Err(e) = self.media.close_stream(stream_id).await {
                tracing::warn!(target: "gb28181::play", %stream_id, "Close stream failed: {}", e);
            }
            return Ok(());
        };

        let saved = match &session.source {
            SessionSource::Push { dialog } => match self.send_bye(dialog).await {
                Ok(resp) if resp.is_success() => self.store.close_stream(stream_id, true, None).await,
                Ok(resp) => {
                    tracing::warn!(target: "gb28181::play", %stream_id, status = resp.status_code, "BYE rejected");
                    self.store
                        .mark_stream_error(
                            stream_id,
                            format!("{} {}", resp.status_code, resp.reason_phrase),
                        )
                        .await
                }
                Err(e) => {
                    tracing::warn!(target: "gb28181::play", %stream_id, "BYE failed: {}", e);
                    self.store.mark_stream_error(stream_id, e.to_string()).await
                }
            },
            SessionSource::Pull { .. } | SessionSource::Proxy { .. } => {
                self.store.close_stream(stream_id, true, None).await
            }
        };
        // 行状态写入失败不影响关闭流媒体侧，残留行由巡检处理
        if let Err(e) = saved {
            tracing::error!(target: "gb28181::play", %stream_id, "Save stream state failed: {}", e);
        }

        if let Err(e) = self.media.close_stream(stream_id).await {
            tracing::warn!(target: "gb28181::play", %stream_id, "Close stream failed: {}", e);
        }
        tracing::info!(target: "gb28181::play", %stream_id, channel_id = %session.channel_id, "Play stopped");
        Ok(())
    }

    /// 设备主动 BYE
    pub(crate) async fn on_inbound_bye(&self, call_id: &str) -> Result<()> {
        let stream_id = match self.sessions.find_by_call_id(call_id) {
            Some(session) => {
                self.sessions.remove(&session.stream_id);
                session.stream_id
            }
            None => match self.store.find_open_stream_by_call_id(call_id).await? {
                Some(row) => row.stream_id,
                None => {
                    tracing::debug!(target: "gb28181::play", %call_id, "BYE for unknown dialog");
                    return Ok(());
                }
            },
        };

        self.store
            .close_stream(&stream_id, false, Some("closed by device".to_string()))
            .await?;
        if let Err(e) = self.media.close_stream(&stream_id).await {
            tracing::warn!(target: "gb28181::play", %stream_id, "Close stream failed: {}", e);
        }
        tracing::info!(target: "gb28181::play", %stream_id, %call_id, "Stream closed by device");
        Ok(())
    }

    /// 收流后写回通道的视频参数
    pub(crate) async fn sync_codec(&self, stream_id: &str, channel_id: &str) -> Result<()> {
        let list = self.media.media_list(stream_id).await?;
        for track in list
            .iter()
            .flat_map(|m| m.tracks.iter())
            .filter(|t| t.is_video())
        {
            self.store
                .save_channel_codec(
                    channel_id,
                    codec_name(track.codec_id),
                    track.width,
                    track.height,
                    track.fps,
                )
                .await?;
        }
        Ok(())
    }
}
