// GB28181 点播 SDP
// 固定 PS/H264/MPEG4 三种负载，y= 行携带 SSRC

/// 点播类型对应的 SDP 差异
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferKind {
    /// 实时点播
    Live,
    /// 历史回放，u= 行为 `{channel}:0`，t= 行为回放时间段
    Playback {
        channel_id: String,
        start: i64,
        end: i64,
    },
}

/// SDP 会话描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u8,

    /// o= 用户名（平台 ID 或设备 ID）
    pub origin: String,

    /// o= / c= 地址
    pub address: String,

    /// Play / Playback
    pub session_name: String,

    /// u= 行
    pub uri: Option<String>,

    /// t= 起止时间
    pub timing: (i64, i64),

    /// y= SSRC
    pub ssrc: Option<String>,

    pub media: Vec<SdpMedia>,
}

/// SDP 媒体描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,

    /// TCP/RTP/AVP、RTP/AVP 等
    pub protocol: String,

    pub formats: Vec<u8>,
    pub rtpmap: Vec<RtpMap>,

    /// 除 rtpmap 外的属性，原样保存（如 `recvonly`、`setup:passive`）
    pub attributes: Vec<String>,
}

/// RTP 映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
}

impl SdpSession {
    /// 生成 INVITE 携带的 offer
    pub fn offer(origin: &str, rtp_ip: &str, rtp_port: u16, ssrc: &str, kind: &OfferKind) -> Self {
        let (session_name, uri, timing, protocol) = match kind {
            OfferKind::Live => ("Play", None, (0, 0), "TCP/RTP/AVP"),
            OfferKind::Playback {
                channel_id,
                start,
                end,
            } => (
                "Playback",
                Some(format!("{}:0", channel_id)),
                (*start, *end),
                "RTP/RTCP",
            ),
        };

        let mut attributes = vec!["recvonly".to_string()];
        if matches!(kind, OfferKind::Live) {
            attributes.push("setup:passive".to_string());
            attributes.push("connection:new".to_string());
        }

        let video = SdpMedia {
            media_type: "video".to_string(),
            port: rtp_port,
            protocol: protocol.to_string(),
            formats: vec![96, 98, 97],
            rtpmap: vec![
                RtpMap {
                    payload_type: 96,
                    encoding_name: "PS".to_string(),
                    clock_rate: 90000,
                },
                RtpMap {
                    payload_type: 98,
                    encoding_name: "H264".to_string(),
                    clock_rate: 90000,
                },
                RtpMap {
                    payload_type: 97,
                    encoding_name: "MPEG4".to_string(),
                    clock_rate: 90000,
                },
            ],
            attributes,
        };

        Self {
            version: 0,
            origin: origin.to_string(),
            address: rtp_ip.to_string(),
            session_name: session_name.to_string(),
            uri,
            timing,
            ssrc: Some(ssrc.to_string()),
            media: vec![video],
        }
    }

    /// 生成 SDP 字符串
    pub fn to_sdp_string(&self) -> String {
        let mut sdp = String::new();

        sdp.push_str(&format!("v={}\r\n", self.version));
        sdp.push_str(&format!("o={} 0 0 IN IP4 {}\r\n", self.origin, self.address));
        sdp.push_str(&format!("s={}\r\n", self.session_name));
        if let Some(uri) = &self.uri {
            sdp.push_str(&format!("u={}\r\n", uri));
        }
        sdp.push_str(&format!("c=IN IP4 {}\r\n", self.address));
        sdp.push_str(&format!("t={} {}\r\n", self.timing.0, self.timing.1));

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|f| f.to_string()).collect();
            sdp.push_str(&format!(
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            ));

            for attr in &media.attributes {
                sdp.push_str(&format!("a={}\r\n", attr));
            }

            for rtpmap in &media.rtpmap {
                sdp.push_str(&format!(
                    "a=rtpmap:{} {}/{}\r\n",
                    rtpmap.payload_type, rtpmap.encoding_name, rtpmap.clock_rate
                ));
            }
        }

        if let Some(ssrc) = &self.ssrc {
            sdp.push_str(&format!("y={}\r\n", ssrc));
        }

        sdp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_offer() {
        let sdp = SdpSession::offer(
            "34020000002000000001",
            "192.168.1.100",
            10000,
            "0200000001",
            &OfferKind::Live,
        )
        .to_sdp_string();

        assert!(sdp.starts_with("v=0\r\no=34020000002000000001 0 0 IN IP4 192.168.1.100\r\ns=Play\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.100\r\nt=0 0\r\n"));
        assert!(sdp.contains("m=video 10000 TCP/RTP/AVP 96 98 97\r\n"));
        assert!(sdp.contains("a=recvonly\r\na=setup:passive\r\na=connection:new\r\n"));
        assert!(sdp.contains("a=rtpmap:96 PS/90000\r\na=rtpmap:98 H264/90000\r\na=rtpmap:97 MPEG4/90000\r\n"));
        assert!(sdp.ends_with("y=0200000001\r\n"));
        assert!(!sdp.contains("u="));
    }

    #[test]
    fn test_playback_offer() {
        let kind = OfferKind::Playback {
            channel_id: "34020000001320000001".to_string(),
            start: 1_700_000_000,
            end: 1_700_003_600,
        };
        let sdp = SdpSession::offer("34020000002000000001", "10.0.0.2", 10000, "1200000001", &kind)
            .to_sdp_string();

        assert!(sdp.contains("s=Playback\r\nu=34020000001320000001:0\r\n"));
        assert!(sdp.contains("t=1700000000 1700003600\r\n"));
        assert!(sdp.contains("m=video 10000 RTP/RTCP 96 98 97\r\n"));
        assert!(!sdp.contains("setup:passive"));
    }
}
