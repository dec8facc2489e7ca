use crate::sip::SipError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Channel offline: {0}")]
    ChannelOffline(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device offline: {0}")]
    DeviceOffline(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Recording already exists: {0}")]
    RecordingExists(String),

    #[error("Recording not found: {0}")]
    RecordingNotFound(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("No free SSRC left")]
    SsrcExhausted,

    #[error("Media server error: {0}")]
    Media(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Timeout")]
    Timeout,

    #[error("Request rejected: {0} {1}")]
    Rejected(u16, String),

    #[error("SIP error: {0}")]
    Sip(#[from] SipError),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl GatewayError {
    /// 等待设备或流媒体响应超时
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout | GatewayError::Sip(SipError::Timeout))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
