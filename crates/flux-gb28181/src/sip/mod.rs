// GB28181 SIP 协议栈
// 传输层、事务层、Digest 鉴权与 SDP

pub mod auth;
pub mod header;
pub mod message;
pub mod sdp;
pub mod server;
pub mod transaction;
pub mod transport;

pub use auth::{DigestChallenge, DigestCredentials};
pub use header::{NameAddr, Params, SipUri, ViaHop};
pub use message::{Headers, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::{OfferKind, SdpSession};
pub use server::{RequestHandler, Router, ServerTransaction, SipServer, SipServerConfig};
pub use transaction::{ClientTransaction, TransactionKey, TransactionLayer};
pub use transport::{Destination, Packet, Protocol, Transport};

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::SocketAddr;
use thiserror::Error;

/// SIP 协议栈错误
#[derive(Debug, Error)]
pub enum SipError {
    #[error("Malformed SIP message: {0}")]
    Parse(String),

    #[error("Transaction timeout")]
    Timeout,

    #[error("No connection to {0}")]
    NotConnected(SocketAddr),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SipResult<T> = std::result::Result<T, SipError>;

/// 随机字母数字串（nonce / tag / Call-ID）
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// 事务分支号，RFC 3261 magic cookie 前缀
pub fn new_branch() -> String {
    format!("z9hG4bK{}", random_token(16))
}
