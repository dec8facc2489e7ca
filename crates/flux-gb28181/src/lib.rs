// flux-gb28181: GB28181 信令网关核心库
//
// 架构：
// - sip/: SIP 传输、事务、鉴权与 SDP
// - registry / catalog: 设备注册、心跳与目录同步
// - play / reconcile: 点播会话编排与会话巡检
// - record_list / recording: 设备录像查询与云端录像
// - media / webhook: 流媒体服务接口与回调

pub mod error;
pub mod sip;
pub mod manscdp;
pub mod store;
pub mod registry;
pub mod ssrc;
pub mod media;
pub mod session;
pub mod notify;
pub mod catalog;
pub mod play;
pub mod reconcile;
pub mod record_list;
pub mod recording;
pub mod webhook;
pub mod gateway;
pub mod handlers;
pub mod scheduler;

// 重新导出常用类型
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use media::{MediaEngine, ZlmClient};
pub use play::PlayRequest;
pub use session::{PlayMode, PlayResult, StreamType};

/// SIP User-Agent 头部
pub const USER_AGENT: &str = concat!("flux-gb28181/", env!("CARGO_PKG_VERSION"));
