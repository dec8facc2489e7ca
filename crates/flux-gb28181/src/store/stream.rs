use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const STATUS_PENDING: i32 = -1;
pub const STATUS_ACTIVE: i32 = 0;
pub const STATUS_CLOSED: i32 = 1;

/// 点播会话记录，关闭后保留用于审计
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "streams")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// 流媒体侧 stream id（SSRC 的 8 位十六进制）
    #[sea_orm(indexed)]
    pub stream_id: String,
    /// 十进制 SSRC，pull/proxy 为空
    pub ssrc: String,
    pub channel_id: String,
    pub device_id: String,
    /// 0 实时 / 1 回放
    pub mode: i32,
    /// push / pull / proxy
    pub stream_type: String,
    /// -1 协商中 / 0 已建立 / 1 已关闭
    pub status: i32,
    /// 流媒体服务已确认收流
    pub confirmed: bool,
    pub call_id: String,
    pub cseq: i32,
    /// From 头部参数
    pub ftag: Json,
    /// To 头部参数
    pub ttag: Json,
    /// 主动停止
    pub stop: bool,
    /// 最近一次错误
    pub msg: String,
    /// 未确认推流的等待截止时间
    pub expires_at: i64,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
