use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 通道流类型：设备推流
pub const STREAM_TYPE_PUSH: &str = "push";
/// 通道流类型：流媒体服务主动拉流
pub const STREAM_TYPE_PULL: &str = "pull";

/// 通道（摄像头）
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub channel_id: String,
    #[sea_orm(indexed)]
    pub device_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,
    pub parental: i32,
    pub safety_way: i32,
    pub register_way: i32,
    pub secrecy: i32,
    /// ON / OFF
    pub status: String,
    /// 最近一次目录上报时间
    pub active: i64,
    /// `sip:{channel_id}@{region}`
    pub uri: String,
    /// 视频编码
    pub vf: String,
    pub width: i32,
    pub height: i32,
    pub fps: i32,
    /// push / pull
    pub stream_type: String,
    /// pull 模式的源地址
    pub url: String,
    /// 运维备注，目录同步不覆盖
    pub memo: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
