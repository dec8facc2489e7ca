use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 设备（NVR / IPC）
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "devices")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub device_id: String,
    pub name: String,
    /// SIP 域
    pub region: String,
    /// 注册密码
    #[serde(skip_serializing)]
    pub password: String,
    pub host: String,
    pub port: i32,
    /// UDP / TCP
    pub transport: String,
    /// Via received
    pub received: String,
    /// Via rport
    pub rport: i32,
    /// 实际报文来源地址（ip:port）
    pub source: String,
    /// Contact / From 中的设备 URI
    pub uri: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    pub device_type: String,
    pub registered: bool,
    /// 最近心跳时间，-1 表示心跳异常
    pub active_at: i64,
    pub regist_at: i64,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
