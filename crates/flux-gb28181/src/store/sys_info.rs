use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 平台编号信息，全局单行
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sys_info")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// SIP 域 / 行政区划
    pub region: String,
    pub cid: String,
    pub cnum: i64,
    pub did: String,
    pub dnum: i64,
    /// 平台 SIP ID
    pub lid: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
