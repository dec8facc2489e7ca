use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const STATUS_RECORDING: i32 = 0;
pub const STATUS_FINISHED: i32 = 1;

/// 云端录像文件
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "record_files")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub job_id: String,
    #[sea_orm(indexed)]
    pub stream_id: String,
    pub start: i64,
    pub end: i64,
    /// 相对录像根目录的文件路径
    pub file: String,
    pub status: i32,
    pub cleared: bool,
    pub msg: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
