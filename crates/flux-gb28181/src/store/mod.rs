// 持久化存储
// 设备、通道、点播会话、录像文件与平台编号信息

pub mod channel;
pub mod device;
pub mod record_file;
pub mod stream;
pub mod sys_info;

use crate::registry::ActiveDevice;
use crate::Result;
use flux_config::SequenceConfig;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Schema, Set,
};
use std::sync::Arc;

/// 分页扫描的批大小
pub const PAGE_SIZE: u64 = 100;

/// 建表（已存在则跳过）
pub async fn create_tables(db: &DatabaseConnection) -> std::result::Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let tables = [
        schema.create_table_from_entity(device::Entity).if_not_exists().to_owned(),
        schema.create_table_from_entity(channel::Entity).if_not_exists().to_owned(),
        schema.create_table_from_entity(stream::Entity).if_not_exists().to_owned(),
        schema.create_table_from_entity(record_file::Entity).if_not_exists().to_owned(),
        schema.create_table_from_entity(sys_info::Entity).if_not_exists().to_owned(),
    ];
    for table in tables.iter() {
        db.execute(backend.build(table)).await?;
    }

    let indexes = schema
        .create_index_from_entity(channel::Entity)
        .into_iter()
        .chain(schema.create_index_from_entity(stream::Entity))
        .chain(schema.create_index_from_entity(record_file::Entity));
    for mut index in indexes {
        index.if_not_exists();
        db.execute(backend.build(&index)).await?;
    }

    Ok(())
}

/// 存储访问入口
#[derive(Clone)]
pub struct Store {
    db: Arc<DatabaseConnection>,
}

impl Store {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    // ---- devices ----

    pub async fn find_device(&self, device_id: &str) -> Result<Option<device::Model>> {
        Ok(device::Entity::find_by_id(device_id.to_string())
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn insert_device(&self, model: device::Model) -> Result<device::Model> {
        let active: device::ActiveModel = model.into();
        Ok(active.insert(self.db.as_ref()).await?)
    }

    /// 注册成功后写入寻址信息
    pub async fn save_registration(&self, device: &ActiveDevice, now: i64) -> Result<()> {
        let mut active = transport_update(device);
        active.registered = Set(true);
        active.active_at = Set(now);
        active.regist_at = Set(now);
        self.update_device(&device.device_id, active).await
    }

    /// 心跳：正常时刷新寻址信息与 active_at，异常时 active_at = -1
    pub async fn save_keepalive(&self, device: &ActiveDevice, active_at: i64) -> Result<()> {
        let mut active = transport_update(device);
        active.active_at = Set(active_at);
        self.update_device(&device.device_id, active).await
    }

    /// DeviceInfo 应答，空字段不覆盖
    pub async fn save_device_info(
        &self,
        device_id: &str,
        manufacturer: &str,
        model: &str,
        firmware: &str,
        device_type: &str,
    ) -> Result<()> {
        let mut active = <device::ActiveModel as Default>::default();
        if !manufacturer.is_empty() {
            active.manufacturer = Set(manufacturer.to_string());
        }
        if !model.is_empty() {
            active.model = Set(model.to_string());
        }
        if !firmware.is_empty() {
            active.firmware = Set(firmware.to_string());
        }
        if !device_type.is_empty() {
            active.device_type = Set(device_type.to_string());
        }
        if !active.is_changed() {
            return Ok(());
        }
        self.update_device(device_id, active).await
    }

    async fn update_device(&self, device_id: &str, active: device::ActiveModel) -> Result<()> {
        device::Entity::update_many()
            .set(active)
            .filter(device::Column::DeviceId.eq(device_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    // ---- channels ----

    pub async fn find_channel(&self, channel_id: &str) -> Result<Option<channel::Model>> {
        Ok(channel::Entity::find()
            .filter(channel::Column::ChannelId.eq(channel_id))
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn find_device_channel(
        &self,
        device_id: &str,
        channel_id: &str,
    ) -> Result<Option<channel::Model>> {
        Ok(channel::Entity::find()
            .filter(channel::Column::ChannelId.eq(channel_id))
            .filter(channel::Column::DeviceId.eq(device_id))
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn insert_channel(&self, model: channel::ActiveModel) -> Result<channel::Model> {
        Ok(model.insert(self.db.as_ref()).await?)
    }

    pub async fn update_channel(&self, model: channel::ActiveModel) -> Result<channel::Model> {
        Ok(model.update(self.db.as_ref()).await?)
    }

    /// 写入流媒体上报的视频参数
    pub async fn save_channel_codec(
        &self,
        channel_id: &str,
        vf: &str,
        width: i32,
        height: i32,
        fps: i32,
    ) -> Result<()> {
        channel::Entity::update_many()
            .set(channel::ActiveModel {
                vf: Set(vf.to_string()),
                width: Set(width),
                height: Set(height),
                fps: Set(fps),
                ..Default::default()
            })
            .filter(channel::Column::ChannelId.eq(channel_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    // ---- streams ----

    /// stream id 是否被未关闭的会话占用
    pub async fn stream_taken(&self, stream_id: &str) -> Result<bool> {
        let count = stream::Entity::find()
            .filter(stream::Column::StreamId.eq(stream_id))
            .filter(stream::Column::Status.ne(stream::STATUS_CLOSED))
            .count(self.db.as_ref())
            .await?;
        Ok(count > 0)
    }

    pub async fn insert_stream(&self, model: stream::ActiveModel) -> Result<stream::Model> {
        Ok(model.insert(self.db.as_ref()).await?)
    }

    pub async fn find_open_stream(&self, stream_id: &str) -> Result<Option<stream::Model>> {
        Ok(stream::Entity::find()
            .filter(stream::Column::StreamId.eq(stream_id))
            .filter(stream::Column::Status.ne(stream::STATUS_CLOSED))
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn find_open_stream_by_call_id(&self, call_id: &str) -> Result<Option<stream::Model>> {
        Ok(stream::Entity::find()
            .filter(stream::Column::CallId.eq(call_id))
            .filter(stream::Column::Status.ne(stream::STATUS_CLOSED))
            .one(self.db.as_ref())
            .await?)
    }

    /// 更新未关闭的会话行；过滤条件保证并发关闭时后到者不生效
    pub async fn update_open_stream(
        &self,
        stream_id: &str,
        active: stream::ActiveModel,
    ) -> Result<u64> {
        let res = stream::Entity::update_many()
            .set(active)
            .filter(stream::Column::StreamId.eq(stream_id))
            .filter(stream::Column::Status.ne(stream::STATUS_CLOSED))
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected)
    }

    /// 关闭会话行
    pub async fn close_stream(&self, stream_id: &str, stop: bool, msg: Option<String>) -> Result<u64> {
        let mut active = stream::ActiveModel {
            status: Set(stream::STATUS_CLOSED),
            ..Default::default()
        };
        if stop {
            active.stop = Set(true);
        }
        if let Some(msg) = msg {
            active.msg = Set(msg);
        }
        self.update_open_stream(stream_id, active).await
    }

    /// 记录错误信息，保持状态不变
    pub async fn mark_stream_error(&self, stream_id: &str, msg: impl Into<String>) -> Result<u64> {
        self.update_open_stream(
            stream_id,
            stream::ActiveModel {
                msg: Set(msg.into()),
                ..Default::default()
            },
        )
        .await
    }

    /// 按 id 游标分页取未关闭的推流会话
    pub async fn open_push_streams(&self, after_id: i32) -> Result<Vec<stream::Model>> {
        Ok(stream::Entity::find()
            .filter(stream::Column::Id.gt(after_id))
            .filter(stream::Column::Status.ne(stream::STATUS_CLOSED))
            .filter(stream::Column::StreamType.eq(channel::STREAM_TYPE_PUSH))
            .order_by_asc(stream::Column::Id)
            .limit(PAGE_SIZE)
            .all(self.db.as_ref())
            .await?)
    }

    // ---- record files ----

    pub async fn insert_record_file(&self, model: record_file::ActiveModel) -> Result<record_file::Model> {
        Ok(model.insert(self.db.as_ref()).await?)
    }

    /// 录像完成：写入结束时间与文件路径
    pub async fn finish_record_file(&self, job_id: &str, end: i64, file: &str) -> Result<u64> {
        let res = record_file::Entity::update_many()
            .set(record_file::ActiveModel {
                end: Set(end),
                file: Set(file.to_string()),
                status: Set(record_file::STATUS_FINISHED),
                ..Default::default()
            })
            .filter(record_file::Column::JobId.eq(job_id))
            .filter(record_file::Column::Status.eq(record_file::STATUS_RECORDING))
            .exec(self.db.as_ref())
            .await?;
        Ok(res.rows_affected)
    }

    /// 按 id 游标分页取过期未清理的录像
    pub async fn expired_record_files(&self, cutoff: i64, after_id: i32) -> Result<Vec<record_file::Model>> {
        Ok(record_file::Entity::find()
            .filter(record_file::Column::Id.gt(after_id))
            .filter(record_file::Column::Status.eq(record_file::STATUS_FINISHED))
            .filter(record_file::Column::End.lt(cutoff))
            .filter(record_file::Column::Cleared.eq(false))
            .order_by_asc(record_file::Column::Id)
            .limit(PAGE_SIZE)
            .all(self.db.as_ref())
            .await?)
    }

    pub async fn mark_record_cleared(&self, id: i32) -> Result<()> {
        record_file::Entity::update_many()
            .col_expr(record_file::Column::Cleared, Expr::value(true))
            .filter(record_file::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    pub async fn mark_record_error(&self, id: i32, msg: &str) -> Result<()> {
        record_file::Entity::update_many()
            .col_expr(record_file::Column::Msg, Expr::value(msg.to_string()))
            .filter(record_file::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    // ---- sys info ----

    /// 读取平台编号信息，不存在时按配置初始化
    pub async fn load_sys_info(&self, defaults: &SequenceConfig) -> Result<sys_info::Model> {
        if let Some(info) = sys_info::Entity::find()
            .order_by_asc(sys_info::Column::Id)
            .one(self.db.as_ref())
            .await?
        {
            return Ok(info);
        }

        tracing::info!(
            target: "gb28181::store",
            region = %defaults.region,
            lid = %defaults.lid,
            "Initializing sys_info"
        );
        let active = sys_info::ActiveModel {
            region: Set(defaults.region.clone()),
            cid: Set(defaults.cid.clone()),
            cnum: Set(defaults.cnum),
            did: Set(defaults.did.clone()),
            dnum: Set(defaults.dnum),
            lid: Set(defaults.lid.clone()),
            ..Default::default()
        };
        Ok(active.insert(self.db.as_ref()).await?)
    }
}

fn transport_update(device: &ActiveDevice) -> device::ActiveModel {
    device::ActiveModel {
        host: Set(device.host.clone()),
        port: Set(i32::from(device.port)),
        transport: Set(device.source.protocol.to_string()),
        received: Set(device.received.clone()),
        rport: Set(i32::from(device.rport)),
        source: Set(device.source.addr.to_string()),
        uri: Set(device.addr.uri.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use sea_orm::Database;

    /// 内存 SQLite + 建表
    pub async fn memory_store() -> Store {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        create_tables(&db).await.unwrap();
        Store::new(Arc::new(db))
    }

    pub fn device(device_id: &str, password: &str) -> device::Model {
        device::Model {
            device_id: device_id.to_string(),
            name: String::new(),
            region: "3402000000".to_string(),
            password: password.to_string(),
            host: String::new(),
            port: 0,
            transport: String::new(),
            received: String::new(),
            rport: 0,
            source: String::new(),
            uri: String::new(),
            manufacturer: String::new(),
            model: String::new(),
            firmware: String::new(),
            device_type: String::new(),
            registered: false,
            active_at: 0,
            regist_at: 0,
            created_at: 0,
        }
    }

    pub fn channel(channel_id: &str, device_id: &str, active: i64) -> channel::ActiveModel {
        channel::ActiveModel {
            channel_id: Set(channel_id.to_string()),
            device_id: Set(device_id.to_string()),
            name: Set("camera".to_string()),
            manufacturer: Set(String::new()),
            model: Set(String::new()),
            owner: Set(String::new()),
            civil_code: Set(String::new()),
            address: Set(String::new()),
            parental: Set(0),
            safety_way: Set(0),
            register_way: Set(1),
            secrecy: Set(0),
            status: Set("ON".to_string()),
            active: Set(active),
            uri: Set(format!("sip:{}@3402000000", channel_id)),
            vf: Set(String::new()),
            width: Set(0),
            height: Set(0),
            fps: Set(0),
            stream_type: Set(channel::STREAM_TYPE_PUSH.to_string()),
            url: Set(String::new()),
            memo: Set("operator note".to_string()),
            ..Default::default()
        }
    }
}
