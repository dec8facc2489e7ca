// 心跳与目录同步
// Keepalive 刷新在线状态并触发目录查询；Catalog 只更新已登记的通道

use crate::gateway::{unix_now, Gateway};
use crate::manscdp::{CatalogItem, ManscdpMessage, Query};
use crate::notify::Notify;
use crate::registry::ActiveDevice;
use crate::Result;
use sea_orm::Set;
use std::sync::Arc;

/// 通道状态别名归一：ON/OK/ONLINE -> ON，OFF/OFFLINE -> OFF
pub fn normalize_status(status: &str) -> String {
    match status.trim().to_ascii_uppercase().as_str() {
        "ON" | "OK" | "ONLINE" => "ON".to_string(),
        // 部分厂商拼写为 OFFILE
        "OFF" | "OFFLINE" | "OFFILE" => "OFF".to_string(),
        _ => status.to_string(),
    }
}

impl Gateway {
    /// 处理 Keepalive；目录查询由调用方在应答后发起
    pub(crate) async fn on_keepalive(&self, device: &ActiveDevice, msg: &ManscdpMessage) -> Result<()> {
        let device_id = device.device_id.clone();
        let now = unix_now();
        let known = self.store.find_device(&device_id).await?.is_some();

        if known && msg.status.eq_ignore_ascii_case("OK") {
            self.store.save_keepalive(device, now).await?;
            self.devices.on_register(device.clone());
        } else {
            tracing::warn!(
                target: "gb28181::catalog",
                %device_id,
                status = %msg.status,
                known,
                "Keepalive not OK, evicting device"
            );
            if known {
                self.store.save_keepalive(device, -1).await?;
            }
            self.devices.evict(&device_id);
        }

        self.notifier
            .emit(Notify::devices_active(&device_id, &msg.status, now));
        Ok(())
    }

    /// 处理 Catalog 应答，返回更新的通道数
    pub(crate) async fn on_catalog(&self, device_id: &str, msg: &ManscdpMessage) -> Result<usize> {
        let now = unix_now();
        let mut updated = 0;

        for item in msg.catalog_items() {
            if self.sync_channel(device_id, item, now).await? {
                updated += 1;
            }
        }

        tracing::debug!(
            target: "gb28181::catalog",
            %device_id,
            reported = msg.catalog_items().len(),
            updated,
            "Catalog synced"
        );
        Ok(updated)
    }

    async fn sync_channel(&self, device_id: &str, item: &CatalogItem, now: i64) -> Result<bool> {
        let Some(existing) = self.store.find_device_channel(device_id, &item.device_id).await? else {
            tracing::info!(
                target: "gb28181::catalog",
                %device_id,
                channel_id = %item.device_id,
                "Unknown channel in catalog, skipped"
            );
            return Ok(false);
        };

        let status = normalize_status(&item.status);
        let mut active: crate::store::channel::ActiveModel = existing.into();
        active.name = Set(item.name.clone());
        active.manufacturer = Set(item.manufacturer.clone());
        active.model = Set(item.model.clone());
        active.owner = Set(item.owner.clone());
        active.civil_code = Set(item.civil_code.clone());
        active.address = Set(item.address.clone());
        active.parental = Set(item.parental);
        active.safety_way = Set(item.safety_way);
        active.register_way = Set(item.register_way);
        active.secrecy = Set(item.secrecy);
        active.status = Set(status.clone());
        active.active = Set(now);
        active.uri = Set(format!("sip:{}@{}", item.device_id, self.sys.region));
        self.store.update_channel(active).await?;

        self.notifier
            .emit(Notify::channels_active(&item.device_id, &status, now));
        Ok(true)
    }

    /// 处理 DeviceInfo 应答
    pub(crate) async fn on_device_info(&self, device_id: &str, msg: &ManscdpMessage) -> Result<()> {
        self.store
            .save_device_info(
                device_id,
                &msg.manufacturer,
                &msg.model,
                &msg.firmware,
                &msg.device_type,
            )
            .await
    }

    /// 后台发起目录查询
    pub fn query_catalog(self: &Arc<Self>, device: ActiveDevice) {
        let gateway = self.clone();
        tokio::spawn(async move {
            let query = Query::catalog(Gateway::next_sn(), device.device_id.clone());
            let _ = gateway.send_query(&device, query).await;
        });
    }

    /// 后台发起设备信息查询
    pub fn query_device_info(self: &Arc<Self>, device: ActiveDevice) {
        let gateway = self.clone();
        tokio::spawn(async move {
            let query = Query::device_info(Gateway::next_sn(), device.device_id.clone());
            let _ = gateway.send_query(&device, query).await;
        });
    }
}
