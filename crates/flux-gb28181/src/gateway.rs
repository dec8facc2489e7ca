// 网关上下文
// 启动时构造一次，SIP 处理器、HTTP 回调与后台任务共享

use crate::manscdp::{self, Query};
use crate::media::MediaEngine;
use crate::notify::Notifier;
use crate::record_list::RecordQueries;
use crate::recording::RecordingTable;
use crate::registry::{ActiveDevice, DeviceRegistry};
use crate::session::SessionTable;
use crate::sip::{random_token, NameAddr, SipMethod, SipRequest, SipResponse, SipServer, SipServerConfig};
use crate::ssrc::SsrcAllocator;
use crate::store::{sys_info, Store};
use crate::{handlers, scheduler, GatewayError, Result};
use dashmap::DashMap;
use flux_config::GatewayConfig;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// 当前 Unix 时间（秒）
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) struct PlayGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PlayGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // 仅剩表内引用说明没有等待者
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// GB28181 网关
pub struct Gateway {
    pub(crate) config: GatewayConfig,
    pub(crate) sip: Arc<SipServer>,
    pub(crate) store: Store,
    pub(crate) devices: DeviceRegistry,
    pub(crate) sessions: SessionTable,
    pub(crate) media: Arc<dyn MediaEngine>,
    pub(crate) ssrc: SsrcAllocator,
    pub(crate) record_queries: RecordQueries,
    pub(crate) recordings: RecordingTable,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) sys: sys_info::Model,
    /// 同一通道的实时点播串行化
    play_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Gateway {
    /// 读取平台编号并绑定 SIP 端口
    pub async fn bootstrap(
        config: GatewayConfig,
        store: Store,
        media: Arc<dyn MediaEngine>,
    ) -> Result<Arc<Self>> {
        let sys = store.load_sys_info(&config.gb28181).await?;

        let sip = SipServer::bind(SipServerConfig {
            udp: config.sip.udp.clone(),
            tcp: config.sip.tcp.clone(),
            host: config.sip.host.clone(),
            sip_domain: sys.region.clone(),
            sip_id: sys.lid.clone(),
            response_timeout: Duration::from_secs(config.sip.response_timeout_secs),
        })
        .await?;

        Ok(Self::new(config, sip, store, media, sys))
    }

    pub fn new(
        config: GatewayConfig,
        sip: Arc<SipServer>,
        store: Store,
        media: Arc<dyn MediaEngine>,
        sys: sys_info::Model,
    ) -> Arc<Self> {
        let notifier = Arc::new(Notifier::new(config.notify_urls()));
        Arc::new(Self {
            ssrc: SsrcAllocator::new(&sys.region),
            config,
            sip,
            store,
            devices: DeviceRegistry::new(),
            sessions: SessionTable::new(),
            media,
            record_queries: RecordQueries::new(),
            recordings: RecordingTable::new(),
            notifier,
            sys,
            play_locks: DashMap::new(),
        })
    }

    /// 启动 SIP 接收循环与后台巡检
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let router = handlers::router(self);
        let mut tasks = vec![self.sip.start(router, shutdown)];
        tasks.extend(scheduler::spawn(self, shutdown));
        tracing::info!(
            target: "gb28181::sip",
            region = %self.sys.region,
            lid = %self.sys.lid,
            "GB28181 gateway started"
        );
        tasks
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sip(&self) -> &Arc<SipServer> {
        &self.sip
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn sys_info(&self) -> &sys_info::Model {
        &self.sys
    }

    /// 按通道 ID（或代理 tag）串行化点播；最后一个持有者释放时移除锁
    pub(crate) async fn lock_play(&self, key: &str) -> PlayGuard<'_> {
        let lock = self
            .play_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        PlayGuard {
            locks: &self.play_locks,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// 查询报文 SN
    pub(crate) fn next_sn() -> u64 {
        rand::thread_rng().gen_range(100000..1000000)
    }

    /// 通道 SIP 地址
    pub(crate) fn channel_addr(&self, channel_id: &str, uri: &str) -> NameAddr {
        if !uri.is_empty() {
            if let Ok(addr) = NameAddr::parse(uri) {
                return addr;
            }
        }
        NameAddr::new(crate::sip::SipUri::new(channel_id, &self.sys.region))
    }

    /// 向设备发送 MANSCDP MESSAGE 并等待终结响应
    pub(crate) async fn send_message(
        &self,
        device: &ActiveDevice,
        to: NameAddr,
        body: String,
    ) -> Result<SipResponse> {
        let mut req = SipRequest::new(SipMethod::Message, to.uri.to_string());
        req.add_header("Via", self.sip.via(device.source.protocol).to_string());
        req.add_header("From", self.sip.server_addr().with_tag(random_token(20)).to_string());
        req.add_header("To", to.to_string());
        req.add_header("Call-ID", random_token(32));
        req.add_header("CSeq", "1 MESSAGE");
        req.add_header("Content-Type", manscdp::CONTENT_TYPE);
        req.add_header("Max-Forwards", "70");
        req.add_header("User-Agent", crate::USER_AGENT);
        req.set_body(body);

        let tx = self.sip.request(&req, device.source).await?;
        let resp = tx.wait_response(self.sip.response_timeout()).await?;
        if !resp.is_success() {
            return Err(GatewayError::Rejected(resp.status_code, resp.reason_phrase));
        }
        Ok(resp)
    }

    /// 发送设备查询（Catalog / DeviceInfo）
    pub(crate) async fn send_query(&self, device: &ActiveDevice, query: Query) -> Result<()> {
        let cmd = query.cmd_type.to_string();
        self.send_message(device, device.addr.clone(), query.to_xml())
            .await
            .map_err(|e| {
                tracing::warn!(
                    target: "gb28181::catalog",
                    device_id = %device.device_id,
                    %cmd,
                    "Query failed: {}",
                    e
                );
                e
            })?;
        tracing::debug!(target: "gb28181::catalog", device_id = %device.device_id, %cmd, "Query accepted");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::media::testing::FakeMedia;
    use crate::store::testing::memory_store;

    /// 绑定本地回环端口的网关与内存流媒体
    pub async fn gateway() -> (Arc<Gateway>, Arc<FakeMedia>) {
        gateway_with(|_| {}).await
    }

    pub async fn gateway_with(tweak: impl FnOnce(&mut GatewayConfig)) -> (Arc<Gateway>, Arc<FakeMedia>) {
        let mut config = GatewayConfig::default();
        config.sip.udp = "127.0.0.1:0".to_string();
        config.sip.response_timeout_secs = 2;
        config.media.http = "http://media:80".to_string();
        config.media.rtp = "http://127.0.0.1:10000".to_string();
        tweak(&mut config);

        let store = memory_store().await;
        let media = Arc::new(FakeMedia::default());
        let gateway = Gateway::bootstrap(config, store, media.clone()).await.unwrap();
        (gateway, media)
    }
}
