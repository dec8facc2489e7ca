// 后台巡检
// 推流会话巡检与过期录像清理，各自独立计时，收到关闭信号即退出

use crate::gateway::Gateway;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// 启动两个周期任务
pub fn spawn(gateway: &Arc<Gateway>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
    let schedule = &gateway.config.schedule;
    vec![
        every(
            "reconcile",
            Duration::from_secs(schedule.reconcile_interval_secs.max(1)),
            shutdown.subscribe(),
            gateway.clone(),
            |gw| async move {
                if let Err(e) = gw.reconcile_streams().await {
                    tracing::error!(target: "gb28181::reconcile", "Stream reconcile failed: {}", e);
                }
            },
        ),
        every(
            "record-expiry",
            Duration::from_secs(schedule.expiry_interval_secs.max(1)),
            shutdown.subscribe(),
            gateway.clone(),
            |gw| async move {
                if let Err(e) = gw.clear_expired_records().await {
                    tracing::error!(target: "gb28181::record", "Record expiry sweep failed: {}", e);
                }
            },
        ),
    ]
}

fn every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    gateway: Arc<Gateway>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Gateway>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        // 首次执行推迟一个周期
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(target: "gb28181::sip", task = name, period_secs = period.as_secs(), "Background task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => job(gateway.clone()).await,
                _ = shutdown.recv() => {
                    tracing::debug!(target: "gb28181::sip", task = name, "Background task stopped");
                    break;
                }
            }
        }
    })
}
