// SSRC 分配
// 格式：{mode}{region[3..8]}{counter:04}，十进制；流媒体侧 stream id 为其 8 位大写十六进制

use crate::store::Store;
use crate::{GatewayError, Result};
use std::future::Future;
use tokio::sync::{Mutex, MutexGuard};

/// 计数器取值 1..=9000，超过后回绕
const COUNTER_LIMIT: u32 = 9000;

/// SSRC -> stream id：去掉一个前导 0 后转 8 位十六进制
pub fn ssrc_to_stream_id(ssrc: &str) -> Result<String> {
    let digits = ssrc.strip_prefix('0').unwrap_or(ssrc);
    let value: u32 = digits
        .parse()
        .map_err(|_| GatewayError::InvalidMessage(format!("invalid ssrc: {}", ssrc)))?;
    Ok(format!("{:08X}", value))
}

/// 一次分配结果；持有计数器锁，调用方应在释放前写入会话行
pub struct SsrcLease<'a> {
    pub ssrc: String,
    pub stream_id: String,
    _guard: MutexGuard<'a, u32>,
}

/// 进程级 SSRC 分配器
pub struct SsrcAllocator {
    region: String,
    /// 上一次发出的计数
    last: Mutex<u32>,
}

impl SsrcAllocator {
    /// `region` 为 10 位 SIP 域，取第 4-8 位
    pub fn new(region: &str) -> Self {
        let fragment = region.get(3..8).unwrap_or("00000").to_string();
        Self {
            region: fragment,
            last: Mutex::new(0),
        }
    }

    /// 分配一个未被占用的 SSRC；一次调用内最多回绕一次
    pub async fn allocate_with<F, Fut>(&self, mode: i32, mut is_taken: F) -> Result<SsrcLease<'_>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let mut last = self.last.lock().await;
        let mut wrapped = false;

        loop {
            if *last >= COUNTER_LIMIT {
                if wrapped {
                    return Err(GatewayError::SsrcExhausted);
                }
                wrapped = true;
                *last = 0;
            }
            *last += 1;

            let ssrc = format!("{}{}{:04}", mode, self.region, *last);

            let stream_id = ssrc_to_stream_id(&ssrc)?;
            if is_taken(stream_id.clone()).await? {
                tracing::trace!(target: "gb28181::play", %ssrc, "SSRC occupied, skipping");
                continue;
            }

            return Ok(SsrcLease {
                ssrc,
                stream_id,
                _guard: last,
            });
        }
    }

    /// 以存储中未关闭的会话为准分配
    pub async fn reserve<'a>(&'a self, mode: i32, store: &Store) -> Result<SsrcLease<'a>> {
        self.allocate_with(mode, |stream_id| async move { store.stream_taken(&stream_id).await })
            .await
    }
}
