// SIP 事务层
// 以 Call-ID + Via branch + 方法类别 作为事务键，将响应投递给等待方

use super::message::{SipMethod, SipRequest, SipResponse};
use super::{SipError, SipResult};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// 事务键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub call_id: String,
    pub branch: String,
    pub method: SipMethod,
}

impl TransactionKey {
    /// ACK 归入 INVITE 事务
    fn method_class(method: SipMethod) -> SipMethod {
        match method {
            SipMethod::Ack => SipMethod::Invite,
            other => other,
        }
    }

    pub fn from_request(req: &SipRequest) -> Option<Self> {
        let via = req.headers.via()?;
        Some(Self {
            call_id: req.headers.call_id()?.to_string(),
            branch: via.branch()?.to_string(),
            method: Self::method_class(req.method.clone()),
        })
    }

    /// 响应的方法类别取自 CSeq
    pub fn from_response(resp: &SipResponse) -> Option<Self> {
        let via = resp.headers.via()?;
        let (_, method) = resp.headers.cseq()?;
        Some(Self {
            call_id: resp.headers.call_id()?.to_string(),
            branch: via.branch()?.to_string(),
            method: Self::method_class(method),
        })
    }
}

/// 客户端事务表
#[derive(Default)]
pub struct TransactionLayer {
    pending: DashMap<TransactionKey, oneshot::Sender<SipResponse>>,
}

impl TransactionLayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 登记一个等待响应的事务；必须在报文发出之前调用
    pub fn register(self: &Arc<Self>, key: TransactionKey) -> ClientTransaction {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);
        ClientTransaction {
            key,
            rx: Some(rx),
            layer: self.clone(),
        }
    }

    /// 投递响应；返回 false 表示没有匹配的事务
    pub fn on_response(&self, resp: SipResponse) -> bool {
        let Some(key) = TransactionKey::from_response(&resp) else {
            return false;
        };

        // 1xx 临时响应只确认事务存在，不唤醒等待方
        if resp.is_provisional() {
            return self.pending.contains_key(&key);
        }

        match self.pending.remove(&key) {
            Some((_, tx)) => {
                // 等待方已放弃时发送失败，忽略即可
                let _ = tx.send(resp);
                true
            }
            None => false,
        }
    }
}

/// 客户端事务句柄，drop 时撤销登记
pub struct ClientTransaction {
    key: TransactionKey,
    rx: Option<oneshot::Receiver<SipResponse>>,
    layer: Arc<TransactionLayer>,
}

impl ClientTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// 等待终结响应，超时返回 `SipError::Timeout`
    pub async fn wait_response(mut self, timeout: Duration) -> SipResult<SipResponse> {
        let rx = self.rx.take().ok_or(SipError::Timeout)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) | Err(_) => Err(SipError::Timeout),
        }
    }
}

impl Drop for ClientTransaction {
    fn drop(&mut self) {
        self.layer.pending.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::message::SipMessage;

    fn response(code: u16, branch: &str, cseq: &str) -> SipResponse {
        let raw = format!(
            "SIP/2.0 {} X\r\nVia: SIP/2.0/UDP 10.0.0.1:5060;branch={}\r\nCall-ID: call-1\r\nCSeq: {}\r\n\r\n",
            code, branch, cseq
        );
        match SipMessage::parse(raw.as_bytes()).unwrap() {
            SipMessage::Response(resp) => resp,
            _ => unreachable!(),
        }
    }

    fn key(branch: &str, method: SipMethod) -> TransactionKey {
        TransactionKey {
            call_id: "call-1".to_string(),
            branch: branch.to_string(),
            method,
        }
    }

    #[tokio::test]
    async fn test_final_response_wakes_waiter() {
        let layer = TransactionLayer::new();
        let tx = layer.register(key("z9hG4bK1", SipMethod::Invite));

        assert!(layer.on_response(response(100, "z9hG4bK1", "1 INVITE")));
        assert!(layer.on_response(response(200, "z9hG4bK1", "1 INVITE")));

        let resp = tx.wait_response(Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(layer.pending.len(), 0);
    }

    #[tokio::test]
    async fn test_method_class_must_match() {
        let layer = TransactionLayer::new();
        let _tx = layer.register(key("z9hG4bK2", SipMethod::Bye));

        assert!(!layer.on_response(response(200, "z9hG4bK2", "2 MESSAGE")));
        assert!(layer.on_response(response(200, "z9hG4bK2", "2 BYE")));
    }

    #[tokio::test]
    async fn test_timeout_and_drop_cleanup() {
        let layer = TransactionLayer::new();
        let tx = layer.register(key("z9hG4bK3", SipMethod::Message));
        assert_eq!(layer.pending.len(), 1);

        let err = tx.wait_response(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, SipError::Timeout));
        assert_eq!(layer.pending.len(), 0);
        assert!(!layer.on_response(response(200, "z9hG4bK3", "1 MESSAGE")));
    }
}
