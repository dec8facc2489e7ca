// 入站 SIP 请求处理
// REGISTER 鉴权、MESSAGE 按 CmdType 分发、设备主动 BYE

use crate::gateway::{unix_now, Gateway};
use crate::manscdp::{self, CmdType};
use crate::notify::Notify;
use crate::registry::ActiveDevice;
use crate::sip::{
    auth, DigestChallenge, DigestCredentials, RequestHandler, Router, ServerTransaction, SipMethod,
    SipRequest, SipResponse,
};
use async_trait::async_trait;
use std::sync::Arc;

/// 构造网关的 SIP 路由表
pub fn router(gateway: &Arc<Gateway>) -> Router {
    Router::new()
        .route(SipMethod::Register, Arc::new(RegisterHandler(gateway.clone())))
        .route(SipMethod::Message, Arc::new(MessageHandler(gateway.clone())))
        .route(SipMethod::Bye, Arc::new(ByeHandler(gateway.clone())))
}

async fn reply(tx: &ServerTransaction, req: &SipRequest, status_code: u16) {
    if let Err(e) = tx.reply(req, status_code).await {
        tracing::warn!(
            target: "gb28181::sip",
            remote = %tx.source(),
            status = status_code,
            "Failed to send response: {}",
            e
        );
    }
}

/// REGISTER：Digest 鉴权，成功后登记在线设备
pub struct RegisterHandler(Arc<Gateway>);

impl RegisterHandler {
    /// 鉴权通过时返回设备寻址信息与库中记录
    async fn authenticate(
        &self,
        req: &SipRequest,
        device: &ActiveDevice,
    ) -> crate::Result<Option<crate::store::device::Model>> {
        let Some(header) = req.headers.get("Authorization") else {
            return Ok(None);
        };
        let Some(credentials) = DigestCredentials::parse(header) else {
            tracing::debug!(target: "gb28181::sip", device_id = %device.device_id, "Malformed Authorization header");
            return Ok(None);
        };
        if credentials.username != device.device_id {
            tracing::warn!(
                target: "gb28181::sip",
                device_id = %device.device_id,
                username = %credentials.username,
                "Authorization username does not match device"
            );
            return Ok(None);
        }

        let Some(stored) = self.0.store.find_device(&device.device_id).await? else {
            tracing::warn!(target: "gb28181::sip", device_id = %device.device_id, "REGISTER from unknown device");
            return Ok(None);
        };

        let method = req.method.to_string();
        if !auth::verify(&credentials, &stored.password, &method, &credentials.uri) {
            tracing::warn!(target: "gb28181::sip", device_id = %device.device_id, "Digest verification failed");
            return Ok(None);
        }
        Ok(Some(stored))
    }

    async fn challenge(&self, req: &SipRequest, tx: &ServerTransaction) {
        let challenge = DigestChallenge::new(&self.0.sys.region);
        let mut resp = SipResponse::from_request(req, 401);
        resp.add_header("WWW-Authenticate", challenge.header_value());
        if let Err(e) = tx.respond(resp).await {
            tracing::warn!(target: "gb28181::sip", remote = %tx.source(), "Failed to send 401: {}", e);
        }
    }
}

#[async_trait]
impl RequestHandler for RegisterHandler {
    async fn handle(&self, req: SipRequest, tx: ServerTransaction) {
        let Some(device) = ActiveDevice::from_request(&req, tx.source()) else {
            reply(&tx, &req, 400).await;
            return;
        };

        let stored = match self.authenticate(&req, &device).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                self.challenge(&req, &tx).await;
                return;
            }
            Err(e) => {
                tracing::error!(target: "gb28181::sip", device_id = %device.device_id, "REGISTER lookup failed: {}", e);
                reply(&tx, &req, 500).await;
                return;
            }
        };

        let device_id = device.device_id.clone();
        if req.headers.get("Expires").map(str::trim) == Some("0") {
            self.0.devices.evict(&device_id);
            tracing::info!(target: "gb28181::sip", %device_id, "Device unregistered");
            reply(&tx, &req, 200).await;
            return;
        }

        self.0.devices.on_register(device.clone());
        if !stored.registered {
            if let Err(e) = self.0.store.save_registration(&device, unix_now()).await {
                tracing::error!(target: "gb28181::sip", %device_id, "Failed to save registration: {}", e);
                reply(&tx, &req, 500).await;
                return;
            }
            tracing::info!(target: "gb28181::sip", %device_id, "New device registered");
            self.0.query_catalog(device.clone());
        }

        reply(&tx, &req, 200).await;

        let payload = match self.0.store.find_device(&device_id).await {
            Ok(Some(saved)) => serde_json::to_value(saved).unwrap_or_default(),
            _ => serde_json::to_value(stored).unwrap_or_default(),
        };
        self.0.notifier.emit(Notify::devices_register(payload));
        self.0.query_device_info(device);
    }
}

/// MESSAGE：MANSCDP 报文分发
pub struct MessageHandler(Arc<Gateway>);

#[async_trait]
impl RequestHandler for MessageHandler {
    async fn handle(&self, req: SipRequest, tx: ServerTransaction) {
        let Some(device) = ActiveDevice::from_request(&req, tx.source()) else {
            reply(&tx, &req, 400).await;
            return;
        };
        if req.body.is_empty() {
            reply(&tx, &req, 200).await;
            return;
        }

        let msg = match manscdp::decode(&req.body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", device_id = %device.device_id, "Bad MANSCDP body: {}", e);
                reply(&tx, &req, 400).await;
                return;
            }
        };

        let gateway = &self.0;
        match msg.cmd() {
            CmdType::Keepalive => match gateway.on_keepalive(&device, &msg).await {
                Ok(()) => {
                    reply(&tx, &req, 200).await;
                    gateway.query_catalog(device);
                }
                Err(e) => {
                    tracing::error!(target: "gb28181::sip", device_id = %device.device_id, "Keepalive failed: {}", e);
                    reply(&tx, &req, 500).await;
                }
            },
            CmdType::Catalog => {
                if let Err(e) = gateway.on_catalog(&device.device_id, &msg).await {
                    tracing::error!(target: "gb28181::sip", device_id = %device.device_id, "Catalog sync failed: {}", e);
                }
                reply(&tx, &req, 200).await;
            }
            CmdType::RecordInfo => {
                gateway.record_queries.on_record_info(&msg);
                reply(&tx, &req, 200).await;
            }
            CmdType::DeviceInfo => {
                if let Err(e) = gateway.on_device_info(&device.device_id, &msg).await {
                    tracing::error!(target: "gb28181::sip", device_id = %device.device_id, "DeviceInfo save failed: {}", e);
                }
                reply(&tx, &req, 200).await;
            }
            CmdType::Other(cmd) => {
                tracing::debug!(target: "gb28181::sip", device_id = %device.device_id, %cmd, "Unsupported CmdType");
                reply(&tx, &req, 400).await;
            }
        }
    }
}

/// BYE：设备主动结束推流
pub struct ByeHandler(Arc<Gateway>);

#[async_trait]
impl RequestHandler for ByeHandler {
    async fn handle(&self, req: SipRequest, tx: ServerTransaction) {
        reply(&tx, &req, 200).await;
        let Some(call_id) = req.headers.call_id().map(str::to_string) else {
            return;
        };
        if let Err(e) = self.0.on_inbound_bye(&call_id).await {
            tracing::warn!(target: "gb28181::play", %call_id, "Inbound BYE cleanup failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::gateway;
    use crate::sip::SipMessage;
    use crate::store::testing::device;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::sync::broadcast;

    const DEVICE_ID: &str = "34020000001110000001";

    fn register(call_id: &str, authorization: Option<String>, expires: u32) -> String {
        let auth = authorization
            .map(|a| format!("Authorization: {}\r\n", a))
            .unwrap_or_default();
        format!(
            "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK{call_id}\r\n\
             From: <sip:{DEVICE_ID}@3402000000>;tag=reg\r\n\
             To: <sip:{DEVICE_ID}@3402000000>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 REGISTER\r\n\
             Expires: {expires}\r\n\
             {auth}Content-Length: 0\r\n\r\n"
        )
    }

    fn message(call_id: &str, body: &str) -> String {
        format!(
            "MESSAGE sip:34020000002000000001@3402000000 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK{call_id}\r\n\
             From: <sip:{DEVICE_ID}@3402000000>;tag=msg\r\n\
             To: <sip:34020000002000000001@3402000000>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 MESSAGE\r\n\
             Content-Type: Application/MANSCDP+xml\r\n\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    /// 读取下一个响应；网关下发的请求一律回 200 后忽略
    async fn next_response(sock: &UdpSocket) -> SipResponse {
        let mut buf = vec![0u8; 8192];
        loop {
            let (len, from) = tokio::time::timeout(Duration::from_secs(3), sock.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            match SipMessage::parse(&buf[..len]).unwrap() {
                SipMessage::Response(resp) => return resp,
                SipMessage::Request(req) => {
                    let ok = SipResponse::from_request(&req, 200);
                    sock.send_to(&ok.to_bytes(), from).await.unwrap();
                }
            }
        }
    }

    fn nonce_of(challenge: &str) -> String {
        let start = challenge.find("nonce=\"").unwrap() + 7;
        let end = start + challenge[start..].find('"').unwrap();
        challenge[start..end].to_string()
    }

    fn authorization(nonce: &str, password: &str) -> String {
        let uri = "sip:34020000002000000001@3402000000";
        let response = auth::compute_response(DEVICE_ID, "3402000000", password, "REGISTER", uri, nonce);
        format!(
            "Digest username=\"{DEVICE_ID}\", realm=\"3402000000\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\", algorithm=MD5"
        )
    }

    #[tokio::test]
    async fn test_register_challenge_then_accept() {
        let (gw, _) = gateway().await;
        gw.store.insert_device(device(DEVICE_ID, "12345678")).await.unwrap();
        let (shutdown, _) = broadcast::channel(1);
        gw.start(&shutdown);

        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = gw.sip.local_addr();

        sock.send_to(register("reg-1", None, 3600).as_bytes(), server).await.unwrap();
        let resp = next_response(&sock).await;
        assert_eq!(resp.status_code, 401);
        let nonce = nonce_of(resp.headers.get("WWW-Authenticate").unwrap());

        // 错误密码仍然挑战
        let bad = register("reg-2", Some(authorization(&nonce, "wrong")), 3600);
        sock.send_to(bad.as_bytes(), server).await.unwrap();
        assert_eq!(next_response(&sock).await.status_code, 401);
        assert!(gw.devices.is_empty());

        let good = register("reg-3", Some(authorization(&nonce, "12345678")), 3600);
        sock.send_to(good.as_bytes(), server).await.unwrap();
        assert_eq!(next_response(&sock).await.status_code, 200);

        let online = gw.devices.lookup(DEVICE_ID).unwrap();
        assert_eq!(online.source.addr, sock.local_addr().unwrap());
        let saved = gw.store.find_device(DEVICE_ID).await.unwrap().unwrap();
        assert!(saved.registered);
        assert!(saved.regist_at > 0);

        let bye = register("reg-4", Some(authorization(&nonce, "12345678")), 0);
        sock.send_to(bye.as_bytes(), server).await.unwrap();
        assert_eq!(next_response(&sock).await.status_code, 200);
        assert!(gw.devices.lookup(DEVICE_ID).is_none());

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_register_unknown_device_is_challenged() {
        let (gw, _) = gateway().await;
        let (shutdown, _) = broadcast::channel(1);
        gw.start(&shutdown);

        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let req = register("reg-x", Some(authorization("n", "12345678")), 3600);
        sock.send_to(req.as_bytes(), gw.sip.local_addr()).await.unwrap();
        assert_eq!(next_response(&sock).await.status_code, 401);

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_message_dispatch_status_codes() {
        let (gw, _) = gateway().await;
        gw.store.insert_device(device(DEVICE_ID, "12345678")).await.unwrap();
        let (shutdown, _) = broadcast::channel(1);
        gw.start(&shutdown);

        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = gw.sip.local_addr();

        sock.send_to(message("m-1", "").as_bytes(), server).await.unwrap();
        assert_eq!(next_response(&sock).await.status_code, 200);

        sock.send_to(message("m-2", "<Notify><broken").as_bytes(), server).await.unwrap();
        assert_eq!(next_response(&sock).await.status_code, 400);

        let unknown = "<Notify><CmdType>Alarm</CmdType><SN>1</SN><DeviceID>34020000001110000001</DeviceID></Notify>";
        sock.send_to(message("m-3", unknown).as_bytes(), server).await.unwrap();
        assert_eq!(next_response(&sock).await.status_code, 400);

        let keepalive = "<Notify><CmdType>Keepalive</CmdType><SN>2</SN><DeviceID>34020000001110000001</DeviceID><Status>OK</Status></Notify>";
        sock.send_to(message("m-4", keepalive).as_bytes(), server).await.unwrap();
        assert_eq!(next_response(&sock).await.status_code, 200);
        assert!(gw.devices.lookup(DEVICE_ID).is_some());

        let _ = shutdown.send(());
    }
}
