// GB28181 SIP 服务器
// 接收报文、按方法分发请求、将响应交给事务层

use super::header::{NameAddr, SipUri, ViaHop};
use super::message::{SipMessage, SipMethod, SipRequest, SipResponse};
use super::transaction::{ClientTransaction, TransactionKey, TransactionLayer};
use super::transport::{Destination, Packet, Protocol, Transport};
use super::{SipError, SipResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// SIP 服务器配置
#[derive(Debug, Clone)]
pub struct SipServerConfig {
    /// UDP 监听地址
    pub udp: String,

    /// TCP 监听地址
    pub tcp: Option<String>,

    /// 对外通告地址，为空时取监听地址
    pub host: String,

    /// SIP 域
    pub sip_domain: String,

    /// SIP ID（平台 ID）
    pub sip_id: String,

    /// 等待响应超时
    pub response_timeout: Duration,
}

impl Default for SipServerConfig {
    fn default() -> Self {
        Self {
            udp: "0.0.0.0:5060".to_string(),
            tcp: None,
            host: String::new(),
            sip_domain: "3402000000".to_string(),
            sip_id: "34020000002000000001".to_string(),
            response_timeout: Duration::from_secs(10),
        }
    }
}

/// 入站请求处理器
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, req: SipRequest, tx: ServerTransaction);
}

/// 方法到处理器的路由表，未登记的方法回复 405
#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<SipMethod, Arc<dyn RequestHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, method: SipMethod, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.insert(method, handler);
        self
    }

    fn allow(&self) -> String {
        let mut methods: Vec<String> = self.handlers.keys().map(|m| m.to_string()).collect();
        methods.push("ACK".to_string());
        methods.sort();
        methods.join(", ")
    }
}

/// 服务端事务：用于回复一个入站请求
pub struct ServerTransaction {
    server: Arc<SipServer>,
    source: Destination,
}

impl ServerTransaction {
    /// 请求来源（UDP 地址或 TCP 连接）
    pub fn source(&self) -> Destination {
        self.source
    }

    pub async fn respond(&self, resp: SipResponse) -> SipResult<()> {
        self.server.respond(resp, self.source).await
    }

    /// 快捷回复无消息体的响应
    pub async fn reply(&self, req: &SipRequest, status_code: u16) -> SipResult<()> {
        self.respond(SipResponse::from_request(req, status_code)).await
    }
}

/// GB28181 SIP 服务器
pub struct SipServer {
    config: SipServerConfig,
    transport: Arc<Transport>,
    transactions: Arc<TransactionLayer>,
    inbound: Mutex<Option<mpsc::Receiver<Packet>>>,
    local_addr: SocketAddr,
    advertised_host: String,
}

impl SipServer {
    /// 创建 SIP 服务器并绑定端口
    pub async fn bind(config: SipServerConfig) -> SipResult<Arc<Self>> {
        let (transport, inbound) = Transport::bind(&config.udp, config.tcp.as_deref()).await?;
        let local_addr = transport.local_addr()?;

        let advertised_host = if !config.host.is_empty() {
            config.host.clone()
        } else if local_addr.ip().is_unspecified() {
            tracing::warn!(
                target: "gb28181::sip",
                "sip.host is empty and listener is unspecified, advertising 127.0.0.1"
            );
            "127.0.0.1".to_string()
        } else {
            local_addr.ip().to_string()
        };

        tracing::info!(
            target: "gb28181::sip",
            %local_addr,
            sip_id = %config.sip_id,
            domain = %config.sip_domain,
            "GB28181 SIP server listening"
        );

        Ok(Arc::new(Self {
            config,
            transport,
            transactions: TransactionLayer::new(),
            inbound: Mutex::new(Some(inbound)),
            local_addr,
            advertised_host,
        }))
    }

    pub fn config(&self) -> &SipServerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.transport.tcp_local_addr()
    }

    pub fn response_timeout(&self) -> Duration {
        self.config.response_timeout
    }

    pub fn transactions(&self) -> &Arc<TransactionLayer> {
        &self.transactions
    }

    /// 本端 Via（新 branch）
    pub fn via(&self, protocol: Protocol) -> ViaHop {
        ViaHop::new(protocol.to_string(), &self.advertised_host, self.local_addr.port())
    }

    /// 本端 Contact：`<sip:{sip_id}@{host}:{port}>`
    pub fn contact(&self) -> NameAddr {
        NameAddr::new(
            SipUri::new(&self.config.sip_id, &self.advertised_host).with_port(self.local_addr.port()),
        )
    }

    /// 平台地址：`<sip:{sip_id}@{domain}>`
    pub fn server_addr(&self) -> NameAddr {
        NameAddr::new(SipUri::new(&self.config.sip_id, &self.config.sip_domain))
    }

    /// 启动接收与分发循环
    pub fn start(self: &Arc<Self>, router: Router, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        self.transport.start(shutdown);

        let inbound = self.inbound.lock().ok().and_then(|mut guard| guard.take());
        let server = self.clone();
        let router = Arc::new(router);
        let mut shutdown = shutdown.subscribe();

        tokio::spawn(async move {
            let Some(mut inbound) = inbound else {
                tracing::error!(target: "gb28181::sip", "SIP server already started");
                return;
            };
            tracing::info!(target: "gb28181::sip", "GB28181 SIP server started");

            loop {
                tokio::select! {
                    packet = inbound.recv() => {
                        let Some(packet) = packet else { break };
                        let server = server.clone();
                        let router = router.clone();
                        // 每个报文独立处理，慢设备不阻塞其他设备
                        tokio::spawn(async move {
                            server.handle_packet(&router, packet).await;
                        });
                    }
                    _ = shutdown.recv() => {
                        tracing::info!(target: "gb28181::sip", "GB28181 SIP server stopped");
                        break;
                    }
                }
            }
        })
    }

    async fn handle_packet(self: &Arc<Self>, router: &Router, packet: Packet) {
        let source = packet.source;
        let message = match SipMessage::parse(&packet.data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    target: "gb28181::sip",
                    remote = %source,
                    bytes = packet.data.len(),
                    "Dropping malformed SIP message: {}",
                    e
                );
                return;
            }
        };

        match message {
            SipMessage::Request(req) => self.dispatch(router, req, source).await,
            SipMessage::Response(resp) => {
                let status = resp.status_code;
                let call_id = resp.headers.call_id().unwrap_or_default().to_string();
                if !self.transactions.on_response(resp) {
                    tracing::debug!(
                        target: "gb28181::sip",
                        remote = %source,
                        status,
                        %call_id,
                        "Unmatched SIP response"
                    );
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, router: &Router, req: SipRequest, source: Destination) {
        tracing::debug!(
            target: "gb28181::sip",
            remote = %source,
            method = %req.method,
            call_id = req.headers.call_id().unwrap_or_default(),
            "Received SIP request"
        );

        // 2xx 的 ACK 不需要应答
        if req.method == SipMethod::Ack {
            return;
        }

        let tx = ServerTransaction {
            server: self.clone(),
            source,
        };

        match router.handlers.get(&req.method) {
            Some(handler) => handler.handle(req, tx).await,
            None => {
                tracing::warn!(target: "gb28181::sip", remote = %source, "Unsupported SIP method: {}", req.method);
                let mut resp = SipResponse::from_request(&req, 405);
                resp.add_header("Allow", router.allow());
                if let Err(e) = tx.respond(resp).await {
                    tracing::warn!(target: "gb28181::sip", remote = %source, "Failed to send 405: {}", e);
                }
            }
        }
    }

    /// 发送请求并登记客户端事务
    pub async fn request(
        self: &Arc<Self>,
        req: &SipRequest,
        dest: Destination,
    ) -> SipResult<ClientTransaction> {
        let key = TransactionKey::from_request(req)
            .ok_or_else(|| SipError::Parse("request without Call-ID or Via branch".to_string()))?;
        let tx = self.transactions.register(key);
        self.transport.send(dest, req.to_bytes()).await?;
        Ok(tx)
    }

    /// 发送无需等待响应的请求（ACK）
    pub async fn send_request(&self, req: &SipRequest, dest: Destination) -> SipResult<()> {
        self.send_raw(dest, req).await
    }

    pub async fn respond(&self, resp: SipResponse, dest: Destination) -> SipResult<()> {
        tracing::debug!(
            target: "gb28181::sip",
            remote = %dest,
            status = resp.status_code,
            "Sent SIP response"
        );
        self.transport.send(dest, resp.to_bytes()).await
    }

    async fn send_raw(&self, dest: Destination, req: &SipRequest) -> SipResult<()> {
        self.transport.send(dest, req.to_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, req: SipRequest, tx: ServerTransaction) {
            tx.reply(&req, 200).await.unwrap();
        }
    }

    async fn server() -> (Arc<SipServer>, broadcast::Sender<()>) {
        let config = SipServerConfig {
            udp: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let server = SipServer::bind(config).await.unwrap();
        let (shutdown, _) = broadcast::channel(1);
        let router = Router::new().route(SipMethod::Message, Arc::new(EchoHandler));
        server.start(router, &shutdown);
        (server, shutdown)
    }

    async fn recv_response(sock: &UdpSocket) -> SipResponse {
        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match SipMessage::parse(&buf[..len]).unwrap() {
            SipMessage::Response(resp) => resp,
            SipMessage::Request(req) => panic!("unexpected request {}", req.method),
        }
    }

    fn request(method: &str) -> String {
        format!(
            "{} sip:34020000002000000001@3402000000 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK77\r\n\
             From: <sip:34020000001320000001@3402000000>;tag=1\r\n\
             To: <sip:34020000002000000001@3402000000>\r\n\
             Call-ID: dispatch-test\r\n\
             CSeq: 1 {}\r\n\
             Content-Length: 0\r\n\r\n",
            method, method
        )
    }

    #[tokio::test]
    async fn test_routes_by_method_and_rejects_unknown() {
        let (server, shutdown) = server().await;
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        device
            .send_to(request("MESSAGE").as_bytes(), server.local_addr())
            .await
            .unwrap();
        let resp = recv_response(&device).await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.headers.call_id(), Some("dispatch-test"));

        device
            .send_to(request("SUBSCRIBE").as_bytes(), server.local_addr())
            .await
            .unwrap();
        let resp = recv_response(&device).await;
        assert_eq!(resp.status_code, 405);
        assert!(resp.headers.get("Allow").unwrap().contains("MESSAGE"));

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_client_transaction_receives_response() {
        let (server, shutdown) = server().await;
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut req = SipRequest::new(SipMethod::Message, "sip:34020000001320000001@3402000000");
        req.add_header("Via", server.via(Protocol::Udp).to_string());
        req.add_header("Call-ID", "outbound-1");
        req.add_header("CSeq", "1 MESSAGE");

        let tx = server
            .request(&req, Destination::udp(device.local_addr().unwrap()))
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let (len, from) = device.recv_from(&mut buf).await.unwrap();
        let SipMessage::Request(received) = SipMessage::parse(&buf[..len]).unwrap() else {
            panic!("expected request");
        };
        let resp = SipResponse::from_request(&received, 200);
        device.send_to(&resp.to_bytes(), from).await.unwrap();

        let resp = tx.wait_response(Duration::from_secs(2)).await.unwrap();
        assert_eq!(resp.status_code, 200);

        let _ = shutdown.send(());
    }
}
