// SIP 传输层
// UDP 收发 + TCP 长连接（按 Content-Length 分帧），所有入站报文汇入同一个通道

use super::{SipError, SipResult};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};

/// UDP 单个报文上限
const MAX_DATAGRAM: usize = 65535;

/// TCP 单条消息体上限
const MAX_TCP_BODY: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Tcp => write!(f, "TCP"),
        }
    }
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Some(Protocol::Udp),
            "TCP" => Some(Protocol::Tcp),
            _ => None,
        }
    }
}

/// 报文的对端：协议 + 地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub protocol: Protocol,
    pub addr: SocketAddr,
}

impl Destination {
    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            protocol: Protocol::Udp,
            addr,
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            protocol: Protocol::Tcp,
            addr,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.addr)
    }
}

/// 入站原始报文
#[derive(Debug, Clone)]
pub struct Packet {
    pub source: Destination,
    pub data: Bytes,
}

/// SIP 传输层
pub struct Transport {
    udp: Arc<UdpSocket>,
    tcp: Option<TcpListener>,
    /// TCP 连接的写通道，key 为对端地址
    tcp_conns: DashMap<SocketAddr, mpsc::Sender<Bytes>>,
    inbound: mpsc::Sender<Packet>,
}

impl Transport {
    /// 绑定监听端口，返回传输层与入站报文接收端
    pub async fn bind(
        udp_addr: &str,
        tcp_addr: Option<&str>,
    ) -> SipResult<(Arc<Self>, mpsc::Receiver<Packet>)> {
        let udp = UdpSocket::bind(udp_addr).await?;
        let tcp = match tcp_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        tracing::info!(
            target: "gb28181::sip",
            udp = %udp.local_addr()?,
            tcp = ?tcp.as_ref().and_then(|l| l.local_addr().ok()),
            "SIP transport bound"
        );

        let (inbound, rx) = mpsc::channel(1024);
        Ok((
            Arc::new(Self {
                udp: Arc::new(udp),
                tcp,
                tcp_conns: DashMap::new(),
                inbound,
            }),
            rx,
        ))
    }

    pub fn local_addr(&self) -> SipResult<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// 启动 UDP / TCP 接收循环
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let transport = self.clone();
        let mut udp_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = transport.udp_loop() => {}
                _ = udp_shutdown.recv() => {
                    tracing::info!(target: "gb28181::sip", "UDP receive loop stopped");
                }
            }
        });

        if self.tcp.is_some() {
            let transport = self.clone();
            let mut tcp_shutdown = shutdown.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = transport.accept_loop() => {}
                    _ = tcp_shutdown.recv() => {
                        tracing::info!(target: "gb28181::sip", "TCP accept loop stopped");
                    }
                }
            });
        }
    }

    async fn udp_loop(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.udp.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    // 部分设备会发送 CRLF 保活
                    if buf[..len].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    let packet = Packet {
                        source: Destination::udp(addr),
                        data: Bytes::copy_from_slice(&buf[..len]),
                    };
                    if self.inbound.send(packet).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(target: "gb28181::sip", "Failed to receive UDP packet: {}", e);
                }
            }
        }
    }

    async fn accept_loop(self: &Arc<Self>) {
        let Some(listener) = self.tcp.as_ref() else {
            return;
        };
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!(target: "gb28181::sip", remote = %addr, "TCP connection accepted");
                    self.attach(stream, addr);
                }
                Err(e) => {
                    tracing::error!(target: "gb28181::sip", "Failed to accept TCP connection: {}", e);
                }
            }
        }
    }

    /// 为一条 TCP 连接启动读写任务
    fn attach(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> mpsc::Sender<Bytes> {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        self.tcp_conns.insert(addr, tx.clone());

        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = write_half.write_all(&data).await {
                    tracing::warn!(target: "gb28181::sip", remote = %addr, "TCP write failed: {}", e);
                    break;
                }
            }
        });

        let transport = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(data)) => {
                        let packet = Packet {
                            source: Destination::tcp(addr),
                            data,
                        };
                        if transport.inbound.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(target: "gb28181::sip", remote = %addr, "TCP read failed: {}", e);
                        break;
                    }
                }
            }
            transport.tcp_conns.remove(&addr);
            tracing::debug!(target: "gb28181::sip", remote = %addr, "TCP connection closed");
        });

        tx
    }

    /// 发送报文，TCP 无连接时主动建立
    pub async fn send(self: &Arc<Self>, dest: Destination, data: Bytes) -> SipResult<()> {
        match dest.protocol {
            Protocol::Udp => {
                self.udp.send_to(&data, dest.addr).await?;
            }
            Protocol::Tcp => {
                let existing = self.tcp_conns.get(&dest.addr).map(|c| c.clone());
                let conn = match existing {
                    Some(conn) => conn,
                    None => {
                        let stream = TcpStream::connect(dest.addr).await?;
                        self.attach(stream, dest.addr)
                    }
                };
                conn.send(data)
                    .await
                    .map_err(|_| SipError::NotConnected(dest.addr))?;
            }
        }
        Ok(())
    }
}

/// 从 TCP 流读取一条完整 SIP 消息：头部读到空行，再按 Content-Length 读消息体
pub async fn read_frame<R>(reader: &mut R) -> SipResult<Option<Bytes>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = BytesMut::new();
    let mut content_length = 0usize;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if frame.is_empty() {
                // 消息之间的空行保活
                continue;
            }
            frame.extend_from_slice(line.as_bytes());
            break;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            let key = key.trim();
            if key.eq_ignore_ascii_case("Content-Length") || key.eq_ignore_ascii_case("l") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| SipError::Parse(format!("invalid Content-Length: {}", value)))?;
            }
        }
        frame.extend_from_slice(line.as_bytes());
    }

    if content_length > MAX_TCP_BODY {
        return Err(SipError::Parse(format!("body too large: {}", content_length)));
    }

    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        frame.extend_from_slice(&body);
    }

    Ok(Some(frame.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame_splits_pipelined_messages() {
        let raw = b"\r\n\r\nMESSAGE sip:a@b SIP/2.0\r\nContent-Length: 4\r\n\r\nabcdBYE sip:a@b SIP/2.0\r\nl: 0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);

        let first = read_frame(&mut reader).await.unwrap().unwrap();
        assert!(first.starts_with(b"MESSAGE"));
        assert!(first.ends_with(b"\r\n\r\nabcd"));

        let second = read_frame(&mut reader).await.unwrap().unwrap();
        assert!(second.starts_with(b"BYE"));

        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_udp_packets_reach_inbound_channel() {
        let (transport, mut rx) = Transport::bind("127.0.0.1:0", None).await.unwrap();
        let (shutdown, _) = broadcast::channel(1);
        transport.start(&shutdown);

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = transport.local_addr().unwrap();
        peer.send_to(b"\r\n", server_addr).await.unwrap();
        peer.send_to(b"OPTIONS sip:a@b SIP/2.0\r\n\r\n", server_addr)
            .await
            .unwrap();

        let packet = rx.recv().await.unwrap();
        assert_eq!(packet.source, Destination::udp(peer.local_addr().unwrap()));
        assert!(packet.data.starts_with(b"OPTIONS"));
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_tcp_reply_uses_same_connection() {
        let (transport, mut rx) = Transport::bind("127.0.0.1:0", Some("127.0.0.1:0"))
            .await
            .unwrap();
        let (shutdown, _) = broadcast::channel(1);
        transport.start(&shutdown);

        let mut client = TcpStream::connect(transport.tcp_local_addr().unwrap())
            .await
            .unwrap();
        client
            .write_all(b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 2\r\n\r\nhi")
            .await
            .unwrap();

        let packet = rx.recv().await.unwrap();
        assert_eq!(packet.source.protocol, Protocol::Tcp);

        transport
            .send(packet.source, Bytes::from_static(b"SIP/2.0 200 OK\r\n\r\n"))
            .await
            .unwrap();

        let mut buf = [0u8; 18];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SIP/2.0 200 OK\r\n\r\n");
        let _ = shutdown.send(());
    }
}
