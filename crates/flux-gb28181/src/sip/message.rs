// SIP 消息解析和生成
// 支持 GB28181 所需的请求/响应格式，消息体按字节保存（GB2312 报文不做预解码）

use super::header::{NameAddr, ViaHop};
use super::{random_token, SipError, SipResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// SIP 方法
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Options,
    Info,
    Subscribe,
    Notify,
    Other(String),
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMethod::Register => write!(f, "REGISTER"),
            SipMethod::Invite => write!(f, "INVITE"),
            SipMethod::Ack => write!(f, "ACK"),
            SipMethod::Bye => write!(f, "BYE"),
            SipMethod::Cancel => write!(f, "CANCEL"),
            SipMethod::Message => write!(f, "MESSAGE"),
            SipMethod::Options => write!(f, "OPTIONS"),
            SipMethod::Info => write!(f, "INFO"),
            SipMethod::Subscribe => write!(f, "SUBSCRIBE"),
            SipMethod::Notify => write!(f, "NOTIFY"),
            SipMethod::Other(m) => write!(f, "{}", m),
        }
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "MESSAGE" => SipMethod::Message,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            other => SipMethod::Other(other.to_string()),
        }
    }
}

/// 紧凑头部名映射（RFC 3261 7.3.3）
fn expand_compact(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "s" | "S" => "Subject",
        "k" | "K" => "Supported",
        _ => name,
    }
}

/// 有序头部列表，查找不区分大小写
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.get_all(name).next()
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let name = expand_compact(name);
        self.0
            .iter()
            .filter(move |(k, _)| expand_compact(k).eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 追加头部（允许重复，如多条 Via）
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 设置头部，覆盖同名头部
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.push((name, value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        let name = expand_compact(name).to_string();
        self.0
            .retain(|(k, _)| !expand_compact(k).eq_ignore_ascii_case(&name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn call_id(&self) -> Option<&str> {
        self.get("Call-ID")
    }

    /// CSeq 序号与方法
    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        let (seq, method) = self.get("CSeq")?.trim().split_once(char::is_whitespace)?;
        Some((seq.trim().parse().ok()?, SipMethod::parse(method.trim())))
    }

    pub fn via(&self) -> Option<ViaHop> {
        self.get("Via").and_then(|v| ViaHop::parse(v).ok())
    }

    pub fn from(&self) -> Option<NameAddr> {
        self.get("From").and_then(|v| NameAddr::parse(v).ok())
    }

    pub fn to(&self) -> Option<NameAddr> {
        self.get("To").and_then(|v| NameAddr::parse(v).ok())
    }

    pub fn contact(&self) -> Option<NameAddr> {
        self.get("Contact").and_then(|v| NameAddr::parse(v).ok())
    }

    fn write_to(&self, buf: &mut BytesMut) {
        for (key, value) in &self.0 {
            if expand_compact(key).eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            buf.put_slice(key.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "SIP/2.0".to_string(),
            headers: Headers::default(),
            body: Bytes::new(),
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push(key, value);
    }

    /// 设置消息体
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// 生成 SIP 请求报文，Content-Length 按消息体自动计算
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(format!("{} {} {}\r\n", self.method, self.uri, self.version).as_bytes());
        self.headers.write_to(&mut buf);
        buf.put_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::default(),
            body: Bytes::new(),
        }
    }

    /// 基于请求生成响应：复制 Via/From/To/Call-ID/CSeq，终结响应补 To tag
    pub fn from_request(req: &SipRequest, status_code: u16) -> Self {
        let mut resp = Self::new(status_code, reason_phrase(status_code));
        for via in req.headers.get_all("Via") {
            resp.headers.push("Via", via);
        }
        for key in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = req.headers.get(key) {
                resp.headers.push(key, value);
            }
        }
        if status_code >= 200 {
            if let Some(to) = req.headers.to() {
                if to.tag().is_none() {
                    resp.headers.set("To", to.with_tag(random_token(10)).to_string());
                }
            }
        }
        resp.headers.push("User-Agent", crate::USER_AGENT);
        resp
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push(key, value);
    }

    /// 设置消息体
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// 生成 SIP 响应报文
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(
            format!("{} {} {}\r\n", self.version, self.status_code, self.reason_phrase)
                .as_bytes(),
        );
        self.headers.write_to(&mut buf);
        buf.put_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code < 200
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// 常用状态码的原因短语
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 从原始字节解析 SIP 消息
    pub fn parse(data: &[u8]) -> SipResult<Self> {
        let (head_end, body_start) = find_header_end(data)
            .ok_or_else(|| SipError::Parse("missing header terminator".to_string()))?;

        let head = std::str::from_utf8(&data[..head_end])
            .map_err(|_| SipError::Parse("non utf-8 header section".to_string()))?;
        let mut lines = unfold_lines(head).into_iter();

        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| SipError::Parse("empty SIP message".to_string()))?;

        let mut headers = Headers::default();
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                headers.push(key.trim(), value.trim());
            }
        }

        let mut body = &data[body_start..];
        if let Some(len) = headers
            .get("Content-Length")
            .and_then(|l| l.trim().parse::<usize>().ok())
        {
            if len < body.len() {
                body = &body[..len];
            }
        }
        let body = Bytes::copy_from_slice(body);

        if start_line.starts_with("SIP/") {
            let mut parts = start_line.splitn(3, ' ');
            let version = parts.next().unwrap_or_default().to_string();
            let status_code = parts
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| SipError::Parse(format!("invalid status line: {}", start_line)))?;
            let reason_phrase = parts.next().unwrap_or_default().to_string();
            Ok(SipMessage::Response(SipResponse {
                version,
                status_code,
                reason_phrase,
                headers,
                body,
            }))
        } else {
            let parts: Vec<&str> = start_line.split_whitespace().collect();
            if parts.len() != 3 {
                return Err(SipError::Parse(format!("invalid request line: {}", start_line)));
            }
            Ok(SipMessage::Request(SipRequest {
                method: SipMethod::parse(parts[0]),
                uri: parts[1].to_string(),
                version: parts[2].to_string(),
                headers,
                body,
            }))
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

/// 返回 (头部结束位置, 消息体起始位置)
fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    data.windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, pos + 2))
}

/// 按行切分并合并折行
fn unfold_lines(head: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in head.lines() {
        let line = raw.trim_end_matches('\r');
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
                continue;
            }
        }
        lines.push(line.to_string());
    }
    while lines.first().map(|l| l.is_empty()).unwrap_or(false) {
        lines.remove(0);
    }
    lines
}
