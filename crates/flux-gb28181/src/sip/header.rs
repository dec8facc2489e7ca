// SIP 头部字段解析：URI、From/To 地址、Via

use super::{new_branch, SipError, SipResult};
use std::collections::BTreeMap;
use std::fmt;

/// `;key=value;flag` 形式的参数表，保持原始顺序
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    pub fn parse(s: &str) -> Self {
        let items = s
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
                None => (p.to_string(), None),
            })
            .collect();
        Self(items)
    }

    /// 取值；无值的标志参数返回空串
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: &str, value: Option<String>) {
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key.to_string(), value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 转为有序 map，便于持久化对话参数
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
            .collect()
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        Self(
            map.iter()
                .map(|(k, v)| {
                    let v = if v.is_empty() { None } else { Some(v.clone()) };
                    (k.clone(), v)
                })
                .collect(),
        )
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.0 {
            match v {
                Some(v) => write!(f, ";{}={}", k, v)?,
                None => write!(f, ";{}", k)?,
            }
        }
        Ok(())
    }
}

/// SIP URI（sip:user@host:port;params）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl SipUri {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            host: host.into(),
            port: None,
            params: Params::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn parse(s: &str) -> SipResult<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix("sip:")
            .or_else(|| s.strip_prefix("sips:"))
            .ok_or_else(|| SipError::Parse(format!("unsupported uri scheme: {}", s)))?;

        let (addr, params) = match rest.split_once(';') {
            Some((a, p)) => (a, Params::parse(p)),
            None => (rest, Params::default()),
        };

        let (user, hostport) = match addr.rsplit_once('@') {
            Some((u, h)) => (Some(u.to_string()), h),
            None => (None, addr),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| SipError::Parse(format!("invalid port in uri: {}", s)))?;
                (h.to_string(), Some(port))
            }
            None => (hostport.to_string(), None),
        };

        if host.is_empty() {
            return Err(SipError::Parse(format!("empty host in uri: {}", s)));
        }

        Ok(Self {
            user,
            host,
            port,
            params,
        })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

/// From / To / Contact 头部值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display: Option<String>,
    pub uri: SipUri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display: None,
            uri,
            params: Params::default(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.params.set("tag", Some(tag.into()));
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag").filter(|t| !t.is_empty())
    }

    pub fn parse(s: &str) -> SipResult<Self> {
        let s = s.trim();
        if let Some(lt) = s.find('<') {
            let gt = s[lt..]
                .find('>')
                .map(|i| lt + i)
                .ok_or_else(|| SipError::Parse(format!("unterminated name-addr: {}", s)))?;
            let display = s[..lt].trim().trim_matches('"').trim();
            Ok(Self {
                display: (!display.is_empty()).then(|| display.to_string()),
                uri: SipUri::parse(&s[lt + 1..gt])?,
                params: Params::parse(&s[gt + 1..]),
            })
        } else {
            // addr-spec 形式下分号后的参数属于头部
            let (uri, params) = match s.split_once(';') {
                Some((u, p)) => (u, Params::parse(p)),
                None => (s, Params::default()),
            };
            Ok(Self {
                display: None,
                uri: SipUri::parse(uri)?,
                params,
            })
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{}\" ", display)?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

/// Via 头部中的一跳
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHop {
    /// UDP / TCP
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl ViaHop {
    /// 新建本端 Via，带随机 branch 与 rport
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let mut params = Params::default();
        params.set("branch", Some(new_branch()));
        params.set("rport", None);
        Self {
            transport: transport.into(),
            host: host.into(),
            port: Some(port),
            params,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch").filter(|b| !b.is_empty())
    }

    pub fn received(&self) -> Option<&str> {
        self.params.get("received").filter(|r| !r.is_empty())
    }

    pub fn rport(&self) -> Option<u16> {
        self.params.get("rport").and_then(|p| p.parse().ok())
    }

    /// 解析 Via 头部，多跳时只取第一跳
    pub fn parse(s: &str) -> SipResult<Self> {
        let first = s.split(',').next().unwrap_or_default().trim();
        let (proto, rest) = first
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipError::Parse(format!("invalid via: {}", s)))?;
        let transport = proto
            .rsplit('/')
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SipError::Parse(format!("invalid via protocol: {}", s)))?
            .to_ascii_uppercase();

        let (sent_by, params) = match rest.trim().split_once(';') {
            Some((h, p)) => (h.trim(), Params::parse(p)),
            None => (rest.trim(), Params::default()),
        };

        let (host, port) = match sent_by.rsplit_once(':') {
            Some((h, p)) => (
                h.to_string(),
                Some(
                    p.parse::<u16>()
                        .map_err(|_| SipError::Parse(format!("invalid via port: {}", s)))?,
                ),
            ),
            None => (sent_by.to_string(), None),
        };

        Ok(Self {
            transport,
            host,
            port,
            params,
        })
    }
}

impl fmt::Display for ViaHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}
