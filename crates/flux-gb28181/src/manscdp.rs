// GB28181 MANSCDP XML 报文
// 设备上报（Keepalive/Catalog/DeviceInfo/RecordInfo）解析与平台查询报文生成

use crate::{GatewayError, Result};
use quick_xml::de::from_str;
use serde::Deserialize;
use std::fmt;

pub const CONTENT_TYPE: &str = "Application/MANSCDP+xml";

/// 命令类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdType {
    Keepalive,
    Catalog,
    DeviceInfo,
    RecordInfo,
    Other(String),
}

impl CmdType {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "Keepalive" => CmdType::Keepalive,
            "Catalog" => CmdType::Catalog,
            "DeviceInfo" => CmdType::DeviceInfo,
            "RecordInfo" => CmdType::RecordInfo,
            other => CmdType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for CmdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmdType::Keepalive => write!(f, "Keepalive"),
            CmdType::Catalog => write!(f, "Catalog"),
            CmdType::DeviceInfo => write!(f, "DeviceInfo"),
            CmdType::RecordInfo => write!(f, "RecordInfo"),
            CmdType::Other(s) => write!(f, "{}", s),
        }
    }
}

/// MANSCDP 报文根节点（Response / Notify 通用）
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ManscdpMessage {
    pub cmd_type: String,

    #[serde(rename = "SN", default)]
    pub sn: Option<u64>,

    /// 设备 ID；RecordInfo 中为通道 ID
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,

    /// Keepalive 状态（OK / ERROR）
    #[serde(default)]
    pub status: String,

    /// 分包上报时的总条数
    #[serde(default)]
    pub sum_num: Option<usize>,

    /// Catalog 通道列表
    #[serde(default)]
    pub device_list: Option<ItemList<CatalogItem>>,

    /// RecordInfo 录像列表
    #[serde(default)]
    pub record_list: Option<ItemList<RecordItem>>,

    #[serde(default)]
    pub manufacturer: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub firmware: String,

    #[serde(default)]
    pub device_type: String,
}

impl ManscdpMessage {
    pub fn cmd(&self) -> CmdType {
        CmdType::parse(&self.cmd_type)
    }

    pub fn catalog_items(&self) -> &[CatalogItem] {
        self.device_list
            .as_ref()
            .map(|l| l.items.as_slice())
            .unwrap_or_default()
    }

    pub fn record_items(&self) -> &[RecordItem] {
        self.record_list
            .as_ref()
            .map(|l| l.items.as_slice())
            .unwrap_or_default()
    }
}

/// `<XxxList Num="n"><Item/>...</XxxList>`
#[derive(Debug, Deserialize, PartialEq)]
pub struct ItemList<T> {
    #[serde(rename = "@Num", default)]
    pub num: Option<usize>,

    #[serde(rename = "Item", default)]
    pub items: Vec<T>,
}

/// Catalog 通道项
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogItem {
    /// 通道 ID
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub manufacturer: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub civil_code: String,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub parental: i32,

    #[serde(rename = "ParentID", default)]
    pub parent_id: String,

    #[serde(default)]
    pub safety_way: i32,

    #[serde(default)]
    pub register_way: i32,

    #[serde(default)]
    pub secrecy: i32,

    /// ON / OFF，部分厂商为 ONLINE / OFFLINE
    #[serde(default)]
    pub status: String,
}

/// RecordInfo 录像项
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RecordItem {
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub file_path: String,

    /// `YYYY-MM-DDTHH:MM:SS`，设备本地时间
    #[serde(default)]
    pub start_time: String,

    #[serde(default)]
    pub end_time: String,

    #[serde(default)]
    pub r#type: String,
}

/// 解析 MANSCDP 报文；首次失败时按 GB2312/GBK 转码后重试
pub fn decode(body: &[u8]) -> Result<ManscdpMessage> {
    let first = std::str::from_utf8(body)
        .map_err(|e| e.to_string())
        .and_then(|s| parse_xml(s).map_err(|e| e.to_string()));

    match first {
        Ok(msg) => Ok(msg),
        Err(first_err) => {
            let (text, _, had_errors) = encoding_rs::GBK.decode(body);
            if had_errors {
                tracing::debug!(target: "gb28181::sip", "GBK transcoding replaced invalid sequences");
            }
            parse_xml(&text).map_err(|e| {
                GatewayError::InvalidMessage(format!("{} (utf-8 attempt: {})", e, first_err))
            })
        }
    }
}

fn parse_xml(xml: &str) -> Result<ManscdpMessage> {
    from_str(xml.trim())
        .map_err(|e| GatewayError::InvalidMessage(format!("Failed to parse MANSCDP XML: {}", e)))
}

/// 平台下发的查询报文
#[derive(Debug)]
pub struct Query {
    pub cmd_type: CmdType,
    pub sn: u64,
    pub device_id: String,
    /// RecordInfo 查询时间段，`YYYY-MM-DDTHH:MM:SS`
    pub range: Option<(String, String)>,
}

impl Query {
    pub fn catalog(sn: u64, device_id: impl Into<String>) -> Self {
        Self {
            cmd_type: CmdType::Catalog,
            sn,
            device_id: device_id.into(),
            range: None,
        }
    }

    pub fn device_info(sn: u64, device_id: impl Into<String>) -> Self {
        Self {
            cmd_type: CmdType::DeviceInfo,
            sn,
            device_id: device_id.into(),
            range: None,
        }
    }

    pub fn record_info(
        sn: u64,
        channel_id: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        Self {
            cmd_type: CmdType::RecordInfo,
            sn,
            device_id: channel_id.into(),
            range: Some((start.into(), end.into())),
        }
    }

    /// 生成查询 XML
    pub fn to_xml(&self) -> String {
        let mut xml = format!(
            "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n<Query>\r\n<CmdType>{}</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n",
            self.cmd_type, self.sn, self.device_id
        );
        if let Some((start, end)) = &self.range {
            xml.push_str(&format!(
                "<StartTime>{}</StartTime>\r\n<EndTime>{}</EndTime>\r\n<Type>all</Type>\r\n",
                start, end
            ));
        }
        xml.push_str("</Query>\r\n");
        xml
    }
}
