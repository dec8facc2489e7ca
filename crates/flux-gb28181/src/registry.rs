// 在线设备表
// 记录当前可达设备的来源地址与 SIP 地址，供所有下行请求寻址

use crate::sip::{Destination, NameAddr, SipRequest};
use dashmap::DashMap;

/// 一个在线设备的寻址信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDevice {
    pub device_id: String,
    /// From 头部中的域
    pub region: String,
    /// 报文实际来源（回复和下行请求的目标）
    pub source: Destination,
    /// From 头部地址，下行请求的 To
    pub addr: NameAddr,
    /// Via 中声明的 host / port
    pub host: String,
    pub port: u16,
    pub received: String,
    pub rport: u16,
}

impl ActiveDevice {
    /// 从设备发来的请求中提取寻址信息
    pub fn from_request(req: &SipRequest, source: Destination) -> Option<Self> {
        let from = req.headers.from()?;
        let device_id = from.uri.user.clone().filter(|u| !u.is_empty())?;
        let via = req.headers.via()?;

        let mut addr = from;
        addr.params = Default::default();

        Some(Self {
            device_id,
            region: addr.uri.host.clone(),
            source,
            host: via.host.clone(),
            port: via.port.unwrap_or(5060),
            received: via.received().unwrap_or_default().to_string(),
            rport: via.rport().unwrap_or(0),
            addr,
        })
    }
}

/// 在线设备表
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, ActiveDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册或刷新设备；返回是否为新上线
    pub fn on_register(&self, device: ActiveDevice) -> bool {
        let device_id = device.device_id.clone();
        let is_new = self.devices.insert(device_id.clone(), device).is_none();
        if is_new {
            tracing::info!(target: "gb28181::sip", %device_id, "Device online");
        }
        is_new
    }

    /// 查询在线设备
    pub fn lookup(&self, device_id: &str) -> Option<ActiveDevice> {
        self.devices.get(device_id).map(|d| d.value().clone())
    }

    /// 移出在线表，不删除持久化记录
    pub fn evict(&self, device_id: &str) -> Option<ActiveDevice> {
        let removed = self.devices.remove(device_id).map(|(_, d)| d);
        if removed.is_some() {
            tracing::info!(target: "gb28181::sip", %device_id, "Device evicted");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::{SipMessage, SipRequest};

    fn register_request() -> SipRequest {
        let raw = "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
                   Via: SIP/2.0/UDP 192.168.1.64:5060;rport=40000;received=10.1.1.1;branch=z9hG4bK1\r\n\
                   From: <sip:34020000001110000001@3402000000>;tag=abc\r\n\
                   To: <sip:34020000001110000001@3402000000>\r\n\
                   Call-ID: reg-1\r\n\
                   CSeq: 1 REGISTER\r\n\r\n";
        match SipMessage::parse(raw.as_bytes()).unwrap() {
            SipMessage::Request(req) => req,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_active_device_from_request() {
        let source = Destination::udp("10.1.1.1:40000".parse().unwrap());
        let device = ActiveDevice::from_request(&register_request(), source).unwrap();

        assert_eq!(device.device_id, "34020000001110000001");
        assert_eq!(device.region, "3402000000");
        assert_eq!(device.host, "192.168.1.64");
        assert_eq!(device.rport, 40000);
        assert_eq!(device.received, "10.1.1.1");
        assert!(device.addr.tag().is_none());
    }

    #[test]
    fn test_register_lookup_evict() {
        let registry = DeviceRegistry::new();
        let source = Destination::udp("10.1.1.1:40000".parse().unwrap());
        let device = ActiveDevice::from_request(&register_request(), source).unwrap();

        assert!(registry.on_register(device.clone()));
        assert!(!registry.on_register(device));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("34020000001110000001").is_some());

        assert!(registry.evict("34020000001110000001").is_some());
        assert!(registry.lookup("34020000001110000001").is_none());
        assert!(registry.evict("34020000001110000001").is_none());
    }
}
