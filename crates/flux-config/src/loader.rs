use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

use crate::GatewayConfig;

/// 网关配置文件名
pub const GATEWAY_CONFIG_FILE: &str = "gb28181.toml";

/// 环境变量前缀，例如 `GB28181__SIP__UDP=0.0.0.0:15060`
pub const ENV_PREFIX: &str = "GB28181";

/// 配置加载器
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    /// 加载网关配置：文件不存在时使用默认值，环境变量覆盖文件
    pub fn load_gateway(&self) -> Result<GatewayConfig> {
        let config_path = self.config_dir.join(GATEWAY_CONFIG_FILE);

        let config = Config::builder()
            .add_source(
                File::new(
                    config_path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
                    FileFormat::Toml,
                )
                .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let gateway: GatewayConfig = config.try_deserialize()?;
        Self::validate(&gateway)?;
        Ok(gateway)
    }

    /// 默认配置的 TOML 文本
    pub fn render_default() -> Result<String> {
        Ok(toml::to_string_pretty(&GatewayConfig::default())?)
    }

    /// 验证配置
    pub fn validate(config: &GatewayConfig) -> Result<()> {
        if config.gb28181.region.len() < 8 {
            return Err(anyhow!(
                "gb28181.region ({}) must have at least 8 digits",
                config.gb28181.region
            ));
        }

        if config.record.recordmax == 0 || config.record.recordmax < -1 {
            return Err(anyhow!(
                "record.recordmax must be positive or -1, got {}",
                config.record.recordmax
            ));
        }

        if config.sip.response_timeout_secs == 0 {
            return Err(anyhow!("sip.response_timeout_secs must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_default_gateway_config() {
        let temp_dir = tempdir().unwrap();
        let loader = ConfigLoader::new(temp_dir.path());

        let config = loader.load_gateway().unwrap();
        assert_eq!(config.sip.udp, "0.0.0.0:5060");
        assert_eq!(config.record.expire, 7);
    }

    #[test]
    fn test_load_gateway_config_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_content = r#"
[sip]
udp = "0.0.0.0:15060"
host = "192.168.1.10"

[media]
restful = "http://10.0.0.2:8080"
secret = "035c73f7-bb6b-4889-a715-d9eb2d1925cc"

[record]
filepath = "/var/zlm/www"
recordmax = -1

[gb28181]
region = "4401020049"
lid = "44010200492000000001"

[notify]
devices_active = "http://127.0.0.1:9000/hook"
"#;

        fs::write(temp_dir.path().join(GATEWAY_CONFIG_FILE), config_content).unwrap();

        let loader = ConfigLoader::new(temp_dir.path());
        let config = loader.load_gateway().unwrap();

        assert_eq!(config.sip.udp, "0.0.0.0:15060");
        assert_eq!(config.sip.host, "192.168.1.10");
        assert_eq!(config.sip.response_timeout_secs, 10);
        assert_eq!(config.media.restful, "http://10.0.0.2:8080");
        assert_eq!(config.record.recordmax, -1);
        assert_eq!(config.gb28181.lid, "44010200492000000001");
        assert!(config.notify_urls().contains_key("devices.active"));
    }

    #[test]
    fn test_rejects_short_region() {
        let temp_dir = tempdir().unwrap();
        fs::write(
            temp_dir.path().join(GATEWAY_CONFIG_FILE),
            "[gb28181]\nregion = \"3402\"\n",
        )
        .unwrap();

        let loader = ConfigLoader::new(temp_dir.path());
        assert!(loader.load_gateway().is_err());
    }

    #[test]
    fn test_render_default_parses_back() {
        let rendered = ConfigLoader::render_default().unwrap();
        let parsed: GatewayConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.api.bind, "0.0.0.0:8090");
        assert_eq!(parsed.schedule.expiry_interval_secs, 300);
    }
}
