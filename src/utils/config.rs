use crate::dht::DhtConfig;
use crate::network::NetworkConfig;
use serde::{Deserialize, Serialize};
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 节点配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 本节点在集群中的地址，同时是节点ID和环上的位置
    pub node_addr: String,

    /// 监听地址
    pub listen_addr: String,

    /// 集群成员地址
    pub cluster_nodes: Vec<String>,

    /// 副本数
    pub replication_factor: usize,

    /// 日志级别
    pub log_level: String,

    /// 本节点证书链（PEM）
    pub cert_path: PathBuf,

    /// 本节点私钥（PEM）
    pub key_path: PathBuf,

    /// 受信任的CA证书（PEM）
    pub ca_path: PathBuf,

    /// 建立连接的超时（毫秒）
    pub connect_timeout_ms: u64,

    /// 单次读写的超时（毫秒）
    pub io_timeout_ms: u64,

    /// 最大消息大小（字节）
    pub max_message_size: usize,

    /// 副本推送的最大尝试次数
    pub max_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_addr: "127.0.0.1:7000".to_string(),
            listen_addr: "0.0.0.0:7000".to_string(),
            cluster_nodes: vec![],
            replication_factor: 2,
            log_level: "info".to_string(),
            cert_path: PathBuf::from("certs/node.crt"),
            key_path: PathBuf::from("certs/node.key"),
            ca_path: PathBuf::from("certs/ca.crt"),
            connect_timeout_ms: 5_000,
            io_timeout_ms: 10_000,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            max_retries: 3,
        }
    }
}

impl Config {
    /// 从文件加载配置，文件不存在时使用默认值
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;

        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    /// 检查配置是否可用
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("node_addr must not be empty".to_string()));
        }
        if !self.node_addr.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "node_addr {} must be host:port",
                self.node_addr
            )));
        }
        if self.replication_factor == 0 {
            return Err(ConfigError::Invalid(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".to_string()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be non-zero".to_string()));
        }

        Ok(())
    }

    /// 传输层配置
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            node_id: self.node_addr.clone(),
            listen_addr: self.listen_addr.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            max_message_size: self.max_message_size,
        }
    }

    /// DHT配置
    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            replication_factor: self.replication_factor,
            max_retries: self.max_retries,
            ..DhtConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("node.json");

        let config = Config {
            node_addr: "10.0.0.1:7000".to_string(),
            cluster_nodes: vec!["10.0.0.2:7000".to_string(), "10.0.0.3:7000".to_string()],
            replication_factor: 3,
            ..Config::default()
        };
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");
        fs::write(&path, r#"{"node_addr": "10.0.0.9:7100"}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.node_addr, "10.0.0.9:7100");
        assert_eq!(config.replication_factor, 2);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let zero_rf = Config {
            replication_factor: 0,
            ..Config::default()
        };
        assert!(matches!(zero_rf.validate(), Err(ConfigError::Invalid(_))));

        let no_addr = Config {
            node_addr: String::new(),
            ..Config::default()
        };
        assert!(no_addr.validate().is_err());

        let zero_timeout = Config {
            io_timeout_ms: 0,
            ..Config::default()
        };
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = Config {
            node_addr: "10.0.0.1:7000".to_string(),
            connect_timeout_ms: 250,
            max_retries: 5,
            ..Config::default()
        };

        let network = config.network_config();
        assert_eq!(network.node_id, "10.0.0.1:7000");
        assert_eq!(network.connect_timeout, Duration::from_millis(250));

        let dht = config.dht_config();
        assert_eq!(dht.max_retries, 5);
        assert_eq!(dht.replication_factor, 2);
    }
}
