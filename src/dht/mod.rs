mod node;
pub mod ring;
mod storage;

pub use node::{DhtNode, PutReport};
pub use storage::{Entry, EntryStore, ReplicaOutcome};

use crate::network::TransportError;
use std::time::Duration;
use thiserror::Error;

/*
 * ChunkMesh 分布式哈希表
 *
 * 节点和键通过一致性哈希放置在同一个环上。写入总是先落在本地，
 * 再沿环顺时针推送给若干副本节点；读取先查本地，未命中时询问键的所有者。
 *
 * 副本推送是尽力而为的：单个副本失败只记录日志，不影响整体结果。
 * 全量复制（replicate）则在第一个失败处返回。
 */

/// DHT错误
#[derive(Error, Debug)]
pub enum DhtError {
    #[error("No nodes available")]
    NoNodesAvailable,

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Peer {node} unreachable after {attempts} attempts: {reason}")]
    PeerUnreachable {
        node: String,
        attempts: usize,
        reason: String,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),
}

impl From<TransportError> for DhtError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Serialization(e) => DhtError::Serialization(e),
            TransportError::ProtocolViolation(message) => DhtError::ProtocolViolation(message),
            other => DhtError::Transport(other),
        }
    }
}

/// DHT配置
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// 默认副本数（不含本地副本）
    pub replication_factor: usize,

    /// 副本推送的最大尝试次数
    pub max_retries: usize,

    /// 第一次重试前的等待时间，之后每次翻倍
    pub retry_backoff: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            replication_factor: 2,
            max_retries: 3,
            retry_backoff: Duration::from_millis(150),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_lifted() {
        let serde_error = serde_json::from_str::<u32>("x").unwrap_err();
        assert!(matches!(
            DhtError::from(TransportError::Serialization(serde_error)),
            DhtError::Serialization(_)
        ));
        assert!(matches!(
            DhtError::from(TransportError::ProtocolViolation("bad".into())),
            DhtError::ProtocolViolation(_)
        ));
        assert!(matches!(
            DhtError::from(TransportError::Timeout),
            DhtError::Transport(TransportError::Timeout)
        ));
    }

    #[test]
    fn test_error_messages() {
        let error = DhtError::PeerUnreachable {
            node: "10.0.0.2:7000".into(),
            attempts: 3,
            reason: "Connection closed".into(),
        };
        assert_eq!(
            error.to_string(),
            "Peer 10.0.0.2:7000 unreachable after 3 attempts: Connection closed"
        );
        assert_eq!(DhtError::KeyNotFound("k".into()).to_string(), "Key not found: k");
    }
}
