mod connection;
mod handshake;
mod protocol;
pub(crate) mod tls;
mod transport;

pub use connection::{Direction, PeerConnection, TrafficStats};
pub use handshake::perform_handshake;
pub use protocol::{
    AckMessage, AckStatus, HandshakeMessage, Message, QueryRequest, QueryResponse, StoreRequest,
};
pub use tls::{TlsConfig, TlsError};
pub use transport::{InboundRequest, Request, Transport};

use std::time::Duration;
use thiserror::Error;

/// 传输层错误
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Message exceeds {0} bytes")]
    MessageTooLarge(usize),

    #[error("Transport is closed")]
    Closed,
}

/// 网络配置
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// 本节点ID，握手时发送给对端
    pub node_id: String,

    /// 本地监听地址
    pub listen_addr: String,

    /// 建立连接（TCP + TLS + 握手）的超时
    pub connect_timeout: Duration,

    /// 单次读写的超时
    pub io_timeout: Duration,

    /// 最大消息大小
    pub max_message_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_id: "127.0.0.1:7000".to_string(),
            listen_addr: "127.0.0.1:7000".to_string(),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}
