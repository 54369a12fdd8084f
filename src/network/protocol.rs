use crate::network::TransportError;
use serde::{Deserialize, Serialize};

/// 握手消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// 节点ID（节点的host:port地址）
    pub node_id: String,
}

/// 存储请求 - 副本推送
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRequest {
    /// 键
    pub key: String,

    /// 值
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,

    /// 写入方的条目版本，旧版本的对端不会发送此字段
    #[serde(default)]
    pub version: u64,
}

/// 查询请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// 键
    pub key: String,
}

/// 查询响应，`value` 为空表示对端没有该键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default, with = "hex_option")]
    pub value: Option<Vec<u8>>,
}

/// 确认状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// 已写入
    #[default]
    Stored,

    /// 对端持有更新的版本，本次写入被忽略
    Stale,
}

/// 确认消息
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AckMessage {
    #[serde(default)]
    pub status: AckStatus,
}

/// 对等连接上交换的消息
///
/// 线上格式为每行一个JSON对象: `{"type": "...", "payload": {...}}`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    /// 握手请求/响应
    Handshake(HandshakeMessage),

    /// 存储键值对
    ///
    /// 也接受旧的类型名 `dht_store`，但别名只覆盖类型名，`value` 仍须是十六进制。
    #[serde(alias = "dht_store")]
    Store(StoreRequest),

    /// 查询键
    #[serde(alias = "dht_query")]
    Query(QueryRequest),

    /// 查询结果
    QueryResponse(QueryResponse),

    /// 确认
    Ack(AckMessage),
}

impl Message {
    /// 创建握手消息
    pub fn handshake(node_id: impl Into<String>) -> Self {
        Message::Handshake(HandshakeMessage { node_id: node_id.into() })
    }

    /// 创建存储消息
    pub fn store(key: impl Into<String>, value: Vec<u8>, version: u64) -> Self {
        Message::Store(StoreRequest {
            key: key.into(),
            value,
            version,
        })
    }

    /// 创建查询消息
    pub fn query(key: impl Into<String>) -> Self {
        Message::Query(QueryRequest { key: key.into() })
    }

    /// 创建确认消息
    pub fn ack(status: AckStatus) -> Self {
        Message::Ack(AckMessage { status })
    }

    /// 消息类型名称，与线上的 `type` 字段一致
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::Store(_) => "store",
            Message::Query(_) => "query",
            Message::QueryResponse(_) => "query_response",
            Message::Ack(_) => "ack",
        }
    }

    /// 编码为一帧（JSON + 换行符）
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// 从一帧解码，容忍末尾的换行符
    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        let trimmed = match frame {
            [rest @ .., b'\r', b'\n'] => rest,
            [rest @ .., b'\n'] => rest,
            other => other,
        };
        Ok(serde_json::from_slice(trimmed)?)
    }
}

mod hex_option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| hex::decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
