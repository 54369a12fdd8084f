use crate::dht::ring;
use crate::dht::storage::{Entry, EntryStore, ReplicaOutcome};
use crate::dht::{DhtConfig, DhtError};
use crate::network::{AckStatus, InboundRequest, Message, QueryResponse, Request, Transport};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// 重试等待的上限
const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(1200);

/// 一次 `put_consistent` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReport {
    /// 键的所有者节点
    pub owner: String,

    /// 本地写入后的版本
    pub version: u64,

    /// 成功确认的副本节点
    pub replicas: Vec<String>,

    /// 推送失败的副本节点
    pub failed: Vec<String>,
}

/// DHT节点
///
/// 持有本地条目表和集群节点列表，通过传输层与其他节点交换副本。
#[derive(Clone)]
pub struct DhtNode {
    /// 本节点地址
    self_addr: String,

    /// 配置
    config: DhtConfig,

    /// 已知的集群节点
    nodes: Arc<RwLock<Vec<String>>>,

    /// 本地条目
    store: EntryStore,

    /// 网络传输层
    transport: Transport,
}

impl DhtNode {
    /// 在传输层之上创建DHT节点，本节点地址取传输层的节点ID
    pub fn new(transport: Transport, config: DhtConfig) -> Self {
        Self {
            self_addr: transport.node_id().to_string(),
            config,
            nodes: Arc::new(RwLock::new(Vec::new())),
            store: EntryStore::new(),
            transport,
        }
    }

    /// 本节点地址
    pub fn node_addr(&self) -> &str {
        &self.self_addr
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// 添加集群节点，已存在时不做任何事
    pub async fn add_node(&self, addr: &str) {
        let mut nodes = self.nodes.write().await;
        if !nodes.iter().any(|node| node == addr) {
            nodes.push(addr.to_string());
            info!("Added node {} ({} nodes)", addr, nodes.len());
        }
    }

    /// 移除集群节点，不存在时不做任何事
    pub async fn remove_node(&self, addr: &str) {
        let mut nodes = self.nodes.write().await;
        let before = nodes.len();
        nodes.retain(|node| node != addr);
        if nodes.len() != before {
            info!("Removed node {} ({} nodes)", addr, nodes.len());
        }
    }

    /// 集群节点列表的快照
    pub async fn list_nodes(&self) -> Vec<String> {
        self.nodes.read().await.clone()
    }

    /// 按环上顺序返回 (地址, 哈希)
    pub async fn ring(&self) -> Vec<(String, u32)> {
        ring::ring_order(&self.list_nodes().await)
    }

    /// 计算键的所有者
    pub async fn owner_of(&self, key: &str) -> Option<String> {
        ring::owner(key, &self.list_nodes().await)
    }

    /// 写入并按环推送副本
    ///
    /// 本地总是保留一份。随后从所有者开始沿环顺时针，跳过本节点，
    /// 向至多 `replication_factor` 个节点推送。单个副本失败只记录日志；
    /// 没有任何已知节点时返回 `NoNodesAvailable` 且不写入本地。
    pub async fn put_consistent(
        &self,
        key: &str,
        value: Vec<u8>,
        replication_factor: usize,
    ) -> Result<PutReport, DhtError> {
        let nodes = self.list_nodes().await;
        let owner = ring::owner(key, &nodes).ok_or(DhtError::NoNodesAvailable)?;

        let version = self.store.put_local(key, value.clone()).await;
        debug!("Stored {} locally (version {}, owner {})", key, version, owner);

        let targets: Vec<String> = ring::successors(key, &nodes)
            .into_iter()
            .filter(|node| *node != self.self_addr)
            .take(replication_factor)
            .collect();

        let mut report = PutReport {
            owner,
            version,
            replicas: Vec::new(),
            failed: Vec::new(),
        };

        for target in targets {
            match self.send_to_node(&target, key, &value, version).await {
                Ok(status) => {
                    debug!("Replica of {} on {}: {:?}", key, target, status);
                    report.replicas.push(target);
                }
                Err(e) => {
                    warn!("Skipping replica {} for {}: {}", target, key, e);
                    report.failed.push(target);
                }
            }
        }

        if report.replicas.is_empty() && !report.failed.is_empty() {
            warn!("No replica reached for {}, only the local copy exists", key);
        }

        Ok(report)
    }

    /// 使用配置中的副本数写入
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<PutReport, DhtError> {
        self.put_consistent(key, value, self.config.replication_factor)
            .await
    }

    /// 读取：本地命中直接返回，否则询问键的所有者
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, DhtError> {
        if let Some(entry) = self.store.get(key).await {
            return Ok(entry.value);
        }

        let owner = match self.owner_of(key).await {
            Some(owner) if owner != self.self_addr => owner,
            _ => return Err(DhtError::KeyNotFound(key.to_string())),
        };

        debug!("{} not held locally, querying owner {}", key, owner);
        self.query_node(&owner, key)
            .await?
            .ok_or_else(|| DhtError::KeyNotFound(key.to_string()))
    }

    /// 删除本地条目，不通知其他副本
    pub async fn remove(&self, key: &str) -> Result<(), DhtError> {
        match self.store.remove(key).await {
            Some(_) => {
                debug!("Removed {} locally", key);
                Ok(())
            }
            None => Err(DhtError::KeyNotFound(key.to_string())),
        }
    }

    /// 向所有已知节点推送，遇到第一个失败即返回
    ///
    /// 推送的版本取本地条目的版本，本地没有该键时为 1。返回实际推送的节点数，
    /// 本节点不计在内。
    pub async fn replicate(&self, key: &str, value: &[u8]) -> Result<usize, DhtError> {
        let nodes = self.list_nodes().await;
        if nodes.is_empty() {
            return Err(DhtError::NoNodesAvailable);
        }

        let version = self.store.get(key).await.map(|entry| entry.version).unwrap_or(1);

        let mut pushed = 0;
        for node in nodes.iter().filter(|node| **node != self.self_addr) {
            self.send_to_node(node, key, value, version).await?;
            pushed += 1;
        }

        info!("Replicated {} to {} nodes", key, pushed);
        Ok(pushed)
    }

    /// 只写本地，不推送副本；返回写入后的版本
    pub async fn store_local(&self, key: &str, value: Vec<u8>) -> u64 {
        self.store.put_local(key, value).await
    }

    /// 本地条目的快照
    pub async fn entries(&self) -> HashMap<String, Entry> {
        self.store.snapshot().await
    }

    /// 处理传输层转来的入站请求，直到通道关闭
    pub async fn serve(&self, mut inbound: mpsc::Receiver<InboundRequest>) {
        while let Some(InboundRequest {
            from,
            request,
            reply,
        }) = inbound.recv().await
        {
            let node = self.clone();
            tokio::spawn(async move {
                let response = node.handle_request(&from, request).await;
                if reply.send(response).is_err() {
                    debug!("Connection from {} went away before the reply", from);
                }
            });
        }

        debug!("Inbound request channel closed");
    }

    /// 应答一个入站请求
    pub async fn handle_request(&self, from: &str, request: Request) -> Message {
        match request {
            Request::Store(store) => {
                // 不带版本的推送按本地写入处理
                if store.version == 0 {
                    let version = self.store.put_local(&store.key, store.value).await;
                    debug!("Stored unversioned {} from {} as version {}", store.key, from, version);
                    return Message::ack(AckStatus::Stored);
                }

                match self
                    .store
                    .apply_replica(&store.key, store.value, store.version)
                    .await
                {
                    ReplicaOutcome::Applied => {
                        debug!("Stored replica {} v{} from {}", store.key, store.version, from);
                        Message::ack(AckStatus::Stored)
                    }
                    ReplicaOutcome::Stale { held } => {
                        debug!(
                            "Ignored stale replica {} v{} from {} (holding v{})",
                            store.key, store.version, from, held
                        );
                        Message::ack(AckStatus::Stale)
                    }
                }
            }
            Request::Query(query) => {
                let value = self.store.get(&query.key).await.map(|entry| entry.value);
                debug!("Query {} from {}: hit={}", query.key, from, value.is_some());
                Message::QueryResponse(QueryResponse { value })
            }
        }
    }

    /// 向一个节点推送副本，传输失败时重试
    ///
    /// 对端的非确认响应视为协议错误，不重试。
    async fn send_to_node(
        &self,
        node: &str,
        key: &str,
        value: &[u8],
        version: u64,
    ) -> Result<AckStatus, DhtError> {
        let message = Message::store(key, value.to_vec(), version);
        let attempts = self.config.max_retries.max(1);
        let mut delay = self.config.retry_backoff;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.transport.request(node, &message).await {
                Ok(Message::Ack(ack)) => return Ok(ack.status),
                Ok(other) => {
                    self.transport.disconnect(node).await;
                    return Err(DhtError::ProtocolViolation(format!(
                        "expected ack from {}, got {}",
                        node,
                        other.kind()
                    )));
                }
                Err(e) => {
                    debug!("Store to {} failed (attempt {}/{}): {}", node, attempt, attempts, e);
                    last_error = Some(e);

                    if attempt < attempts {
                        let jitter = Duration::from_millis(rand::random::<u64>() % 50);
                        tokio::time::sleep(delay + jitter).await;
                        delay = (delay * 2).min(MAX_RETRY_BACKOFF);
                    }
                }
            }
        }

        Err(DhtError::PeerUnreachable {
            node: node.to_string(),
            attempts,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// 询问一个节点是否持有键
    async fn query_node(&self, node: &str, key: &str) -> Result<Option<Vec<u8>>, DhtError> {
        match self.transport.request(node, &Message::query(key)).await? {
            Message::QueryResponse(response) => Ok(response.value),
            other => {
                self.transport.disconnect(node).await;
                Err(DhtError::ProtocolViolation(format!(
                    "expected query response from {}, got {}",
                    node,
                    other.kind()
                )))
            }
        }
    }
}
