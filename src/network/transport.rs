use crate::network::handshake::{accept_handshake, perform_handshake};
use crate::network::{
    Direction, Message, NetworkConfig, PeerConnection, QueryRequest, StoreRequest, TlsConfig,
    TransportError,
};
use log::{debug, info, warn};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::timeout;

/// 接受错误后的退避时间，避免文件描述符耗尽时空转
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// 入站连接上允许的应用请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// 存储副本
    Store(StoreRequest),

    /// 查询键
    Query(QueryRequest),
}

/// 转交给请求处理方的入站请求
#[derive(Debug)]
pub struct InboundRequest {
    /// 发送方节点ID（握手得到）
    pub from: String,

    /// 请求内容
    pub request: Request,

    /// 回复通道，回复消息会写回同一连接
    pub reply: oneshot::Sender<Message>,
}

/// 本节点的传输层
///
/// 持有监听套接字与所有对等连接的注册表。注册表以远程地址为键，
/// 每个地址最多一条连接，后注册的覆盖先注册的。
#[derive(Clone)]
pub struct Transport {
    /// 配置
    config: Arc<NetworkConfig>,

    /// TLS能力
    tls: TlsConfig,

    /// 对等连接注册表
    peers: Arc<RwLock<HashMap<String, Arc<PeerConnection>>>>,

    /// 入站请求通道
    inbound_tx: mpsc::Sender<InboundRequest>,

    /// 实际监听地址
    local_addr: Arc<RwLock<Option<SocketAddr>>>,

    /// 关闭信号
    shutdown: Arc<watch::Sender<bool>>,
}

impl Transport {
    /// 创建传输层，返回入站请求的接收端
    pub fn new(config: NetworkConfig, tls: TlsConfig) -> (Self, mpsc::Receiver<InboundRequest>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(1000);
        let (shutdown, _) = watch::channel(false);

        let transport = Self {
            config: Arc::new(config),
            tls,
            peers: Arc::new(RwLock::new(HashMap::new())),
            inbound_tx,
            local_addr: Arc::new(RwLock::new(None)),
            shutdown: Arc::new(shutdown),
        };

        (transport, inbound_rx)
    }

    /// 本节点ID
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// 获取实际监听地址
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// 绑定监听地址并在后台运行接受循环，返回实际绑定的地址
    pub async fn listen(&self) -> Result<SocketAddr, TransportError> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;

        let transport = self.clone();
        tokio::spawn(async move {
            transport.accept_loop(listener).await;
        });

        Ok(addr)
    }

    /// 绑定监听地址并在当前任务中持续接受连接，直到传输层关闭
    ///
    /// 绑定失败直接返回错误；单次接受失败只记录日志。
    pub async fn listen_and_accept(&self) -> Result<(), TransportError> {
        let listener = self.bind().await?;
        self.accept_loop(listener).await;
        Ok(())
    }

    async fn bind(&self) -> Result<TcpListener, TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::Closed);
        }

        let listener = TcpListener::bind(self.config.listen_addr.as_str()).await?;
        let addr = listener.local_addr()?;

        *self.local_addr.write().await = Some(addr);
        info!("Listening on {} as node {}", addr, self.config.node_id);

        Ok(listener)
    }

    async fn accept_loop(&self, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let transport = self.clone();
                        tokio::spawn(async move {
                            transport.handle_inbound(stream, remote).await;
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("Node {} stopped accepting connections", self.config.node_id);
    }

    /// 处理一条入站连接：TLS、握手、注册，然后进入接收循环
    async fn handle_inbound(&self, stream: TcpStream, remote: SocketAddr) {
        let remote_address = remote.to_string();

        let tls_stream =
            match timeout(self.config.connect_timeout, self.tls.acceptor().accept(stream)).await {
                Ok(Ok(tls_stream)) => tls_stream,
                Ok(Err(e)) => {
                    warn!("TLS accept from {} failed: {}", remote_address, e);
                    return;
                }
                Err(_) => {
                    warn!("TLS accept from {} timed out", remote_address);
                    return;
                }
            };

        let peer = Arc::new(PeerConnection::new(
            tls_stream,
            remote_address.clone(),
            Direction::Inbound,
            &self.config,
        ));

        let remote_id =
            match accept_handshake(&peer, &self.config.node_id, self.config.connect_timeout).await {
                Ok(remote_id) => remote_id,
                Err(e) => {
                    warn!("Inbound handshake from {} failed: {}", remote_address, e);
                    peer.close().await;
                    return;
                }
            };

        info!("Accepted connection from node {} ({})", remote_id, remote_address);
        self.register(remote_address.clone(), peer.clone()).await;

        self.receive_loop(&peer, &remote_id).await;

        self.unregister(&remote_address, &peer).await;
        peer.close().await;
    }

    /// 入站连接的接收循环，直到出错、对端关闭或传输层关闭
    async fn receive_loop(&self, peer: &PeerConnection, remote_id: &str) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                received = peer.receive() => received,
                _ = shutdown.changed() => break,
            };

            let request = match received {
                Ok(Message::Store(store)) => Request::Store(store),
                Ok(Message::Query(query)) => Request::Query(query),
                Ok(other @ (Message::Handshake(_) | Message::QueryResponse(_) | Message::Ack(_))) => {
                    warn!(
                        "Protocol violation from node {}: unexpected {} message",
                        remote_id,
                        other.kind()
                    );
                    break;
                }
                Err(TransportError::ConnectionClosed) => {
                    debug!("Connection from node {} closed", remote_id);
                    break;
                }
                Err(e) => {
                    warn!("Error receiving from node {}: {}", remote_id, e);
                    break;
                }
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            let inbound = InboundRequest {
                from: remote_id.to_string(),
                request,
                reply: reply_tx,
            };

            if self.inbound_tx.send(inbound).await.is_err() {
                warn!("No request handler running, dropping connection from {}", remote_id);
                break;
            }

            let reply = match reply_rx.await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!("Request from node {} dropped without a reply", remote_id);
                    break;
                }
            };

            if let Err(e) = peer.send(&reply).await {
                warn!("Failed to reply to node {}: {}", remote_id, e);
                break;
            }
        }
    }

    /// 拨号：建立TLS连接并完成握手，成功后注册并返回连接
    ///
    /// 整个过程受 `connect_timeout` 限制；任何失败都会关闭套接字且不注册连接。
    pub async fn dial(&self, address: &str) -> Result<Arc<PeerConnection>, TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::Closed);
        }
        debug!("Attempting to dial {}", address);

        let peer = match timeout(self.config.connect_timeout, self.establish(address)).await {
            Ok(Ok(peer)) => Arc::new(peer),
            Ok(Err(e)) => {
                warn!("Dial to {} failed: {}", address, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Dial to {} timed out", address);
                return Err(TransportError::Timeout);
            }
        };

        self.register(address.to_string(), peer.clone()).await;
        info!("Connected successfully to {}", address);

        Ok(peer)
    }

    async fn establish(&self, address: &str) -> Result<PeerConnection, TransportError> {
        let server_name = server_name_for(address)?;

        let tcp = TcpStream::connect(address).await?;
        let tls_stream = self
            .tls
            .connector()
            .connect(server_name, tcp)
            .await
            .map_err(tls_connect_error)?;

        let peer = PeerConnection::new(tls_stream, address, Direction::Outbound, &self.config);

        if let Err(e) =
            perform_handshake(&peer, &self.config.node_id, self.config.connect_timeout).await
        {
            peer.close().await;
            return Err(e);
        }

        Ok(peer)
    }

    /// 复用已有的出站连接，没有则拨号
    pub async fn connect(&self, address: &str) -> Result<Arc<PeerConnection>, TransportError> {
        if let Some(peer) = self.peers.read().await.get(address) {
            if peer.direction() == Direction::Outbound && !peer.is_closed() {
                return Ok(peer.clone());
            }
        }

        self.dial(address).await
    }

    /// 向指定地址发送请求并等待响应
    ///
    /// 连接因此失效时将其从注册表移除，下次调用会重新拨号。
    pub async fn request(&self, address: &str, message: &Message) -> Result<Message, TransportError> {
        let peer = self.connect(address).await?;

        let result = peer.request(message).await;
        if result.is_err() && peer.is_closed() {
            self.unregister(address, &peer).await;
        }

        result
    }

    /// 向所有已注册的连接发送消息
    ///
    /// 出站连接上等待对端的响应，保持请求/响应一一对应；入站连接的对端
    /// 只读取自己请求的响应，因此跳过。遇到第一个错误即返回，不再尝试其余连接。
    pub async fn broadcast(&self, message: &Message) -> Result<(), TransportError> {
        let peers: Vec<(String, Arc<PeerConnection>)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(address, peer)| (address.clone(), peer.clone()))
            .collect();

        for (address, peer) in peers {
            if peer.direction() == Direction::Inbound {
                debug!("Broadcast skips inbound connection from {}", address);
                continue;
            }

            match peer.request(message).await {
                Ok(reply) => debug!("Broadcast {} to {}: {}", message.kind(), address, reply.kind()),
                Err(e) => {
                    warn!("Broadcast to {} failed: {}", address, e);
                    self.unregister(&address, &peer).await;
                    peer.close().await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// 断开并移除与指定地址的连接
    pub async fn disconnect(&self, address: &str) -> bool {
        let peer = self.peers.write().await.remove(address);

        match peer {
            Some(peer) => {
                peer.close().await;
                true
            }
            None => false,
        }
    }

    /// 关闭所有连接和监听套接字
    pub async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.send_replace(true);

        let peers: Vec<Arc<PeerConnection>> =
            self.peers.write().await.drain().map(|(_, peer)| peer).collect();
        for peer in &peers {
            peer.close().await;
        }

        *self.local_addr.write().await = None;
        info!("Transport for node {} closed ({} connections)", self.config.node_id, peers.len());

        Ok(())
    }

    /// 获取已注册的连接
    pub async fn peer(&self, address: &str) -> Option<Arc<PeerConnection>> {
        self.peers.read().await.get(address).cloned()
    }

    /// 获取所有已注册连接的地址
    pub async fn peer_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.peers.read().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// 获取已注册连接的数量
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    async fn register(&self, address: String, peer: Arc<PeerConnection>) {
        let replaced = self.peers.write().await.insert(address.clone(), peer);
        if replaced.is_some() {
            debug!("Replaced registered connection for {}", address);
        }
    }

    async fn unregister(&self, address: &str, peer: &Arc<PeerConnection>) {
        let mut peers = self.peers.write().await;
        if peers.get(address).is_some_and(|current| Arc::ptr_eq(current, peer)) {
            peers.remove(address);
        }
    }
}

/// 由 host:port 地址得到TLS服务器名称
fn server_name_for(address: &str) -> Result<ServerName<'static>, TransportError> {
    let (host, _port) = address
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", address, e)))
}

/// 对端在TLS阶段关闭或重置连接时视为握手失败，其余仍是TLS错误
fn tls_connect_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => {
            TransportError::HandshakeFailed(format!("peer closed the connection during TLS: {}", e))
        }
        _ => TransportError::Tls(e.to_string()),
    }
}
