use crate::network::{Message, NetworkConfig, TransportError};
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, Instant};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 连接方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 对端主动连入
    Inbound,

    /// 本节点主动拨出
    Outbound,
}

/// 流量统计
#[derive(Debug, Clone)]
pub struct TrafficStats {
    /// 接收的字节数
    pub bytes_received: u64,

    /// 发送的字节数
    pub bytes_sent: u64,

    /// 接收的消息数
    pub messages_received: u64,

    /// 发送的消息数
    pub messages_sent: u64,

    /// 创建时间
    pub created_at: Instant,

    /// 最后活动时间
    pub last_activity: Instant,
}

impl TrafficStats {
    fn new() -> Self {
        let now = Instant::now();

        Self {
            bytes_received: 0,
            bytes_sent: 0,
            messages_received: 0,
            messages_sent: 0,
            created_at: now,
            last_activity: now,
        }
    }

    fn update_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.messages_sent += 1;
        self.last_activity = Instant::now();
    }

    fn update_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.messages_received += 1;
        self.last_activity = Instant::now();
    }

    /// 获取空闲时间
    pub fn idle_duration(&self) -> Duration {
        Instant::now().duration_since(self.last_activity)
    }
}

/// 与远程节点之间的一条已认证的双向字节流
///
/// 每条消息是一行JSON。同一连接上的消息按发送顺序到达。
pub struct PeerConnection {
    /// 远程地址
    remote_address: String,

    /// 连接方向
    direction: Direction,

    /// 握手后得知的对端节点ID
    remote_node_id: OnceLock<String>,

    reader: Mutex<BufReader<BoxedReader>>,

    writer: Mutex<BoxedWriter>,

    /// 保证一次请求/响应交换不被其他调用者打断
    exchange: Mutex<()>,

    closed: AtomicBool,

    stats: RwLock<TrafficStats>,

    io_timeout: Duration,

    max_message_size: usize,
}

impl PeerConnection {
    /// 在已建立（且已完成TLS）的流上创建连接
    pub fn new<S>(
        stream: S,
        remote_address: impl Into<String>,
        direction: Direction,
        config: &NetworkConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);

        Self {
            remote_address: remote_address.into(),
            direction,
            remote_node_id: OnceLock::new(),
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            exchange: Mutex::new(()),
            closed: AtomicBool::new(false),
            stats: RwLock::new(TrafficStats::new()),
            io_timeout: config.io_timeout,
            max_message_size: config.max_message_size,
        }
    }

    /// 发送一条消息
    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let frame = message.encode()?;
        if frame.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge(self.max_message_size));
        }

        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };

        match timeout(self.io_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.mark_closed();
                return Err(e.into());
            }
            Err(_) => {
                self.mark_closed();
                return Err(TransportError::Timeout);
            }
        }
        drop(writer);

        self.stats.write().await.update_sent(frame.len());
        trace!("Sent {} message to {}", message.kind(), self.remote_address);

        Ok(())
    }

    /// 接收一条消息，阻塞直到完整的一帧到达或连接出错/关闭
    pub async fn receive(&self) -> Result<Message, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut reader = self.reader.lock().await;
        let mut frame = Vec::new();
        let limit = self.max_message_size as u64 + 1;

        let read = (&mut *reader).take(limit).read_until(b'\n', &mut frame).await;
        drop(reader);

        let n = match read {
            Ok(n) => n,
            Err(e) => {
                self.mark_closed();
                return Err(e.into());
            }
        };

        if n == 0 {
            self.mark_closed();
            return Err(TransportError::ConnectionClosed);
        }

        if frame.last() != Some(&b'\n') {
            self.mark_closed();
            if frame.len() > self.max_message_size {
                return Err(TransportError::MessageTooLarge(self.max_message_size));
            }
            // 帧未结束时对端关闭
            return Err(TransportError::ConnectionClosed);
        }

        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                self.mark_closed();
                return Err(e);
            }
        };

        self.stats.write().await.update_received(frame.len());
        trace!("Received {} message from {}", message.kind(), self.remote_address);

        Ok(message)
    }

    /// 在限定时间内接收一条消息
    pub async fn receive_timeout(&self, duration: Duration) -> Result<Message, TransportError> {
        match timeout(duration, self.receive()).await {
            Ok(result) => result,
            Err(_) => {
                // 读到一半的帧无法恢复
                self.mark_closed();
                Err(TransportError::Timeout)
            }
        }
    }

    /// 发送请求并等待对端的响应
    pub async fn request(&self, message: &Message) -> Result<Message, TransportError> {
        let _exchange = self.exchange.lock().await;

        self.send(message).await?;
        self.receive_timeout(self.io_timeout).await
    }

    /// 关闭连接
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut writer = self.writer.lock().await;
        if let Ok(Err(e)) = timeout(self.io_timeout, writer.shutdown()).await {
            debug!("Shutdown of connection to {} failed: {}", self.remote_address, e);
        }

        debug!("Closed {:?} connection to {}", self.direction, self.remote_address);
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// 连接是否已关闭（显式关闭或出现I/O错误）
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 获取远程地址
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// 获取连接方向
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// 获取对端节点ID（握手完成后可用）
    pub fn remote_node_id(&self) -> Option<&str> {
        self.remote_node_id.get().map(String::as_str)
    }

    pub(crate) fn set_remote_node_id(&self, node_id: String) {
        let _ = self.remote_node_id.set(node_id);
    }

    /// 获取连接统计信息
    pub async fn stats(&self) -> TrafficStats {
        self.stats.read().await.clone()
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("remote_address", &self.remote_address)
            .field("direction", &self.direction)
            .field("remote_node_id", &self.remote_node_id.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}
