mod common;

use chunkmesh::network::{
    AckStatus, Direction, Message, Request, StoreRequest, Transport, TransportError,
};
use common::{init_logger, network_config, free_addr, TestCa};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// 对端完成TLS、读到握手后不回复直接断开
#[tokio::test]
async fn test_handshake_failure_registers_nothing() {
    init_logger();
    let ca = TestCa::new("transport-ca");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();
    let acceptor = TlsAcceptor::from(ca.plain_server_config("silent"));

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = BufReader::new(acceptor.accept(stream).await.unwrap());
        let mut line = String::new();
        tls.read_line(&mut line).await.unwrap();
        assert!(line.contains("\"handshake\""));
        tls.get_mut().shutdown().await.ok();
    });

    let client_addr = free_addr();
    let (client, _inbound) = Transport::new(network_config(&client_addr), ca.node_tls("client"));

    let result = client.dial(&server_addr).await;
    assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
    assert!(client.peer(&server_addr).await.is_none());
    assert!(client.peer_addresses().await.is_empty());

    server.await.unwrap();
}

/// 对端接受TCP后立即断开，TLS尚未完成也算握手失败
#[tokio::test]
async fn test_peer_closing_before_tls_fails_handshake() {
    init_logger();
    let ca = TestCa::new("transport-ca");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let (client, _inbound) = Transport::new(network_config(&free_addr()), ca.node_tls("client"));

    let result = client.dial(&server_addr).await;
    assert!(
        matches!(result, Err(TransportError::HandshakeFailed(_))),
        "Expected HandshakeFailed, got {:?}",
        result.err()
    );
    assert!(client.peer_addresses().await.is_empty());

    server.await.unwrap();
}

/// 对端接受TCP后一直不说话，拨号应在超时内放弃
#[tokio::test]
async fn test_dial_to_silent_peer_times_out() {
    init_logger();
    let ca = TestCa::new("transport-ca");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(stream);
    });

    let mut config = network_config(&free_addr());
    config.connect_timeout = Duration::from_millis(300);
    let (client, _inbound) = Transport::new(config, ca.node_tls("client"));

    let started = tokio::time::Instant::now();
    let result = client.dial(&server_addr).await;
    assert!(matches!(result, Err(TransportError::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(client.peer_addresses().await.is_empty());

    server.abort();
}

/// 入站连接上第一条消息不是握手时，连接被关闭且不登记
#[tokio::test]
async fn test_inbound_must_handshake_first() {
    init_logger();
    let ca = TestCa::new("transport-ca");

    let server_addr = free_addr();
    let (server, _inbound) = Transport::new(network_config(&server_addr), ca.node_tls("server"));
    server.listen().await.unwrap();

    let client_config = {
        let (cert, key) = ca.issue("rogue");
        let provider = std::sync::Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = rustls::RootCertStore::empty();
        roots.add(ca.der()).unwrap();
        rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_client_auth_cert(vec![cert], key)
            .unwrap()
    };
    let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(client_config));
    let tcp = tokio::net::TcpStream::connect(&server_addr).await.unwrap();
    let name = rustls::pki_types::ServerName::try_from("127.0.0.1").unwrap();
    let mut tls = BufReader::new(connector.connect(name, tcp).await.unwrap());

    tls.get_mut()
        .write_all(&Message::query("k").encode().unwrap())
        .await
        .unwrap();

    // 服务端不回复，直接关闭
    let mut line = String::new();
    let read = tls.read_line(&mut line).await;
    assert!(matches!(read, Ok(0)) || read.is_err());
    assert!(server.peer_addresses().await.is_empty());
}

/// 完整的双向通道：请求经入站通道交给处理方，回复写回原连接
#[tokio::test]
async fn test_inbound_requests_are_forwarded() {
    init_logger();
    let ca = TestCa::new("transport-ca");

    let server_addr = free_addr();
    let (server, mut inbound) = Transport::new(network_config(&server_addr), ca.node_tls("server"));
    server.listen().await.unwrap();

    let client_addr = free_addr();
    let (client, _client_inbound) = Transport::new(network_config(&client_addr), ca.node_tls("client"));

    let handler = tokio::spawn(async move {
        let request = inbound.recv().await.unwrap();
        assert_eq!(request.from, client_addr);
        assert_eq!(
            request.request,
            Request::Store(StoreRequest {
                key: "k".to_string(),
                value: b"v".to_vec(),
                version: 4,
            })
        );
        request.reply.send(Message::ack(AckStatus::Stored)).unwrap();
    });

    let reply = client
        .request(&server_addr, &Message::store("k", b"v".to_vec(), 4))
        .await
        .unwrap();
    assert_eq!(reply, Message::ack(AckStatus::Stored));
    handler.await.unwrap();

    let peer = client.peer(&server_addr).await.unwrap();
    assert_eq!(peer.direction(), Direction::Outbound);
    assert_eq!(peer.remote_node_id(), Some(server_addr.as_str()));
    assert_eq!(peer.stats().await.messages_sent, 2);

    assert!(client.disconnect(&server_addr).await);
    assert!(!client.disconnect(&server_addr).await);
    assert!(peer.is_closed());
}

/// `listen_and_accept` 在关闭后返回
#[tokio::test]
async fn test_listen_and_accept_returns_after_close() {
    init_logger();
    let ca = TestCa::new("transport-ca");

    let addr = free_addr();
    let (transport, _inbound) = Transport::new(network_config(&addr), ca.node_tls("server"));

    let runner = transport.clone();
    let handle = tokio::spawn(async move { runner.listen_and_accept().await });

    for _ in 0..100 {
        if transport.local_addr().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(transport.local_addr().await.is_some());

    transport.close().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_bind_failure_is_returned() {
    init_logger();
    let ca = TestCa::new("transport-ca");

    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap().to_string();
    let (transport, _inbound) = Transport::new(network_config(&addr), ca.node_tls("server"));

    assert!(matches!(transport.listen().await, Err(TransportError::Io(_))));
    assert!(matches!(transport.listen_and_accept().await, Err(TransportError::Io(_))));
}
