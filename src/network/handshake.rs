use crate::network::{Message, PeerConnection, TransportError};
use log::debug;
use std::time::Duration;

/// 发起方握手：发送本节点ID，等待对端回复它的ID
///
/// 单轮同步交换，不协商版本或能力。成功时返回对端节点ID。
pub async fn perform_handshake(
    conn: &PeerConnection,
    node_id: &str,
    timeout: Duration,
) -> Result<String, TransportError> {
    conn.send(&Message::handshake(node_id))
        .await
        .map_err(|e| TransportError::HandshakeFailed(format!("failed to send handshake: {}", e)))?;

    let response = conn.receive_timeout(timeout).await.map_err(|e| {
        TransportError::HandshakeFailed(format!("failed to read handshake response: {}", e))
    })?;

    match response {
        Message::Handshake(handshake) => {
            debug!(
                "Handshake successful with node {} at {}",
                handshake.node_id,
                conn.remote_address()
            );
            conn.set_remote_node_id(handshake.node_id.clone());
            Ok(handshake.node_id)
        }
        other => Err(TransportError::HandshakeFailed(format!(
            "expected handshake response, got {}",
            other.kind()
        ))),
    }
}

/// 接受方握手：第一条消息必须是握手，回复本节点ID
pub(crate) async fn accept_handshake(
    conn: &PeerConnection,
    node_id: &str,
    timeout: Duration,
) -> Result<String, TransportError> {
    let request = conn.receive_timeout(timeout).await.map_err(|e| {
        TransportError::HandshakeFailed(format!("failed to read handshake: {}", e))
    })?;

    let remote_id = match request {
        Message::Handshake(handshake) => handshake.node_id,
        other => {
            return Err(TransportError::ProtocolViolation(format!(
                "{} message before handshake",
                other.kind()
            )))
        }
    };

    conn.send(&Message::handshake(node_id))
        .await
        .map_err(|e| TransportError::HandshakeFailed(format!("failed to send handshake: {}", e)))?;

    conn.set_remote_node_id(remote_id.clone());
    Ok(remote_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Direction, NetworkConfig};
    use tokio::io::duplex;

    fn pair() -> (PeerConnection, PeerConnection) {
        let (a, b) = duplex(4096);
        let config = NetworkConfig::default();
        (
            PeerConnection::new(a, "127.0.0.1:7002", Direction::Outbound, &config),
            PeerConnection::new(b, "127.0.0.1:50000", Direction::Inbound, &config),
        )
    }

    #[tokio::test]
    async fn test_identity_exchange() {
        let (dialer, acceptor) = pair();
        let timeout = Duration::from_secs(1);

        let server = tokio::spawn(async move {
            let remote = accept_handshake(&acceptor, "127.0.0.1:7002", timeout).await.unwrap();
            (remote, acceptor)
        });

        let remote = perform_handshake(&dialer, "127.0.0.1:7001", timeout).await.unwrap();
        assert_eq!(remote, "127.0.0.1:7002");
        assert_eq!(dialer.remote_node_id(), Some("127.0.0.1:7002"));

        let (remote, acceptor) = server.await.unwrap();
        assert_eq!(remote, "127.0.0.1:7001");
        assert_eq!(acceptor.remote_node_id(), Some("127.0.0.1:7001"));
    }

    #[tokio::test]
    async fn test_peer_closes_before_reply() {
        let (dialer, acceptor) = pair();

        let server = tokio::spawn(async move {
            let _ = acceptor.receive().await;
            acceptor.close().await;
        });

        let result = perform_handshake(&dialer, "127.0.0.1:7001", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_response_type() {
        let (dialer, acceptor) = pair();

        let server = tokio::spawn(async move {
            let _ = acceptor.receive().await;
            acceptor.send(&Message::query("k")).await.unwrap();
        });

        let result = perform_handshake(&dialer, "127.0.0.1:7001", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_application_message_before_handshake() {
        let (dialer, acceptor) = pair();

        dialer.send(&Message::store("k", b"v".to_vec(), 1)).await.unwrap();
        let result = accept_handshake(&acceptor, "127.0.0.1:7002", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::ProtocolViolation(_))));
    }
}
