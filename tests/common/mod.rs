#![allow(dead_code)]

use chunkmesh::dht::{DhtConfig, DhtNode};
use chunkmesh::network::{NetworkConfig, TlsConfig, Transport};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;

/// 测试用CA，为每个节点签发 localhost/127.0.0.1 证书
pub struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, DnValue::Utf8String(name.to_string()));
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// 签发节点证书，返回 (证书, 私钥)
    pub fn issue(&self, node: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let mut params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, DnValue::Utf8String(node.to_string()));
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        (
            cert.der().clone(),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
    }

    pub fn node_tls(&self, node: &str) -> TlsConfig {
        let (cert, key) = self.issue(node);
        TlsConfig::new(vec![cert], key, vec![self.der()]).unwrap()
    }

    /// 不要求客户端证书的普通TLS服务端配置，用于模拟异常对端
    pub fn plain_server_config(&self, node: &str) -> Arc<ServerConfig> {
        let (cert, key) = self.issue(node);
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
        Arc::new(config)
    }
}

/// 一个正在运行的测试节点
pub struct TestNode {
    pub addr: String,
    pub dht: DhtNode,
    pub transport: Transport,
}

/// 找一个当前空闲的本地端口
pub fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

pub fn network_config(addr: &str) -> NetworkConfig {
    NetworkConfig {
        node_id: addr.to_string(),
        listen_addr: addr.to_string(),
        connect_timeout: Duration::from_secs(2),
        io_timeout: Duration::from_secs(2),
        ..NetworkConfig::default()
    }
}

/// 启动监听并开始处理入站请求的节点
pub async fn start_node(ca: &TestCa, replication_factor: usize) -> TestNode {
    let addr = free_addr();
    let (transport, inbound) = Transport::new(network_config(&addr), ca.node_tls(&addr));
    transport.listen().await.unwrap();

    let dht = DhtNode::new(
        transport.clone(),
        DhtConfig {
            replication_factor,
            retry_backoff: Duration::from_millis(10),
            ..DhtConfig::default()
        },
    );

    let server = dht.clone();
    tokio::spawn(async move {
        server.serve(inbound).await;
    });

    TestNode {
        addr,
        dht,
        transport,
    }
}

/// 让每个节点都认识所有节点（包括自己）
pub async fn join_all(nodes: &[&TestNode]) {
    for node in nodes {
        for other in nodes {
            node.dht.add_node(&other.addr).await;
        }
    }
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
