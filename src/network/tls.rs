use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("No certificate in chain")]
    EmptyChain,

    #[error("No trusted CA certificate")]
    EmptyTrustStore,

    #[error("Invalid CA certificate: {0}")]
    InvalidCa(String),

    #[error("Invalid TLS configuration: {0}")]
    Config(String),

    #[error("PEM error: {0}")]
    Pem(String),
}

/// 双向TLS认证能力
///
/// 服务端要求并验证客户端证书，客户端用同一个CA集合验证服务端，
/// 并出示自己的证书。对调用方而言是不透明的。
#[derive(Clone)]
pub struct TlsConfig {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
}

impl TlsConfig {
    /// 由本节点证书链、私钥和受信任CA证书创建
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        ca_certs: Vec<CertificateDer<'static>>,
    ) -> Result<Self, TlsError> {
        if cert_chain.is_empty() {
            return Err(TlsError::EmptyChain);
        }
        if ca_certs.is_empty() {
            return Err(TlsError::EmptyTrustStore);
        }

        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| TlsError::InvalidCa(e.to_string()))?;
        }
        let roots = Arc::new(roots);
        let provider: Arc<CryptoProvider> = Arc::new(default_provider());

        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
                .build()
                .map_err(|e| TlsError::Config(e.to_string()))?;

        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(cert_chain.clone(), key.clone_key())
            .map_err(|e| TlsError::Config(e.to_string()))?;

        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_root_certificates(roots)
            .with_client_auth_cert(cert_chain, key)
            .map_err(|e| TlsError::Config(e.to_string()))?;

        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }

    /// 从PEM文件加载证书、私钥和CA
    pub fn from_pem_files(cert_path: &Path, key_path: &Path, ca_path: &Path) -> Result<Self, TlsError> {
        let cert_chain = CertificateDer::pem_file_iter(cert_path)
            .map_err(|e| TlsError::Pem(format!("{}: {}", cert_path.display(), e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::Pem(format!("{}: {}", cert_path.display(), e)))?;

        let key = PrivateKeyDer::from_pem_file(key_path)
            .map_err(|e| TlsError::Pem(format!("{}: {}", key_path.display(), e)))?;

        let ca_certs = CertificateDer::pem_file_iter(ca_path)
            .map_err(|e| TlsError::Pem(format!("{}: {}", ca_path.display(), e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::Pem(format!("{}: {}", ca_path.display(), e)))?;

        Self::new(cert_chain, key, ca_certs)
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server.clone())
    }

    pub(crate) fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client.clone())
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlsConfig { .. }")
    }
}
