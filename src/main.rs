use chunkmesh::dht::DhtNode;
use chunkmesh::network::{TlsConfig, Transport};
use chunkmesh::utils::{self, parse_log_level, setup_logger, Config};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use log::{debug, error, info};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::ctrl_c;
use tokio::task;

/// 统计信息的输出间隔
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// 命令行参数
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[clap(short, long, default_value = "chunkmesh.json")]
    config: PathBuf,

    /// 监听地址
    #[clap(short, long)]
    listen: Option<String>,

    /// 本节点在集群中的地址（host:port）
    #[clap(long)]
    node_addr: Option<String>,

    /// 集群成员地址，可重复
    #[clap(short, long, action = ArgAction::Append)]
    peer: Vec<String>,

    /// 副本数
    #[clap(short, long)]
    replication_factor: Option<usize>,

    /// 本节点证书（PEM）
    #[clap(long)]
    cert: Option<PathBuf>,

    /// 本节点私钥（PEM）
    #[clap(long)]
    key: Option<PathBuf>,

    /// CA证书（PEM）
    #[clap(long)]
    ca: Option<PathBuf>,

    /// 日志级别
    #[clap(long)]
    log_level: Option<String>,

    /// 启用详细日志
    #[clap(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

impl Args {
    /// 命令行参数覆盖配置文件
    fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(node_addr) = self.node_addr {
            config.node_addr = node_addr;
        }
        if !self.peer.is_empty() {
            config.cluster_nodes = self.peer;
        }
        if let Some(replication_factor) = self.replication_factor {
            config.replication_factor = replication_factor;
        }
        if let Some(cert) = self.cert {
            config.cert_path = cert;
        }
        if let Some(key) = self.key {
            config.key_path = key;
        }
        if let Some(ca) = self.ca {
            config.ca_path = ca;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
        if self.verbose {
            config.log_level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    args.apply(&mut config);
    config.validate()?;

    let level = parse_log_level(&config.log_level).map_err(|e| anyhow!(e))?;
    setup_logger(Some(level)).map_err(|e| anyhow!(e))?;

    info!("Starting {} {} as {}", utils::name(), utils::version(), config.node_addr);

    let tls = TlsConfig::from_pem_files(&config.cert_path, &config.key_path, &config.ca_path)
        .context("failed to load TLS material")?;

    let (transport, inbound) = Transport::new(config.network_config(), tls);
    let local_addr = transport.listen().await.context("failed to start listener")?;
    info!("Listening on {}", local_addr);

    let dht = DhtNode::new(transport.clone(), config.dht_config());
    dht.add_node(&config.node_addr).await;
    for node in &config.cluster_nodes {
        dht.add_node(node).await;
    }

    let server = dht.clone();
    let serve_handle = task::spawn(async move {
        server.serve(inbound).await;
    });

    let reporter = dht.clone();
    let stats_handle = task::spawn(async move {
        report_stats(reporter).await;
    });

    match ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    stats_handle.abort();
    transport.close().await?;
    serve_handle.abort();

    info!("ChunkMesh node stopped.");
    Ok(())
}

/// 定期输出集群与本地存储的统计
async fn report_stats(dht: DhtNode) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);

    loop {
        interval.tick().await;

        let entries = dht.entries().await;
        let stored: usize = entries.values().map(|entry| entry.value.len()).sum();
        let peers = dht.transport().peer_addresses().await;

        info!(
            "{} nodes, {} peers connected, {} entries ({})",
            dht.list_nodes().await.len(),
            peers.len(),
            entries.len(),
            utils::format_bytes(stored)
        );

        for address in &peers {
            if let Some(peer) = dht.transport().peer(address).await {
                let stats = peer.stats().await;
                debug!(
                    "  peer {} {:?}: sent {}, received {}, idle {:?}",
                    address,
                    peer.direction(),
                    utils::format_bytes(stats.bytes_sent as usize),
                    utils::format_bytes(stats.bytes_received as usize),
                    stats.idle_duration()
                );
            }
        }
        for (address, hash) in dht.ring().await {
            debug!("  ring {:08x} {}", hash, address);
        }
        if let Some((key, entry)) = entries.iter().max_by_key(|(_, entry)| entry.timestamp) {
            debug!(
                "  latest write {} v{} at {}",
                key,
                entry.version,
                utils::format_timestamp(&entry.timestamp)
            );
        }
    }
}
