use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 本节点上一个键的当前状态
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// 存储的数据
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,

    /// 版本号
    pub version: u64,

    /// 最后写入时间
    pub timestamp: DateTime<Utc>,
}

impl Entry {
    /// 创建新的条目
    pub fn new(value: Vec<u8>, version: u64) -> Self {
        Self {
            value,
            version,
            timestamp: Utc::now(),
        }
    }

    /// 更新值
    pub fn update(&mut self, value: Vec<u8>) {
        self.value = value;
        self.timestamp = Utc::now();
        self.version += 1;
    }
}

/// 副本写入的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaOutcome {
    /// 已写入
    Applied,

    /// 本地已有更新的版本，未写入
    Stale {
        /// 本地持有的版本
        held: u64,
    },
}

/// 本地条目表，每个键至多一个条目
#[derive(Clone, Default)]
pub struct EntryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 本地写入，版本号在已有条目的基础上加一；返回写入后的版本
    pub async fn put_local(&self, key: &str, value: Vec<u8>) -> u64 {
        let mut entries = self.entries.write().await;

        match entries.get_mut(key) {
            Some(entry) => {
                entry.update(value);
                entry.version
            }
            None => {
                entries.insert(key.to_string(), Entry::new(value, 1));
                1
            }
        }
    }

    /// 写入来自其他节点的副本
    ///
    /// 版本较旧的副本被忽略；版本相同或更新时覆盖。
    pub async fn apply_replica(&self, key: &str, value: Vec<u8>, version: u64) -> ReplicaOutcome {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(key) {
            if version < existing.version {
                return ReplicaOutcome::Stale {
                    held: existing.version,
                };
            }
        }

        entries.insert(key.to_string(), Entry::new(value, version));
        ReplicaOutcome::Applied
    }

    pub async fn get(&self, key: &str) -> Option<Entry> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &str) -> Option<Entry> {
        self.entries.write().await.remove(key)
    }

    /// 所有条目的快照
    pub async fn snapshot(&self) -> HashMap<String, Entry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
