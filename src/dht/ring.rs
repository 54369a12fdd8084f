//! 一致性哈希环
//!
//! 节点和键都通过同一个32位哈希映射到环上。键的所有者是哈希值
//! 大于等于键哈希的第一个节点，没有时回绕到环上的第一个节点。

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 计算字符串在环上的位置（FNV-1a 32位）
///
/// 结果只依赖输入字节，在不同进程、不同节点上保持一致。
pub fn hash(token: &str) -> u32 {
    token.bytes().fold(FNV_OFFSET_BASIS, |h, byte| {
        (h ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// 按环上顺序排列节点，返回 (地址, 哈希)
///
/// 哈希相同时按地址排序，保证顺序与输入顺序无关。
pub fn ring_order<S: AsRef<str>>(nodes: &[S]) -> Vec<(String, u32)> {
    let mut ring: Vec<(String, u32)> = nodes
        .iter()
        .map(|node| (node.as_ref().to_string(), hash(node.as_ref())))
        .collect();

    ring.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    ring.dedup_by(|a, b| a.0 == b.0);
    ring
}

/// 在已排序的环上找到键所有者的下标
fn owner_index(ring: &[(String, u32)], key: &str) -> Option<usize> {
    if ring.is_empty() {
        return None;
    }

    let key_hash = hash(key);
    let idx = ring.partition_point(|(_, node_hash)| *node_hash < key_hash);

    // 超过最大哈希时回绕
    Some(if idx == ring.len() { 0 } else { idx })
}

/// 计算键的所有者节点，节点集合为空时返回 None
pub fn owner<S: AsRef<str>>(key: &str, nodes: &[S]) -> Option<String> {
    let ring = ring_order(nodes);
    owner_index(&ring, key).map(|idx| ring[idx].0.clone())
}

/// 从所有者开始顺时针遍历环，返回所有节点（所有者在首位）
pub fn successors<S: AsRef<str>>(key: &str, nodes: &[S]) -> Vec<String> {
    let ring = ring_order(nodes);

    match owner_index(&ring, key) {
        Some(start) => ring
            .iter()
            .cycle()
            .skip(start)
            .take(ring.len())
            .map(|(node, _)| node.clone())
            .collect(),
        None => Vec::new(),
    }
}
