/*
 * ChunkMesh
 *
 * 分块文件分发服务背后的分布式键值存储:
 *
 * 1. dht     - 一致性哈希环、本地带版本的条目表、副本推送与远程查询
 * 2. network - 双向TLS认证的对等连接、握手协议、按行分帧的消息交换
 * 3. utils   - 配置文件与日志初始化
 */

pub mod dht;
pub mod network;
pub mod utils;
