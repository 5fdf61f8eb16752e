//! 令牌持久化存储
//!
//! - `TokenStore`：对账引擎依赖的 KV 接口（get / set / erase / force_sync）
//! - `SledTokenStore`：基于 sled 的实现，值按原始字节存储

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::DeviceTokenConfig;
use crate::error::{DeviceTokenError, Result};

/// sled 中存放设备令牌的 Tree
const DEVICE_TOKEN_TREE: &str = "device_tokens";

/// 对账引擎使用的 KV 存储
///
/// `set` / `erase` 可以只写入内存，`force_sync` 完成即表示之前的写入已经落盘。
#[async_trait]
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    fn erase(&self, key: &str) -> Result<()>;

    /// 等待之前的所有写入落盘
    async fn force_sync(&self) -> Result<()>;
}

/// 基于 sled 的令牌存储
#[derive(Debug, Clone)]
pub struct SledTokenStore {
    db: Arc<Db>,
    tree: Tree,
}

impl SledTokenStore {
    /// 在 `{base_path}/kv` 下打开存储
    pub async fn open(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| DeviceTokenError::KvStore(format!("创建 KV 存储目录失败: {}", e)))?;

        // 切换账号后旧实例可能刚释放锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => return Self::from_db(Arc::new(db)),
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if !is_lock || attempt + 1 >= MAX_OPEN_RETRIES {
                        break;
                    }
                    let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                    debug!("sled 数据库被占用，{}ms 后重试 (attempt {})", delay_ms, attempt + 1);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }

        Err(DeviceTokenError::KvStore(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    pub async fn open_with_config(config: &DeviceTokenConfig) -> Result<Self> {
        Self::open(&config.data_dir).await
    }

    /// 复用已经打开的 sled 数据库
    pub fn from_db(db: Arc<Db>) -> Result<Self> {
        let tree = db
            .open_tree(DEVICE_TOKEN_TREE)
            .map_err(|e| DeviceTokenError::KvStore(format!("打开设备令牌 Tree 失败: {}", e)))?;
        info!("设备令牌 KV Tree 初始化完成");
        Ok(Self { db, tree })
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }
}

#[async_trait]
impl TokenStore for SledTokenStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .tree
            .get(key)
            .map_err(|e| DeviceTokenError::KvStore(format!("获取键值对失败: {}", e)))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.tree
            .insert(key, value)
            .map_err(|e| DeviceTokenError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    fn erase(&self, key: &str) -> Result<()> {
        self.tree
            .remove(key)
            .map_err(|e| DeviceTokenError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(())
    }

    async fn force_sync(&self) -> Result<()> {
        self.tree
            .flush_async()
            .await
            .map_err(|e| DeviceTokenError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}


#[cfg(test)]
pub use test_helpers::MemoryTokenStore;
