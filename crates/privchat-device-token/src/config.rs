//! 设备推送令牌模块配置

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 默认的持久化 key 前缀，实际 key 为 `device_token{token_type}`
pub const DEFAULT_DATABASE_KEY_PREFIX: &str = "device_token";

/// 单次注册允许附带的其他账号数量上限
pub const DEFAULT_MAX_OTHER_USER_IDS: usize = 100;

/// 设备令牌管理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTokenConfig {
    /// 数据存储目录（sled KV 位于 `{data_dir}/kv`）
    pub data_dir: PathBuf,
    /// 持久化 key 前缀
    pub database_key_prefix: String,
    /// other_user_ids 数量上限
    pub max_other_user_ids: usize,
}

impl Default for DeviceTokenConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_key_prefix: DEFAULT_DATABASE_KEY_PREFIX.to_string(),
            max_other_user_ids: DEFAULT_MAX_OTHER_USER_IDS,
        }
    }
}

impl DeviceTokenConfig {
    pub fn builder() -> DeviceTokenConfigBuilder {
        DeviceTokenConfigBuilder::new()
    }
}

pub struct DeviceTokenConfigBuilder {
    config: DeviceTokenConfig,
}

impl DeviceTokenConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DeviceTokenConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// 设置持久化 key 前缀
    ///
    /// 注意：修改前缀后旧数据将无法读取，仅用于测试或全新安装
    pub fn database_key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.database_key_prefix = prefix.into();
        self
    }

    pub fn max_other_user_ids(mut self, max: usize) -> Self {
        self.config.max_other_user_ids = max;
        self
    }

    pub fn build(self) -> DeviceTokenConfig {
        self.config
    }
}

impl Default for DeviceTokenConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
