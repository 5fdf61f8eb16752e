//! 单个推送通道的令牌记录

use serde::{Deserialize, Serialize};
use std::fmt;

/// 令牌同步状态
///
/// `PendingRegister` / `PendingUnregister` 表示本地意图尚未同步到服务器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TokenState {
    #[default]
    Synced,
    PendingUnregister,
    PendingRegister,
}

/// 持久化的令牌记录
///
/// `encryption_key` 非空当且仅当 `encrypt == true`
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TokenInfo {
    pub state: TokenState,
    pub token: String,
    pub other_user_ids: Vec<i32>,
    pub is_app_sandbox: bool,
    pub encrypt: bool,
    pub encryption_key: Vec<u8>,
    pub encryption_key_id: i64,
}

impl TokenInfo {
    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }

    /// 重置为空记录
    pub fn reset(&mut self) {
        *self = TokenInfo::default();
    }
}

// 密钥字节不能出现在日志中
impl fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenInfo")
            .field("state", &self.state)
            .field("token", &self.token)
            .field("other_user_ids", &self.other_user_ids)
            .field("is_app_sandbox", &self.is_app_sandbox)
            .field("encrypt", &self.encrypt)
            .field("encryption_key", &format!("<{} bytes>", self.encryption_key.len()))
            .field("encryption_key_id", &self.encryption_key_id)
            .finish()
    }
}

impl fmt::Display for TokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            TokenState::Synced => write!(f, "Synchronized")?,
            TokenState::PendingUnregister => write!(f, "Unregister")?,
            TokenState::PendingRegister => write!(f, "Register")?,
        }
        write!(f, " token {:?}", self.token)?;
        if !self.other_user_ids.is_empty() {
            write!(f, ", with other users {:?}", self.other_user_ids)?;
        }
        if self.is_app_sandbox {
            write!(f, ", sandboxed")?;
        }
        if self.encrypt {
            write!(f, ", encrypted")?;
        }
        Ok(())
    }
}
