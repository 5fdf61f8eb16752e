//! 对账引擎依赖的外部协作方：网络请求派发、当前账号 ID

use async_trait::async_trait;
use std::fmt;

use crate::error::Result;
use crate::token_type::TokenType;

/// 发往服务器的注册 / 注销请求
#[derive(Clone, PartialEq, Eq)]
pub enum RegistrationRequest {
    Register {
        token_type: TokenType,
        token: String,
        is_app_sandbox: bool,
        /// 推送加密密钥，未开启加密时为空
        secret: Vec<u8>,
        other_user_ids: Vec<i32>,
    },
    Unregister {
        token_type: TokenType,
        token: String,
        other_user_ids: Vec<i32>,
    },
}

impl RegistrationRequest {
    pub fn token_type(&self) -> TokenType {
        match self {
            RegistrationRequest::Register { token_type, .. } => *token_type,
            RegistrationRequest::Unregister { token_type, .. } => *token_type,
        }
    }

    pub fn is_register(&self) -> bool {
        matches!(self, RegistrationRequest::Register { .. })
    }

    pub fn token(&self) -> &str {
        match self {
            RegistrationRequest::Register { token, .. } => token,
            RegistrationRequest::Unregister { token, .. } => token,
        }
    }
}

impl fmt::Debug for RegistrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationRequest::Register {
                token_type,
                token,
                is_app_sandbox,
                secret,
                other_user_ids,
            } => f
                .debug_struct("Register")
                .field("token_type", token_type)
                .field("token", token)
                .field("is_app_sandbox", is_app_sandbox)
                .field("secret", &format!("<{} bytes>", secret.len()))
                .field("other_user_ids", other_user_ids)
                .finish(),
            RegistrationRequest::Unregister {
                token_type,
                token,
                other_user_ids,
            } => f
                .debug_struct("Unregister")
                .field("token_type", token_type)
                .field("token", token)
                .field("other_user_ids", other_user_ids)
                .finish(),
        }
    }
}

/// 网络请求派发器（由上层 RPC 客户端实现）
///
/// 每个请求只返回一次：服务器的 bool 结果或错误
#[async_trait]
pub trait RegistrationDispatcher: Send + Sync {
    async fn dispatch(&self, request: RegistrationRequest) -> Result<bool>;
}

/// 当前登录账号 ID 提供方
pub trait AccountIdProvider: Send + Sync {
    fn my_id(&self) -> i64;
}

/// 固定账号 ID
#[derive(Debug, Clone, Copy)]
pub struct FixedAccountId(pub i64);

impl AccountIdProvider for FixedAccountId {
    fn my_id(&self) -> i64 {
        self.0
    }
}


#[cfg(test)]
pub use test_helpers::{ManualDispatcher, PendingRequest};
