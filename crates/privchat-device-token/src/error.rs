use thiserror::Error;

/// 客户端参数错误码
pub const CLIENT_ERROR_CODE: i32 = 400;

/// 服务器返回 false 时使用的错误码
pub const SERVER_RETURNED_FALSE_CODE: i32 = 5;

#[derive(Debug, Error)]
pub enum DeviceTokenError {
    /// 调用方传入的参数非法（不会修改任何状态）
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 服务器请求成功但返回了 false
    #[error("Got false as result of server request")]
    ServerReturnedFalse,

    /// 服务器返回的错误
    #[error("RPC error [{code}]: {message}")]
    Rpc { code: i32, message: String },

    /// 传输层错误
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    /// 持久化数据损坏
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl DeviceTokenError {
    /// 错误码，与服务端 / 上层 API 的约定一致
    pub fn code(&self) -> i32 {
        match self {
            DeviceTokenError::InvalidArgument(_) => CLIENT_ERROR_CODE,
            DeviceTokenError::ServerReturnedFalse => SERVER_RETURNED_FALSE_CODE,
            DeviceTokenError::Rpc { code, .. } => *code,
            DeviceTokenError::Transport(_) => 500,
            DeviceTokenError::KvStore(_) => 500,
            DeviceTokenError::Corrupted(_) => 500,
            DeviceTokenError::ShuttingDown(_) => 500,
        }
    }

    /// 判断是否是调用方参数错误
    pub fn is_client_error(&self) -> bool {
        matches!(self, DeviceTokenError::InvalidArgument(_))
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        DeviceTokenError::InvalidArgument(message.into())
    }
}

impl From<sled::Error> for DeviceTokenError {
    fn from(error: sled::Error) -> Self {
        DeviceTokenError::KvStore(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DeviceTokenError>;
