//! Privchat Device Token - 推送设备令牌注册管理
//!
//! 负责把本地推送令牌的注册意图可靠地同步到服务器：
//! - 📲 支持 APNs / FCM / WNS / Web Push 等 11 种推送通道
//! - 💾 每个通道一条持久化记录，重启后继续未完成的同步
//! - 🔐 可选的推送内容加密密钥（256 字节，ID 由 SHA1 派生）
//! - 🔁 注册被拒绝时自动转为注销，过期响应自动丢弃
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use privchat_device_token::{
//!     DeviceToken, DeviceTokenConfig, DeviceTokenManager, FixedAccountId,
//!     RegistrationDispatcher, RegistrationRequest, SledTokenStore,
//! };
//!
//! struct RpcDispatcher;
//!
//! #[async_trait]
//! impl RegistrationDispatcher for RpcDispatcher {
//!     async fn dispatch(&self, _request: RegistrationRequest) -> privchat_device_token::Result<bool> {
//!         // 调用 account.registerDevice / account.unregisterDevice
//!         Ok(true)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DeviceTokenConfig::builder()
//!         .data_dir("/path/to/data")
//!         .build();
//!     let store = Arc::new(SledTokenStore::open_with_config(&config).await?);
//!
//!     let manager = DeviceTokenManager::spawn(
//!         config,
//!         store,
//!         Arc::new(RpcDispatcher),
//!         Arc::new(FixedAccountId(10001)),
//!     );
//!
//!     let receipt = manager.register_device(
//!         DeviceToken::FirebaseCloudMessaging {
//!             token: "fcm-token".to_string(),
//!             encrypt: true,
//!         },
//!         vec![],
//!     );
//!     let push_receiver_id = receipt.wait().await?;
//!     println!("push receiver id: {}", push_receiver_id.id);
//!
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod device_token;
pub mod dispatcher;
pub mod encryption_key;
pub mod error;
pub mod manager;
pub mod store;
pub mod sync_barrier;
pub mod token_info;
pub mod token_type;

// 重新导出核心类型
pub use config::{DeviceTokenConfig, DeviceTokenConfigBuilder};
pub use device_token::{DeviceToken, ExtractedToken};
pub use dispatcher::{AccountIdProvider, FixedAccountId, RegistrationDispatcher, RegistrationRequest};
pub use encryption_key::EncryptionKey;
pub use error::{DeviceTokenError, Result};
pub use manager::{DeviceTokenManager, PushReceiverId, RegistrationReceipt};
pub use store::{SledTokenStore, TokenStore};
pub use token_info::{TokenInfo, TokenState};
pub use token_type::TokenType;
