//! 设备令牌管理器 - 推送注册状态与服务器的对账
//!
//! 核心设计：
//! - 所有令牌记录只属于一个 Actor，命令串行处理，无锁
//! - 每个通道的记录同一时间只跟踪一个在途请求，过期响应按请求 ID 丢弃
//! - 每次持久化写入都要等 `force_sync` 确认后才允许继续发请求
//! - 重试由对账循环重入驱动，不做定时退避

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::DeviceTokenConfig;
use crate::device_token::{DeviceToken, ExtractedToken};
use crate::dispatcher::{AccountIdProvider, RegistrationDispatcher, RegistrationRequest};
use crate::encryption_key::{self, EncryptionKey};
use crate::error::{DeviceTokenError, Result};
use crate::store::TokenStore;
use crate::sync_barrier::SyncBarrier;
use crate::token_info::{TokenInfo, TokenState};
use crate::token_type::TokenType;

/// 注册结果：推送接收方 ID
///
/// 未开启加密时为当前账号 ID，开启加密时为密钥 ID；
/// 0 表示没有实际意义的结果（注销、无变化或被新的注册覆盖）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushReceiverId {
    pub id: i64,
}

impl PushReceiverId {
    pub fn new(id: i64) -> Self {
        Self { id }
    }
}

type Receipt = oneshot::Sender<Result<PushReceiverId>>;

/// 设备令牌命令
pub(crate) enum DeviceTokenCommand {
    RegisterDevice {
        token: ExtractedToken,
        other_user_ids: Vec<i32>,
        respond_to: Receipt,
    },

    GetEncryptionKeys {
        respond_to: oneshot::Sender<Vec<EncryptionKey>>,
    },

    GetTokenInfo {
        token_type: TokenType,
        respond_to: oneshot::Sender<TokenInfo>,
    },

    /// `force_sync` 完成
    SyncCompleted { result: Result<()> },

    /// 网络请求完成
    QueryCompleted {
        token_type: TokenType,
        query_id: u64,
        result: Result<bool>,
    },

    Shutdown,
}

/// 单个通道的运行时状态
#[derive(Default)]
struct TokenRecord {
    info: TokenInfo,
    /// 在途请求 ID，0 表示没有
    net_query_id: u64,
    /// 最近一次注册调用的回执
    promise: Option<Receipt>,
}

/// 校验附带的其他账号 ID
pub fn validate_other_user_ids(other_user_ids: &[i32], max_other_user_ids: usize) -> Result<()> {
    if other_user_ids.iter().any(|user_id| *user_id <= 0) {
        return Err(DeviceTokenError::invalid_argument(
            "Invalid user_id among other user_ids",
        ));
    }
    if other_user_ids.len() > max_other_user_ids {
        return Err(DeviceTokenError::invalid_argument("Too much other user_ids"));
    }
    Ok(())
}

struct DeviceTokenActor {
    config: DeviceTokenConfig,
    store: Arc<dyn TokenStore>,
    dispatcher: Arc<dyn RegistrationDispatcher>,
    account: Arc<dyn AccountIdProvider>,
    tokens: BTreeMap<TokenType, TokenRecord>,
    sync_barrier: SyncBarrier,
    next_query_id: u64,
    /// 回调任务通过它把结果送回 Actor
    self_sender: mpsc::WeakUnboundedSender<DeviceTokenCommand>,
    receiver: mpsc::UnboundedReceiver<DeviceTokenCommand>,
}

impl DeviceTokenActor {
    /// 启动：读取全部持久化记录，然后跑一次对账循环
    fn start_up(&mut self) {
        for token_type in TokenType::ALL {
            let key = token_type.database_key(&self.config.database_key_prefix);
            let serialized = match self.store.get(&key) {
                Ok(Some(value)) if !value.is_empty() => value,
                Ok(_) => continue,
                Err(e) => {
                    error!("读取设备令牌失败: {} {}", token_type, e);
                    continue;
                }
            };

            match codec::parse_stored(&serialized) {
                Ok(info) => {
                    info!("GET device token {} ---> {}", token_type, info);
                    self.tokens.entry(token_type).or_default().info = info;
                }
                Err(e) => {
                    error!(
                        "Invalid serialized TokenInfo: {} {} {}",
                        token_type,
                        hex::encode(&serialized),
                        e
                    );
                    self.tokens.entry(token_type).or_default().info.reset();
                }
            }
        }
        self.reconcile();
    }

    async fn run(mut self) {
        info!("🔄 DeviceTokenActor 开始处理命令");

        while let Some(command) = self.receiver.recv().await {
            match command {
                DeviceTokenCommand::RegisterDevice {
                    token,
                    other_user_ids,
                    respond_to,
                } => self.register_device(token, other_user_ids, respond_to),
                DeviceTokenCommand::GetEncryptionKeys { respond_to } => {
                    let _ = respond_to.send(self.get_encryption_keys());
                }
                DeviceTokenCommand::GetTokenInfo {
                    token_type,
                    respond_to,
                } => {
                    let info = self
                        .tokens
                        .get(&token_type)
                        .map(|record| record.info.clone())
                        .unwrap_or_default();
                    let _ = respond_to.send(info);
                }
                DeviceTokenCommand::SyncCompleted { result } => self.on_sync_completed(result),
                DeviceTokenCommand::QueryCompleted {
                    token_type,
                    query_id,
                    result,
                } => self.on_result(token_type, query_id, result),
                DeviceTokenCommand::Shutdown => {
                    info!("🛑 DeviceTokenActor 收到停止信号");
                    break;
                }
            }
        }

        info!("DeviceTokenActor 已退出");
    }

    fn register_device(
        &mut self,
        token: ExtractedToken,
        other_user_ids: Vec<i32>,
        promise: Receipt,
    ) {
        if let Err(e) = validate_other_user_ids(&other_user_ids, self.config.max_other_user_ids) {
            let _ = promise.send(Err(e));
            return;
        }

        let ExtractedToken {
            token_type,
            token,
            is_app_sandbox,
            encrypt,
        } = token;
        debug!("register device: {} token_len={}", token_type, token.len());

        let record = self.tokens.entry(token_type).or_default();
        record.net_query_id = 0;
        let info = &mut record.info;
        if token.is_empty() {
            if info.token.is_empty() {
                // 已经注销过了
                let _ = promise.send(Ok(PushReceiverId::default()));
                return;
            }
            info.state = TokenState::PendingUnregister;
        } else {
            info.state = TokenState::PendingRegister;
            info.token = token;
        }
        info.other_user_ids = other_user_ids;
        info.is_app_sandbox = is_app_sandbox;
        if encrypt != info.encrypt {
            if encrypt {
                let key = encryption_key::allocate();
                info.encryption_key = key.key;
                info.encryption_key_id = key.id;
            } else {
                info.encryption_key.clear();
                info.encryption_key_id = 0;
            }
            info.encrypt = encrypt;
        }

        if let Some(previous) = record.promise.replace(promise) {
            let _ = previous.send(Ok(PushReceiverId::default()));
        }
        self.save_info(token_type);
    }

    fn get_encryption_keys(&self) -> Vec<EncryptionKey> {
        let my_id = self.account.my_id();
        self.tokens
            .values()
            .map(|record| &record.info)
            .filter(|info| !info.token.is_empty() && info.state != TokenState::PendingUnregister)
            .map(|info| {
                if info.encrypt {
                    EncryptionKey {
                        id: info.encryption_key_id,
                        key: info.encryption_key.clone(),
                    }
                } else {
                    EncryptionKey {
                        id: my_id,
                        key: Vec::new(),
                    }
                }
            })
            .collect()
    }

    /// 写入记录并登记一次待确认的刷盘
    fn save_info(&mut self, token_type: TokenType) {
        let Some(record) = self.tokens.get(&token_type) else {
            return;
        };
        info!("SET device token {} ---> {}", token_type, record.info);

        let key = token_type.database_key(&self.config.database_key_prefix);
        let write_result = if record.info.token.is_empty() {
            self.store.erase(&key)
        } else {
            self.store
                .set(&key, &codec::serialize_for_store(&record.info))
        };
        if let Err(e) = write_result {
            error!("保存设备令牌失败: {} {}", token_type, e);
        }

        self.sync_barrier.begin_write();
        let Some(sender) = self.self_sender.upgrade() else {
            warn!("DeviceTokenActor 正在关闭，跳过刷盘确认");
            return;
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            let result = store.force_sync().await;
            let _ = sender.send(DeviceTokenCommand::SyncCompleted { result });
        });
    }

    fn on_sync_completed(&mut self, result: Result<()>) {
        if let Err(e) = result {
            error!("设备令牌刷盘失败: {}", e);
        }
        if self.sync_barrier.finish_write() {
            self.reconcile();
        } else {
            debug!("还有 {} 个写入未确认", self.sync_barrier.pending());
        }
    }

    /// 对账循环：为每个未同步且没有在途请求的通道发出一个请求
    fn reconcile(&mut self) {
        if !self.sync_barrier.is_drained() {
            debug!(
                "还有 {} 个写入未确认，暂不发送请求",
                self.sync_barrier.pending()
            );
            return;
        }

        let mut requests = Vec::new();
        for (token_type, record) in self.tokens.iter_mut() {
            let info = &record.info;
            if info.state == TokenState::Synced || record.net_query_id != 0 {
                continue;
            }

            let request = if info.state == TokenState::PendingUnregister {
                RegistrationRequest::Unregister {
                    token_type: *token_type,
                    token: info.token.clone(),
                    other_user_ids: info.other_user_ids.clone(),
                }
            } else {
                RegistrationRequest::Register {
                    token_type: *token_type,
                    token: info.token.clone(),
                    is_app_sandbox: info.is_app_sandbox,
                    secret: info.encryption_key.clone(),
                    other_user_ids: info.other_user_ids.clone(),
                }
            };
            self.next_query_id += 1;
            record.net_query_id = self.next_query_id;
            requests.push((*token_type, self.next_query_id, request));
        }

        if requests.is_empty() {
            return;
        }
        let Some(sender) = self.self_sender.upgrade() else {
            return;
        };
        for (token_type, query_id, request) in requests {
            debug!("📤 发送设备令牌请求: query_id={} {:?}", query_id, request);
            let dispatcher = self.dispatcher.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                let result = dispatcher.dispatch(request).await;
                let _ = sender.send(DeviceTokenCommand::QueryCompleted {
                    token_type,
                    query_id,
                    result,
                });
            });
        }
    }

    fn on_result(&mut self, token_type: TokenType, query_id: u64, result: Result<bool>) {
        let my_id = self.account.my_id();
        let Some(record) = self.tokens.get_mut(&token_type) else {
            return;
        };
        if record.net_query_id != query_id {
            debug!(
                "忽略过期响应: {} query_id={} current={}",
                token_type, query_id, record.net_query_id
            );
            return;
        }
        record.net_query_id = 0;

        let info = &mut record.info;
        let failure = match result {
            Ok(true) => None,
            Ok(false) => Some(DeviceTokenError::ServerReturnedFalse),
            Err(e) => {
                error!("设备令牌请求失败: {} {}", token_type, e);
                Some(e)
            }
        };

        match failure {
            None => {
                if let Some(promise) = record.promise.take() {
                    let push_receiver_id = if info.state == TokenState::PendingRegister {
                        if info.encrypt {
                            info.encryption_key_id
                        } else {
                            my_id
                        }
                    } else {
                        0
                    };
                    let _ = promise.send(Ok(PushReceiverId::new(push_receiver_id)));
                }
                if info.state == TokenState::PendingUnregister {
                    info.token.clear();
                }
                info.state = TokenState::Synced;
            }
            Some(e) => {
                warn!("⚠️ 服务器拒绝设备令牌请求: {} {:?} {}", token_type, info.state, e);
                if let Some(promise) = record.promise.take() {
                    let _ = promise.send(Err(e));
                }
                // 注册被拒绝时改为注销，注销失败则直接放弃
                if info.state == TokenState::PendingRegister {
                    info.state = TokenState::PendingUnregister;
                } else {
                    info.state = TokenState::Synced;
                    info.token.clear();
                }
            }
        }

        self.save_info(token_type);
    }
}

/// 注册回执
pub struct RegistrationReceipt {
    receiver: oneshot::Receiver<Result<PushReceiverId>>,
}

impl RegistrationReceipt {
    /// 等待注册结果
    ///
    /// 如果在服务器响应之前同一通道又发起了新的注册，这里会直接得到 0
    pub async fn wait(self) -> Result<PushReceiverId> {
        self.receiver
            .await
            .map_err(|_| DeviceTokenError::ShuttingDown("设备令牌管理器已停止".to_string()))?
    }
}

/// 设备令牌管理器句柄
#[derive(Clone)]
pub struct DeviceTokenManager {
    sender: mpsc::UnboundedSender<DeviceTokenCommand>,
}

impl std::fmt::Debug for DeviceTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTokenManager")
            .field("sender", &"<channel>")
            .finish()
    }
}

impl DeviceTokenManager {
    /// 启动管理器
    ///
    /// 同步读取全部持久化记录并跑一次对账循环，然后在后台任务中处理命令。
    /// 必须在 tokio 运行时中调用。
    pub fn spawn(
        config: DeviceTokenConfig,
        store: Arc<dyn TokenStore>,
        dispatcher: Arc<dyn RegistrationDispatcher>,
        account: Arc<dyn AccountIdProvider>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut actor = DeviceTokenActor {
            config,
            store,
            dispatcher,
            account,
            tokens: BTreeMap::new(),
            sync_barrier: SyncBarrier::new(),
            next_query_id: 0,
            self_sender: sender.downgrade(),
            receiver,
        };
        actor.start_up();
        tokio::spawn(actor.run());

        Self { sender }
    }

    /// 注册（或以空令牌注销）设备推送令牌
    ///
    /// 令牌格式错误时回执立即返回 400 错误
    pub fn register_device(
        &self,
        device_token: DeviceToken,
        other_user_ids: Vec<i32>,
    ) -> RegistrationReceipt {
        let (tx, rx) = oneshot::channel();
        let receipt = RegistrationReceipt { receiver: rx };

        let token = match device_token.extract() {
            Ok(token) => token,
            Err(e) => {
                warn!("设备令牌格式错误: {}", e);
                let _ = tx.send(Err(e));
                return receipt;
            }
        };

        let command = DeviceTokenCommand::RegisterDevice {
            token,
            other_user_ids,
            respond_to: tx,
        };
        if let Err(mpsc::error::SendError(command)) = self.sender.send(command) {
            error!("❌ 发送 RegisterDevice 命令失败：Actor 已停止");
            if let DeviceTokenCommand::RegisterDevice { respond_to, .. } = command {
                let _ = respond_to.send(Err(DeviceTokenError::ShuttingDown(
                    "设备令牌管理器已停止".to_string(),
                )));
            }
        }
        receipt
    }

    /// 用于推送内容解密的密钥列表
    ///
    /// 未开启加密的通道返回 `(当前账号 ID, 空密钥)`
    pub async fn get_encryption_keys(&self) -> Result<Vec<EncryptionKey>> {
        let (tx, rx) = oneshot::channel();
        self.send(DeviceTokenCommand::GetEncryptionKeys { respond_to: tx })?;
        rx.await
            .map_err(|_| DeviceTokenError::ShuttingDown("设备令牌管理器响应失败".to_string()))
    }

    /// 获取某个通道当前的令牌记录快照
    pub async fn token_info(&self, token_type: TokenType) -> Result<TokenInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(DeviceTokenCommand::GetTokenInfo {
            token_type,
            respond_to: tx,
        })?;
        rx.await
            .map_err(|_| DeviceTokenError::ShuttingDown("设备令牌管理器响应失败".to_string()))
    }

    /// 停止 Actor，未完成的回执会得到 ShuttingDown 错误
    pub fn shutdown(&self) {
        let _ = self.sender.send(DeviceTokenCommand::Shutdown);
    }

    fn send(&self, command: DeviceTokenCommand) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| DeviceTokenError::ShuttingDown("设备令牌管理器已停止".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{FixedAccountId, ManualDispatcher};
    use crate::encryption_key::MIN_ENCRYPTION_KEY_ID;
    use crate::store::{MemoryTokenStore, SledTokenStore};
    use std::time::Duration;
    use tempfile::TempDir;

    const MY_ID: i64 = 777;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn spawn_manager(
        store: Arc<MemoryTokenStore>,
        dispatcher: Arc<ManualDispatcher>,
    ) -> DeviceTokenManager {
        init_tracing();
        DeviceTokenManager::spawn(
            DeviceTokenConfig::default(),
            store,
            dispatcher,
            Arc::new(FixedAccountId(MY_ID)),
        )
    }

    fn fcm(token: &str, encrypt: bool) -> DeviceToken {
        DeviceToken::FirebaseCloudMessaging {
            token: token.to_string(),
            encrypt,
        }
    }

    async fn resolve(receipt: RegistrationReceipt) -> Result<PushReceiverId> {
        tokio::time::timeout(Duration::from_secs(5), receipt.wait())
            .await
            .expect("receipt was not resolved")
    }

    #[tokio::test]
    async fn test_register_fcm_then_success() {
        let store = MemoryTokenStore::new();
        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());

        let receipt = manager.register_device(fcm("abc", false), vec![]);
        let pending = dispatcher.next_request().await;
        assert_eq!(
            pending.request,
            RegistrationRequest::Register {
                token_type: TokenType::Fcm,
                token: "abc".to_string(),
                is_app_sandbox: false,
                secret: vec![],
                other_user_ids: vec![],
            }
        );
        let info = manager.token_info(TokenType::Fcm).await.unwrap();
        assert_eq!(info.state, TokenState::PendingRegister);
        assert_eq!(info.token, "abc");
        assert!(store.raw("device_token2").is_some());

        pending.respond(Ok(true));
        assert_eq!(resolve(receipt).await.unwrap(), PushReceiverId::new(MY_ID));

        let info = manager.token_info(TokenType::Fcm).await.unwrap();
        assert_eq!(info.state, TokenState::Synced);
        assert_eq!(info.token, "abc");

        let keys = manager.get_encryption_keys().await.unwrap();
        assert_eq!(
            keys,
            vec![EncryptionKey {
                id: MY_ID,
                key: vec![]
            }]
        );
    }

    #[tokio::test]
    async fn test_empty_token_on_empty_record_is_noop() {
        let store = MemoryTokenStore::new();
        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());

        let receipt = manager.register_device(
            DeviceToken::ApplePush {
                device_token: String::new(),
                is_app_sandbox: false,
            },
            vec![],
        );
        assert_eq!(resolve(receipt).await.unwrap(), PushReceiverId::default());

        // 通过一次往返确认 Actor 已处理完之前的命令
        assert!(manager.get_encryption_keys().await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.write_count(), 0);
        assert_eq!(dispatcher.dispatched_count(), 0);
        assert!(dispatcher.try_next_request().is_none());
    }

    #[tokio::test]
    async fn test_invalid_other_user_ids_rejected_without_mutation() {
        let store = MemoryTokenStore::new();
        let dispatcher = ManualDispatcher::new();
        init_tracing();
        let manager = DeviceTokenManager::spawn(
            DeviceTokenConfig::builder().max_other_user_ids(2).build(),
            store.clone(),
            dispatcher.clone(),
            Arc::new(FixedAccountId(MY_ID)),
        );

        let err = resolve(manager.register_device(fcm("abc", false), vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(err.code(), 400);

        let err = resolve(manager.register_device(fcm("abc", false), vec![5, 0]))
            .await
            .unwrap_err();
        assert!(err.is_client_error());

        let info = manager.token_info(TokenType::Fcm).await.unwrap();
        assert_eq!(info, TokenInfo::default());
        assert_eq!(store.write_count(), 0);
        assert_eq!(dispatcher.dispatched_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_web_push_fails_immediately() {
        let store = MemoryTokenStore::new();
        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());

        let receipt = manager.register_device(
            DeviceToken::WebPush {
                endpoint: "https://push.example.com/a,b".to_string(),
                p256dh_base64url: "AAAA".to_string(),
                auth_base64url: "AAAA".to_string(),
            },
            vec![],
        );
        let err = resolve(receipt).await.unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(
            manager.token_info(TokenType::WebPush).await.unwrap(),
            TokenInfo::default()
        );
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_superseded_receipt_resolves_with_neutral_result() {
        let store = MemoryTokenStore::new();
        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());

        let first = manager.register_device(fcm("first", false), vec![]);
        let first_request = dispatcher.next_request().await;
        assert_eq!(first_request.request.token(), "first");

        let second = manager.register_device(fcm("second", false), vec![42]);
        assert_eq!(resolve(first).await.unwrap(), PushReceiverId::default());

        let second_request = dispatcher.next_request().await;
        assert_eq!(second_request.request.token(), "second");
        // 被覆盖的请求仍在传输层等待响应，记录只跟踪新的请求
        assert_eq!(dispatcher.dispatched_count(), 2);
        assert_eq!(dispatcher.max_in_flight_per_type(), 2);

        // 第一个请求的响应已经过期，不能影响状态
        first_request.respond(Ok(false));
        second_request.respond(Ok(true));
        assert_eq!(resolve(second).await.unwrap(), PushReceiverId::new(MY_ID));

        let info = manager.token_info(TokenType::Fcm).await.unwrap();
        assert_eq!(info.state, TokenState::Synced);
        assert_eq!(info.token, "second");
        assert_eq!(info.other_user_ids, vec![42]);
    }

    #[tokio::test]
    async fn test_rejected_registration_turns_into_unregister() {
        let store = MemoryTokenStore::new();
        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());

        let receipt = manager.register_device(fcm("abc", false), vec![9]);
        dispatcher.next_request().await.respond(Ok(false));
        let err = resolve(receipt).await.unwrap_err();
        assert!(matches!(err, DeviceTokenError::ServerReturnedFalse));

        let unregister = dispatcher.next_request().await;
        assert_eq!(
            unregister.request,
            RegistrationRequest::Unregister {
                token_type: TokenType::Fcm,
                token: "abc".to_string(),
                other_user_ids: vec![9],
            }
        );
        let info = manager.token_info(TokenType::Fcm).await.unwrap();
        assert_eq!(info.state, TokenState::PendingUnregister);
        assert!(manager.get_encryption_keys().await.unwrap().is_empty());

        unregister.respond(Ok(true));
        // 注销完成后记录被清空，存储中的条目被删除
        for _ in 0..100 {
            let info = manager.token_info(TokenType::Fcm).await.unwrap();
            if info.state == TokenState::Synced {
                assert!(info.token.is_empty());
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let info = manager.token_info(TokenType::Fcm).await.unwrap();
        assert_eq!(info.state, TokenState::Synced);
        assert!(store.raw("device_token2").is_none());
    }

    #[tokio::test]
    async fn test_failed_unregister_is_abandoned() {
        let store = MemoryTokenStore::new();
        store.insert_raw("device_token2", b"=old-token");
        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());

        let receipt = manager.register_device(fcm("", false), vec![]);
        let unregister = dispatcher.next_request().await;
        assert!(!unregister.request.is_register());
        assert_eq!(unregister.request.token(), "old-token");

        unregister.respond(Err(DeviceTokenError::Rpc {
            code: 400,
            message: "TOKEN_INVALID".to_string(),
        }));
        match resolve(receipt).await.unwrap_err() {
            DeviceTokenError::Rpc { code, message } => {
                assert_eq!(code, 400);
                assert_eq!(message, "TOKEN_INVALID");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let info = manager.token_info(TokenType::Fcm).await.unwrap();
        assert_eq!(info.state, TokenState::Synced);
        assert!(info.token.is_empty());
    }

    #[tokio::test]
    async fn test_encryption_key_lifecycle() {
        let store = MemoryTokenStore::new();
        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());

        let receipt = manager.register_device(fcm("abc", true), vec![]);
        let pending = dispatcher.next_request().await;
        let info = manager.token_info(TokenType::Fcm).await.unwrap();
        assert!(info.encrypt);
        assert_eq!(info.encryption_key.len(), 256);
        assert!(
            info.encryption_key_id < -MIN_ENCRYPTION_KEY_ID
                || info.encryption_key_id > MIN_ENCRYPTION_KEY_ID
        );
        match &pending.request {
            RegistrationRequest::Register { secret, .. } => {
                assert_eq!(secret, &info.encryption_key)
            }
            other => panic!("unexpected request: {:?}", other),
        }
        pending.respond(Ok(true));
        assert_eq!(
            resolve(receipt).await.unwrap(),
            PushReceiverId::new(info.encryption_key_id)
        );
        assert_eq!(
            manager.get_encryption_keys().await.unwrap(),
            vec![EncryptionKey {
                id: info.encryption_key_id,
                key: info.encryption_key.clone(),
            }]
        );

        // 保持加密时不会轮换密钥
        let receipt = manager.register_device(fcm("abc2", true), vec![]);
        dispatcher.next_request().await.respond(Ok(true));
        resolve(receipt).await.unwrap();
        let same = manager.token_info(TokenType::Fcm).await.unwrap();
        assert_eq!(same.encryption_key_id, info.encryption_key_id);
        assert_eq!(same.encryption_key, info.encryption_key);

        // 关闭加密后清空密钥
        let receipt = manager.register_device(fcm("abc2", false), vec![]);
        dispatcher.next_request().await.respond(Ok(true));
        assert_eq!(resolve(receipt).await.unwrap(), PushReceiverId::new(MY_ID));
        let cleared = manager.token_info(TokenType::Fcm).await.unwrap();
        assert!(!cleared.encrypt);
        assert!(cleared.encryption_key.is_empty());
        assert_eq!(cleared.encryption_key_id, 0);
    }

    #[tokio::test]
    async fn test_requests_wait_for_persistence() {
        let store = MemoryTokenStore::new();
        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());

        store.hold_flushes();
        let receipt = manager.register_device(fcm("abc", false), vec![]);
        manager.token_info(TokenType::Fcm).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.write_count(), 1);
        assert_eq!(dispatcher.dispatched_count(), 0);

        store.release_flushes();
        dispatcher.next_request().await.respond(Ok(true));
        assert_eq!(resolve(receipt).await.unwrap(), PushReceiverId::new(MY_ID));
    }

    #[tokio::test]
    async fn test_at_most_one_request_in_flight_per_type() {
        let store = MemoryTokenStore::new();
        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());

        let fcm_receipt = manager.register_device(fcm("abc", false), vec![]);
        let fcm_request = dispatcher.next_request().await;

        // 其他通道的写入会再次触发对账循环，但不能为 FCM 再发请求
        let apns_receipt = manager.register_device(
            DeviceToken::ApplePush {
                device_token: "apns".to_string(),
                is_app_sandbox: true,
            },
            vec![],
        );
        let apns_request = dispatcher.next_request().await;
        assert_eq!(apns_request.request.token_type(), TokenType::Apns);
        match &apns_request.request {
            RegistrationRequest::Register { is_app_sandbox, .. } => assert!(is_app_sandbox),
            other => panic!("unexpected request: {:?}", other),
        }

        manager.token_info(TokenType::Fcm).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.dispatched_count(), 2);
        assert!(dispatcher.try_next_request().is_none());

        fcm_request.respond(Ok(true));
        apns_request.respond(Ok(true));
        resolve(fcm_receipt).await.unwrap();
        resolve(apns_receipt).await.unwrap();
        assert_eq!(dispatcher.max_in_flight_per_type(), 1);

        let keys = manager.get_encryption_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn test_start_up_loads_tagged_legacy_and_corrupted_entries() {
        let store = MemoryTokenStore::new();
        let encrypted = TokenInfo {
            state: TokenState::Synced,
            token: "voip".to_string(),
            is_app_sandbox: true,
            encrypt: true,
            encryption_key: vec![7; 256],
            encryption_key_id: MIN_ENCRYPTION_KEY_ID + 5,
            ..Default::default()
        };
        store.insert_raw("device_token9", &codec::serialize_for_store(&encrypted));
        store.insert_raw("device_token2", b"+legacy");
        store.insert_raw("device_token1", b"?garbage");
        store.insert_raw("device_token8", b"*\x01");

        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());

        let pending = dispatcher.next_request().await;
        assert_eq!(pending.request.token_type(), TokenType::Fcm);
        assert_eq!(pending.request.token(), "legacy");

        assert_eq!(manager.token_info(TokenType::ApnsVoip).await.unwrap(), encrypted);
        assert_eq!(
            manager.token_info(TokenType::Apns).await.unwrap(),
            TokenInfo::default()
        );
        assert_eq!(
            manager.token_info(TokenType::Wns).await.unwrap(),
            TokenInfo::default()
        );

        let keys = manager.get_encryption_keys().await.unwrap();
        assert_eq!(
            keys,
            vec![
                EncryptionKey {
                    id: MY_ID,
                    key: vec![]
                },
                EncryptionKey {
                    id: encrypted.encryption_key_id,
                    key: encrypted.encryption_key.clone(),
                },
            ]
        );

        // 没有 pending 回执时响应只更新状态
        pending.respond(Ok(true));
        for _ in 0..100 {
            if manager.token_info(TokenType::Fcm).await.unwrap().state == TokenState::Synced {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            manager.token_info(TokenType::Fcm).await.unwrap().state,
            TokenState::Synced
        );
        // 重新保存后使用新格式
        assert_eq!(store.raw("device_token2").unwrap()[0], codec::TAGGED_MARKER);
    }

    #[tokio::test]
    async fn test_pending_registration_survives_restart() {
        let store = MemoryTokenStore::new();
        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());

        let receipt = manager.register_device(fcm("abc", false), vec![3, 4]);
        let _abandoned = dispatcher.next_request().await;
        manager.shutdown();
        assert!(matches!(
            resolve(receipt).await,
            Err(DeviceTokenError::ShuttingDown(_))
        ));

        let dispatcher = ManualDispatcher::new();
        let manager = spawn_manager(store.clone(), dispatcher.clone());
        let pending = dispatcher.next_request().await;
        assert_eq!(
            pending.request,
            RegistrationRequest::Register {
                token_type: TokenType::Fcm,
                token: "abc".to_string(),
                is_app_sandbox: false,
                secret: vec![],
                other_user_ids: vec![3, 4],
            }
        );
        pending.respond(Ok(true));
        for _ in 0..100 {
            if manager.token_info(TokenType::Fcm).await.unwrap().state == TokenState::Synced {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            manager.token_info(TokenType::Fcm).await.unwrap().state,
            TokenState::Synced
        );
    }

    #[tokio::test]
    async fn test_sled_backed_manager() {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let config = DeviceTokenConfig::builder().data_dir(temp_dir.path()).build();
        let store = Arc::new(SledTokenStore::open_with_config(&config).await.unwrap());
        let dispatcher = ManualDispatcher::new();
        let manager = DeviceTokenManager::spawn(
            config,
            store.clone(),
            dispatcher.clone(),
            Arc::new(FixedAccountId(MY_ID)),
        );

        let receipt = manager.register_device(
            DeviceToken::WindowsPush {
                access_token: "wns-token".to_string(),
            },
            vec![],
        );
        dispatcher.next_request().await.respond(Ok(true));
        assert_eq!(resolve(receipt).await.unwrap(), PushReceiverId::new(MY_ID));

        let value = store.get("device_token8").unwrap().unwrap();
        let info = codec::parse_stored(&value).unwrap();
        assert_eq!(info.token, "wns-token");
        // 最后一次保存（Synced）可能还在刷盘，这里只检查令牌本身
        assert!(matches!(
            info.state,
            TokenState::Synced | TokenState::PendingRegister
        ));
    }
}
