//! 推送加密密钥分配
//!
//! 密钥 ID 由密钥内容派生（SHA1 摘要的第 12..20 字节，小端 i64），
//! 并且必须严格落在闭区间 `[-MIN_ENCRYPTION_KEY_ID, MIN_ENCRYPTION_KEY_ID]` 之外，
//! 保证不会与账号 ID 冲突。

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use sha1::{Digest, Sha1};

/// 密钥长度（字节）
pub const ENCRYPTION_KEY_LENGTH: usize = 256;

/// 保留区间的边界，账号 ID 都在这个区间内
pub const MIN_ENCRYPTION_KEY_ID: i64 = 10_000_000_000_000;

/// 对外暴露的密钥：只有 ID 和原始字节
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub id: i64,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("id", &self.id)
            .field("key", &format!("<{} bytes>", self.key.len()))
            .finish()
    }
}

/// 根据密钥内容计算密钥 ID
pub fn calc_key_id(key: &[u8]) -> i64 {
    let digest = Sha1::digest(key);
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&digest[12..20]);
    i64::from_le_bytes(id_bytes)
}

/// 密钥 ID 是否落在保留区间之外
pub fn is_allowed_key_id(key_id: i64) -> bool {
    key_id < -MIN_ENCRYPTION_KEY_ID || key_id > MIN_ENCRYPTION_KEY_ID
}

/// 使用系统安全随机源分配新密钥
pub fn allocate() -> EncryptionKey {
    allocate_with(&mut OsRng)
}

/// 使用指定随机源分配新密钥，ID 落入保留区间时重新生成
pub fn allocate_with<R: RngCore + CryptoRng>(rng: &mut R) -> EncryptionKey {
    let mut key = vec![0u8; ENCRYPTION_KEY_LENGTH];
    loop {
        rng.fill_bytes(&mut key);
        let id = calc_key_id(&key);
        if is_allowed_key_id(id) {
            return EncryptionKey { id, key };
        }
    }
}
