//! 令牌记录的持久化编码
//!
//! 当前格式：`'*'` + 带标志位的二进制编码（小端，字符串按 4 字节对齐）
//!
//! ```text
//! flags: i32
//!   bit0 has_other_user_ids
//!   bit1 is_sync
//!   bit2 is_unregister
//!   bit3 is_register
//!   bit4 is_app_sandbox
//!   bit5 encrypt
//! token: string
//! other_user_ids: vector<i32>      (has_other_user_ids)
//! encryption_key: bytes            (encrypt)
//! encryption_key_id: i64           (encrypt)
//! ```
//!
//! 旧格式（只读）：首字节 `+` / `-` / `=` 分别对应 Register / Unregister / Synced，其后是原始令牌。

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{DeviceTokenError, Result};
use crate::token_info::{TokenInfo, TokenState};

/// 带标志位编码的前缀
pub const TAGGED_MARKER: u8 = b'*';

const LEGACY_REGISTER: u8 = b'+';
const LEGACY_UNREGISTER: u8 = b'-';
const LEGACY_SYNCED: u8 = b'=';

const FLAG_HAS_OTHER_USER_IDS: i32 = 1 << 0;
const FLAG_IS_SYNC: i32 = 1 << 1;
const FLAG_IS_UNREGISTER: i32 = 1 << 2;
const FLAG_IS_REGISTER: i32 = 1 << 3;
const FLAG_IS_APP_SANDBOX: i32 = 1 << 4;
const FLAG_ENCRYPT: i32 = 1 << 5;
const KNOWN_FLAGS: i32 = (1 << 6) - 1;

const SHORT_STRING_LIMIT: usize = 254;
const LONG_STRING_MARKER: u8 = 0xFE;
const MAX_STRING_LENGTH: usize = 1 << 24;

/// 编码记录（不含前缀）
pub fn encode(info: &TokenInfo) -> Vec<u8> {
    let has_other_user_ids = !info.other_user_ids.is_empty();

    let mut flags = 0i32;
    if has_other_user_ids {
        flags |= FLAG_HAS_OTHER_USER_IDS;
    }
    flags |= match info.state {
        TokenState::Synced => FLAG_IS_SYNC,
        TokenState::PendingUnregister => FLAG_IS_UNREGISTER,
        TokenState::PendingRegister => FLAG_IS_REGISTER,
    };
    if info.is_app_sandbox {
        flags |= FLAG_IS_APP_SANDBOX;
    }
    if info.encrypt {
        flags |= FLAG_ENCRYPT;
    }

    let mut buf = BytesMut::with_capacity(16 + info.token.len() + info.encryption_key.len());
    buf.put_i32_le(flags);
    put_bytes(&mut buf, info.token.as_bytes());
    if has_other_user_ids {
        buf.put_i32_le(info.other_user_ids.len() as i32);
        for user_id in &info.other_user_ids {
            buf.put_i32_le(*user_id);
        }
    }
    if info.encrypt {
        put_bytes(&mut buf, &info.encryption_key);
        buf.put_i64_le(info.encryption_key_id);
    }
    buf.to_vec()
}

/// 解码记录（不含前缀），要求恰好消费全部输入
pub fn decode(mut data: &[u8]) -> Result<TokenInfo> {
    let flags = get_i32(&mut data)?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(corrupted(format!("unknown flags {:#x}", flags)));
    }

    let is_sync = flags & FLAG_IS_SYNC != 0;
    let is_unregister = flags & FLAG_IS_UNREGISTER != 0;
    let is_register = flags & FLAG_IS_REGISTER != 0;
    let state_count = is_sync as u8 + is_unregister as u8 + is_register as u8;
    if state_count != 1 {
        return Err(corrupted(format!("{} state flags set", state_count)));
    }
    let state = if is_sync {
        TokenState::Synced
    } else if is_unregister {
        TokenState::PendingUnregister
    } else {
        TokenState::PendingRegister
    };

    let token = String::from_utf8(get_bytes(&mut data)?)
        .map_err(|_| corrupted("token is not valid UTF-8"))?;

    let mut other_user_ids = Vec::new();
    if flags & FLAG_HAS_OTHER_USER_IDS != 0 {
        let count = get_i32(&mut data)?;
        if count < 0 || data.remaining() < count as usize * 4 {
            return Err(corrupted(format!("invalid other_user_ids length {}", count)));
        }
        other_user_ids.reserve(count as usize);
        for _ in 0..count {
            other_user_ids.push(data.get_i32_le());
        }
    }

    let encrypt = flags & FLAG_ENCRYPT != 0;
    let mut encryption_key = Vec::new();
    let mut encryption_key_id = 0;
    if encrypt {
        encryption_key = get_bytes(&mut data)?;
        encryption_key_id = get_i64(&mut data)?;
    }

    if data.has_remaining() {
        return Err(corrupted(format!("{} trailing bytes", data.remaining())));
    }

    Ok(TokenInfo {
        state,
        token,
        other_user_ids,
        is_app_sandbox: flags & FLAG_IS_APP_SANDBOX != 0,
        encrypt,
        encryption_key,
        encryption_key_id,
    })
}

/// 写入存储的完整值：`'*'` + 编码
pub fn serialize_for_store(info: &TokenInfo) -> Vec<u8> {
    let body = encode(info);
    let mut value = Vec::with_capacity(body.len() + 1);
    value.push(TAGGED_MARKER);
    value.extend_from_slice(&body);
    value
}

/// 解析存储中的值，兼容旧的单字符前缀格式
pub fn parse_stored(value: &[u8]) -> Result<TokenInfo> {
    let (&prefix, rest) = value
        .split_first()
        .ok_or_else(|| corrupted("empty value"))?;

    let state = match prefix {
        TAGGED_MARKER => return decode(rest),
        LEGACY_REGISTER => TokenState::PendingRegister,
        LEGACY_UNREGISTER => TokenState::PendingUnregister,
        LEGACY_SYNCED => TokenState::Synced,
        other => return Err(corrupted(format!("unknown prefix {:#04x}", other))),
    };

    let token = String::from_utf8(rest.to_vec())
        .map_err(|_| corrupted("legacy token is not valid UTF-8"))?;
    Ok(TokenInfo {
        state,
        token,
        ..Default::default()
    })
}

fn corrupted<S: Into<String>>(message: S) -> DeviceTokenError {
    DeviceTokenError::Corrupted(message.into())
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    let header_len = if data.len() < SHORT_STRING_LIMIT {
        buf.put_u8(data.len() as u8);
        1
    } else {
        buf.put_u8(LONG_STRING_MARKER);
        let len = data.len() as u32;
        buf.put_slice(&len.to_le_bytes()[..3]);
        4
    };
    buf.put_slice(data);
    let padding = (4 - (header_len + data.len()) % 4) % 4;
    buf.put_bytes(0, padding);
}

fn get_bytes(data: &mut &[u8]) -> Result<Vec<u8>> {
    if !data.has_remaining() {
        return Err(corrupted("unexpected end of data"));
    }
    let first = data.get_u8();
    let (len, header_len) = if (first as usize) < SHORT_STRING_LIMIT {
        (first as usize, 1)
    } else if first == LONG_STRING_MARKER {
        if data.remaining() < 3 {
            return Err(corrupted("unexpected end of data"));
        }
        let len = data.get_uint_le(3) as usize;
        if len < SHORT_STRING_LIMIT || len >= MAX_STRING_LENGTH {
            return Err(corrupted(format!("invalid long string length {}", len)));
        }
        (len, 4)
    } else {
        return Err(corrupted("invalid string header"));
    };

    let padding = (4 - (header_len + len) % 4) % 4;
    if data.remaining() < len + padding {
        return Err(corrupted("unexpected end of data"));
    }
    let bytes = data[..len].to_vec();
    data.advance(len + padding);
    Ok(bytes)
}

fn get_i32(data: &mut &[u8]) -> Result<i32> {
    if data.remaining() < 4 {
        return Err(corrupted("unexpected end of data"));
    }
    Ok(data.get_i32_le())
}

fn get_i64(data: &mut &[u8]) -> Result<i64> {
    if data.remaining() < 8 {
        return Err(corrupted("unexpected end of data"));
    }
    Ok(data.get_i64_le())
}
