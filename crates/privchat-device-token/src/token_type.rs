//! 推送通道类型
//!
//! 数值即持久化 key 的一部分，必须保持稳定，禁止重新编号。

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TokenType {
    Apns = 1,
    Fcm = 2,
    Mpns = 3,
    SimplePush = 4,
    UbuntuPhone = 5,
    BlackBerry = 6,
    /// 保留值，不会由任何设备令牌产生
    Unused = 7,
    Wns = 8,
    ApnsVoip = 9,
    WebPush = 10,
    MpnsVoip = 11,
    Tizen = 12,
}

impl TokenType {
    /// 全部通道，按数值升序（对账循环按此顺序遍历）
    pub const ALL: [TokenType; 12] = [
        TokenType::Apns,
        TokenType::Fcm,
        TokenType::Mpns,
        TokenType::SimplePush,
        TokenType::UbuntuPhone,
        TokenType::BlackBerry,
        TokenType::Unused,
        TokenType::Wns,
        TokenType::ApnsVoip,
        TokenType::WebPush,
        TokenType::MpnsVoip,
        TokenType::Tizen,
    ];

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_i32() == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenType::Apns => "apns",
            TokenType::Fcm => "fcm",
            TokenType::Mpns => "mpns",
            TokenType::SimplePush => "simple_push",
            TokenType::UbuntuPhone => "ubuntu_phone",
            TokenType::BlackBerry => "blackberry",
            TokenType::Unused => "unused",
            TokenType::Wns => "wns",
            TokenType::ApnsVoip => "apns_voip",
            TokenType::WebPush => "web_push",
            TokenType::MpnsVoip => "mpns_voip",
            TokenType::Tizen => "tizen",
        }
    }

    /// 持久化 key：`{prefix}{token_type}`，例如 `device_token2`
    pub fn database_key(self, prefix: &str) -> String {
        format!("{}{}", prefix, self.as_i32())
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.as_i32())
    }
}
