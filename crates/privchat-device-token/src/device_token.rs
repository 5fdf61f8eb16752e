//! 设备推送令牌
//!
//! 将各平台的推送令牌映射为统一的 `(TokenType, token, is_app_sandbox, encrypt)`，
//! 并在进入对账引擎之前完成各平台自身的格式校验。

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{DeviceTokenError, Result};
use crate::token_type::TokenType;

/// 清洗后的输入字符串长度上限（字节）
const INPUT_STRING_LENGTH_LIMIT: usize = 35000;

const BASE64URL_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// 各推送平台的设备令牌
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceToken {
    ApplePush {
        device_token: String,
        is_app_sandbox: bool,
    },
    FirebaseCloudMessaging {
        token: String,
        encrypt: bool,
    },
    MicrosoftPush {
        channel_uri: String,
    },
    SimplePush {
        endpoint: String,
    },
    UbuntuPush {
        token: String,
    },
    BlackBerryPush {
        token: String,
    },
    WindowsPush {
        access_token: String,
    },
    ApplePushVoip {
        device_token: String,
        is_app_sandbox: bool,
        encrypt: bool,
    },
    WebPush {
        endpoint: String,
        p256dh_base64url: String,
        auth_base64url: String,
    },
    MicrosoftPushVoip {
        channel_uri: String,
    },
    TizenPush {
        reg_id: String,
    },
}

/// 提取后的令牌，直接交给对账引擎
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedToken {
    pub token_type: TokenType,
    /// 空字符串表示注销该通道
    pub token: String,
    pub is_app_sandbox: bool,
    pub encrypt: bool,
}

impl DeviceToken {
    pub fn token_type(&self) -> TokenType {
        match self {
            DeviceToken::ApplePush { .. } => TokenType::Apns,
            DeviceToken::FirebaseCloudMessaging { .. } => TokenType::Fcm,
            DeviceToken::MicrosoftPush { .. } => TokenType::Mpns,
            DeviceToken::SimplePush { .. } => TokenType::SimplePush,
            DeviceToken::UbuntuPush { .. } => TokenType::UbuntuPhone,
            DeviceToken::BlackBerryPush { .. } => TokenType::BlackBerry,
            DeviceToken::WindowsPush { .. } => TokenType::Wns,
            DeviceToken::ApplePushVoip { .. } => TokenType::ApnsVoip,
            DeviceToken::WebPush { .. } => TokenType::WebPush,
            DeviceToken::MicrosoftPushVoip { .. } => TokenType::MpnsVoip,
            DeviceToken::TizenPush { .. } => TokenType::Tizen,
        }
    }

    /// 提取并校验令牌
    ///
    /// 校验失败返回 400 错误，调用方不应再进入对账引擎
    pub fn extract(self) -> Result<ExtractedToken> {
        let token_type = self.token_type();
        let mut is_app_sandbox = false;
        let mut encrypt = false;

        let token = match self {
            DeviceToken::ApplePush {
                device_token,
                is_app_sandbox: sandbox,
            } => {
                is_app_sandbox = sandbox;
                device_token
            }
            DeviceToken::FirebaseCloudMessaging {
                token,
                encrypt: need_encrypt,
            } => {
                encrypt = need_encrypt;
                token
            }
            DeviceToken::MicrosoftPush { channel_uri } => channel_uri,
            DeviceToken::SimplePush { endpoint } => endpoint,
            DeviceToken::UbuntuPush { token } => token,
            DeviceToken::BlackBerryPush { token } => token,
            DeviceToken::WindowsPush { access_token } => access_token,
            DeviceToken::ApplePushVoip {
                device_token,
                is_app_sandbox: sandbox,
                encrypt: need_encrypt,
            } => {
                is_app_sandbox = sandbox;
                encrypt = need_encrypt;
                device_token
            }
            DeviceToken::WebPush {
                endpoint,
                p256dh_base64url,
                auth_base64url,
            } => build_web_push_token(endpoint, &p256dh_base64url, &auth_base64url)?,
            DeviceToken::MicrosoftPushVoip { channel_uri } => channel_uri,
            DeviceToken::TizenPush { reg_id } => reg_id,
        };

        Ok(ExtractedToken {
            token_type,
            token: clean_input_string(&token),
            is_app_sandbox,
            encrypt,
        })
    }

    /// 从平台层传来的原始字节构造令牌字符串
    pub fn token_from_bytes(bytes: Vec<u8>) -> Result<String> {
        String::from_utf8(bytes).map_err(|_| {
            DeviceTokenError::invalid_argument("Device token must be encoded in UTF-8")
        })
    }
}

/// Web Push 令牌为 JSON：`{"endpoint":..,"keys":{"p256dh":..,"auth":..}}`
fn build_web_push_token(endpoint: String, p256dh: &str, auth: &str) -> Result<String> {
    if endpoint.contains(',') {
        return Err(DeviceTokenError::invalid_argument("Illegal endpoint value"));
    }
    if !is_base64url(p256dh) {
        return Err(DeviceTokenError::invalid_argument(
            "Public key must be base64url-encoded",
        ));
    }
    if !is_base64url(auth) {
        return Err(DeviceTokenError::invalid_argument(
            "Authentication secret must be base64url-encoded",
        ));
    }

    let endpoint = clean_input_string(&endpoint);
    if endpoint.is_empty() {
        return Ok(String::new());
    }

    let token = serde_json::json!({
        "endpoint": endpoint,
        "keys": {
            "p256dh": p256dh,
            "auth": auth,
        }
    });
    Ok(token.to_string())
}

/// base64url 校验：允许省略 padding，但 padding 存在时总长度必须是 4 的倍数
pub fn is_base64url(input: &str) -> bool {
    let trimmed = input.trim_end_matches('=');
    let padding_length = input.len() - trimmed.len();
    if padding_length >= 3 {
        return false;
    }
    if padding_length != 0 && input.len() % 4 != 0 {
        return false;
    }
    BASE64URL_LENIENT.decode(trimmed).is_ok()
}

/// 清洗用户输入
///
/// - `\t`、`\n` 以外的控制字符替换为空格，`\r` 直接删除
/// - 删除行/段分隔符与方向控制符（U+2028..=U+202E）
/// - 删除会破坏排版的组合字符（U+030A、U+0333、U+033F）
fn clean_input_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        let cleaned = match c {
            '\r' => continue,
            '\t' | '\n' => c,
            c if (c as u32) < 0x20 => ' ',
            '\u{2028}'..='\u{202E}' => continue,
            '\u{030A}' | '\u{0333}' | '\u{033F}' => continue,
            c => c,
        };
        if result.len() + cleaned.len_utf8() > INPUT_STRING_LENGTH_LIMIT {
            break;
        }
        result.push(cleaned);
    }
    result
}
