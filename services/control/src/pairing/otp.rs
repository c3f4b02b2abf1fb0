//! 一次性 PIN 槽位：带固定时效的带外配对凭证。

use std::time::{Duration, Instant};

use crate::crypto;

/// OTP 有效期。
pub(crate) const OTP_EXPIRE: Duration = Duration::from_secs(180);

/// 进程级单槽 OTP；新请求直接覆盖旧值。
#[derive(Debug, Clone)]
pub(crate) struct OtpSlot {
    pub(crate) pin: String,
    pub(crate) passphrase: String,
    pub(crate) device_name: String,
    created_at: Instant,
}

impl OtpSlot {
    /// 铸造一个新 OTP；口令短于 4 字符时拒绝。
    pub(crate) fn mint(passphrase: &str, device_name: &str) -> Option<Self> {
        if passphrase.len() < 4 {
            return None;
        }
        Some(Self {
            pin: crypto::rand_alphabet(4, b"0123456789"),
            passphrase: passphrase.to_string(),
            device_name: device_name.to_string(),
            created_at: Instant::now(),
        })
    }

    /// 是否已过有效期。
    pub(crate) fn expired(&self) -> bool {
        self.created_at.elapsed() > OTP_EXPIRE
    }

    /// 客户端侧同样计算的认证哈希：`hex(SHA-256(pin || salt || passphrase))`。
    pub(crate) fn auth_hash(&self, salt: &str) -> String {
        let mut data = Vec::new();
        data.extend_from_slice(self.pin.as_bytes());
        data.extend_from_slice(salt.as_bytes());
        data.extend_from_slice(self.passphrase.as_bytes());
        crypto::hex_encode(&crypto::sha256(&data))
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        self.created_at -= by;
    }
}
