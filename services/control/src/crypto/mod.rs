//! 配对密码学原语：密钥派生、AES、SHA-256、RSA 签名与 X.509 解析。

pub(crate) mod identity;

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use aes_gcm::Aes128Gcm;
use rand::RngCore;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x509_parser::prelude::*;

/// AES-128 块长度（字节）。
pub(crate) const AES_BLOCK_SIZE: usize = 16;

/// SHA-256 摘要。
pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// 从 salt + PIN 派生配对 AES 密钥：`SHA-256(salt || pin)` 截断到 16 字节。
pub(crate) fn aes_key_from_pin(salt: &[u8; 16], pin: &[u8]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin);
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// AES-128-ECB 无填充分组加解密；调用方自行保证 16 字节对齐。
pub(crate) struct EcbCipher {
    cipher: Aes128,
}

impl EcbCipher {
    pub(crate) fn new(key: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    /// 加密；输入非 16 字节倍数时返回 None。
    pub(crate) fn encrypt(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.is_empty() || data.len() % AES_BLOCK_SIZE != 0 {
            return None;
        }
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks(AES_BLOCK_SIZE) {
            let mut block = GenericArray::clone_from_slice(chunk);
            self.cipher.encrypt_block(&mut block);
            out.extend_from_slice(&block);
        }
        Some(out)
    }

    /// 解密；输入非 16 字节倍数时返回 None。
    pub(crate) fn decrypt(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.is_empty() || data.len() % AES_BLOCK_SIZE != 0 {
            return None;
        }
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks(AES_BLOCK_SIZE) {
            let mut block = GenericArray::clone_from_slice(chunk);
            self.cipher.decrypt_block(&mut block);
            out.extend_from_slice(&block);
        }
        Some(out)
    }
}

/// 为 RTSP 会话构造 AES-128-GCM 句柄；密钥不足 16 字节时返回 None。
pub(crate) fn gcm_cipher(key: &[u8]) -> Option<Aes128Gcm> {
    if key.len() < 16 {
        return None;
    }
    Aes128Gcm::new_from_slice(&key[..16]).ok()
}

/// RSA PKCS#1 v1.5 + SHA-256 签名。
pub(crate) fn sign_sha256(key: &SigningKey<Sha256>, data: &[u8]) -> Vec<u8> {
    key.sign(data).to_vec()
}

/// 用证书内公钥校验 RSA PKCS#1 v1.5 + SHA-256 签名；不匹配返回 false 而非错误。
pub(crate) fn verify_sha256(cert_der: &[u8], data: &[u8], sig: &[u8]) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(cert_der) else {
        return false;
    };
    let spki = &cert.tbs_certificate.subject_pki;
    let Ok(public_key) = RsaPublicKey::from_pkcs1_der(&spki.subject_public_key.data) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(sig) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(public_key)
        .verify(data, &signature)
        .is_ok()
}

/// 取出 X.509 证书的原始签名字段字节，作为配对哈希的绑定值。
pub(crate) fn x509_signature_bytes(cert_der: &[u8]) -> Option<Vec<u8>> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    Some(cert.signature_value.data.to_vec())
}

/// 解析 PEM 中第一张证书为 DER。
pub(crate) fn pem_to_der(pem: &str) -> Option<Vec<u8>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .next()?
        .ok()
        .map(|cert| cert.to_vec())
}

/// CSPRNG 随机字节。
pub(crate) fn rand_bytes(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}

/// 从给定字母表中等概率采样 n 个字符。
pub(crate) fn rand_alphabet(n: usize, alphabet: &[u8]) -> String {
    let mut rng = rand::rngs::OsRng;
    (0..n)
        .map(|_| {
            let idx = (rng.next_u32() as usize) % alphabet.len();
            alphabet[idx] as char
        })
        .collect()
}

/// 常数时间字节比较。
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// 小写无分隔 hex 编码。
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// hex 解码；接受大小写，非法字符或奇数长度返回 None。
pub(crate) fn hex_decode(raw: &str) -> Option<Vec<u8>> {
    let raw = raw.trim();
    if raw.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(raw.len() / 2);
    let bytes = raw.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_matches_truncated_digest() {
        let salt = [0x41u8; 16];
        let pin = b"1234";
        let mut concat = Vec::new();
        concat.extend_from_slice(&salt);
        concat.extend_from_slice(pin);
        let expected = &sha256(&concat)[..16];

        assert_eq!(aes_key_from_pin(&salt, pin), expected);
    }

    #[test]
    fn ecb_round_trips_aligned_input() {
        let key = [7u8; 16];
        let cipher = EcbCipher::new(&key);
        let plain = rand_bytes(48);

        let encrypted = cipher.encrypt(&plain).unwrap();
        assert_ne!(encrypted, plain);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), plain);
    }

    #[test]
    fn ecb_rejects_unaligned_input() {
        let cipher = EcbCipher::new(&[0u8; 16]);
        assert!(cipher.encrypt(&[1u8; 15]).is_none());
        assert!(cipher.decrypt(&[1u8; 17]).is_none());
        assert!(cipher.encrypt(&[]).is_none());
    }

    #[test]
    fn hex_codec_round_trips_lowercase() {
        let bytes = vec![0x00, 0x7f, 0xff, 0x10];
        let encoded = hex_encode(&bytes);
        assert_eq!(encoded, "007fff10");
        assert_eq!(hex_decode(&encoded).unwrap(), bytes);
        assert_eq!(hex_decode("AB07").unwrap(), vec![0xab, 0x07]);
        assert!(hex_decode("abc").is_none());
        assert!(hex_decode("zz").is_none());
    }

    #[test]
    fn constant_time_compare_handles_lengths() {
        assert!(ct_eq(b"abcd", b"abcd"));
        assert!(!ct_eq(b"abcd", b"abce"));
        assert!(!ct_eq(b"abcd", b"abc"));
    }

    #[test]
    fn signature_round_trips_through_certificate() {
        let identity = identity::generate().unwrap();
        let message = b"serversecret0123";

        let sig = sign_sha256(&identity.signing_key, message);
        let der = pem_to_der(&identity.cert_pem).unwrap();
        assert!(verify_sha256(&der, message, &sig));
        assert!(!verify_sha256(&der, b"something else!!", &sig));
    }

    #[test]
    fn certificate_signature_field_is_extracted() {
        let identity = identity::generate().unwrap();
        let der = pem_to_der(&identity.cert_pem).unwrap();
        let sig = x509_signature_bytes(&der).unwrap();
        // RSA-2048 自签名证书的签名字段应为 256 字节。
        assert_eq!(sig.len(), 256);
    }

    #[test]
    fn rand_alphabet_respects_alphabet() {
        let pin = rand_alphabet(4, b"0123456789");
        assert_eq!(pin.len(), 4);
        assert!(pin.chars().all(|c| c.is_ascii_digit()));
    }
}
