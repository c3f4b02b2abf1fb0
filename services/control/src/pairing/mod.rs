//! 四阶段配对状态机。
//!
//! 会话按客户端自报的 `uniqueid` 建档；该标识只用于串联握手阶段，
//! 绝不作为授权主体。阶段一呈交的客户端证书要等阶段四哈希与签名
//! 双重校验通过后才进入台账。

pub(crate) mod handlers;
pub(crate) mod otp;

use std::collections::HashMap;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::api::xml::XmlDoc;
use crate::auth::store::NamedCert;
use crate::crypto;
use crate::crypto::identity::ServerIdentity;

/// 阶段一呈交的客户端资料；证书此时尚不可信。
#[derive(Debug)]
pub(crate) struct PairClient {
    pub(crate) unique_id: String,
    pub(crate) name: String,
    pub(crate) cert_pem: String,
}

/// 单个配对会话，随阶段推进逐步填充。
pub(crate) struct PairSession {
    pub(crate) client: PairClient,
    pub(crate) salt: String,
    pub(crate) cipher_key: Option<[u8; 16]>,
    pub(crate) client_hash: Vec<u8>,
    pub(crate) server_secret: Vec<u8>,
    pub(crate) server_challenge: Vec<u8>,
    /// 等待 PIN 输入时挂起的阶段一应答。
    pub(crate) parked: Option<oneshot::Sender<XmlDoc>>,
}

impl PairSession {
    pub(crate) fn new(unique_id: String, name: String, cert_pem: String, salt: String) -> Self {
        Self {
            client: PairClient {
                unique_id,
                name,
                cert_pem,
            },
            salt,
            cipher_key: None,
            client_hash: Vec::new(),
            server_secret: Vec::new(),
            server_challenge: Vec::new(),
            parked: None,
        }
    }
}

/// 配对共享状态：会话表 + 等待交互 PIN 的会话键。
#[derive(Default)]
pub(crate) struct PairingState {
    pub(crate) sessions: HashMap<String, PairSession>,
    /// 挂起应答的会话键；单槽，新会话顶替旧会话。
    pub(crate) pending_pin: Option<String>,
}

/// 阶段四结论。
pub(crate) enum PairOutcome {
    /// 输入畸形，会话保留。
    Malformed(XmlDoc),
    /// 校验通过，证书应进入台账。
    Accepted(XmlDoc, NamedCert),
    /// 哈希或签名不符。
    Rejected(XmlDoc),
}

/// 阶段一应答：校验 salt、派生会话密钥、下发服务端证书。
pub(crate) fn server_cert_reply(
    sess: &mut PairSession,
    server_cert_pem: &str,
    pin: &[u8],
) -> XmlDoc {
    if sess.salt.len() < 32 {
        let mut doc = XmlDoc::error(400, "Salt too short");
        doc.put("paired", 0);
        return doc;
    }
    let Some(salt_bytes) = sess.salt.get(..32).and_then(crypto::hex_decode) else {
        let mut doc = XmlDoc::error(400, "Malformed salt parameter");
        doc.put("paired", 0);
        return doc;
    };
    let Ok(salt) = <[u8; 16]>::try_from(salt_bytes) else {
        let mut doc = XmlDoc::error(400, "Malformed salt parameter");
        doc.put("paired", 0);
        return doc;
    };
    sess.cipher_key = Some(crypto::aes_key_from_pin(&salt, pin));

    let mut doc = XmlDoc::with_status(200);
    doc.put("paired", 1);
    doc.put("plaincert", crypto::hex_encode(server_cert_pem.as_bytes()));
    doc
}

/// 阶段二：解密客户端挑战，回发绑定服务端证书签名的挑战应答。
pub(crate) fn client_challenge_reply(
    sess: &mut PairSession,
    server: &ServerIdentity,
    challenge_hex: &str,
) -> XmlDoc {
    let Some(key) = sess.cipher_key else {
        return phase_order_error();
    };
    let Some(challenge) = crypto::hex_decode(challenge_hex) else {
        return malformed("Malformed clientchallenge");
    };
    let cipher = crypto::EcbCipher::new(&key);
    let Some(mut decrypted) = cipher.decrypt(&challenge) else {
        return malformed("Malformed clientchallenge");
    };

    let server_secret = crypto::rand_bytes(16);
    decrypted.extend_from_slice(&server.signature_bytes);
    decrypted.extend_from_slice(&server_secret);
    let hash = crypto::sha256(&decrypted);

    let server_challenge = crypto::rand_bytes(16);
    let mut plaintext = Vec::with_capacity(hash.len() + server_challenge.len());
    plaintext.extend_from_slice(&hash);
    plaintext.extend_from_slice(&server_challenge);
    let Some(encrypted) = cipher.encrypt(&plaintext) else {
        return XmlDoc::error(500, "Challenge encryption failed");
    };

    sess.server_secret = server_secret;
    sess.server_challenge = server_challenge;

    let mut doc = XmlDoc::with_status(200);
    doc.put("paired", 1);
    doc.put("challengeresponse", crypto::hex_encode(&encrypted));
    doc
}

/// 阶段三：留存客户端哈希，回发服务端机密及其签名。
pub(crate) fn server_challenge_reply(
    sess: &mut PairSession,
    server: &ServerIdentity,
    response_hex: &str,
) -> XmlDoc {
    let Some(key) = sess.cipher_key else {
        return phase_order_error();
    };
    if sess.server_secret.is_empty() {
        return phase_order_error();
    }
    let Some(encrypted) = crypto::hex_decode(response_hex) else {
        return malformed("Malformed serverchallengeresp");
    };
    let Some(decrypted) = crypto::EcbCipher::new(&key).decrypt(&encrypted) else {
        return malformed("Malformed serverchallengeresp");
    };
    sess.client_hash = decrypted;

    let signature = crypto::sign_sha256(&server.signing_key, &sess.server_secret);
    let mut pairing_secret = sess.server_secret.clone();
    pairing_secret.extend_from_slice(&signature);

    let mut doc = XmlDoc::with_status(200);
    doc.put("paired", 1);
    doc.put("pairingsecret", crypto::hex_encode(&pairing_secret));
    doc
}

/// 阶段四：恒定时间校验客户端哈希并验签；通过后铸造台账记录。
pub(crate) fn pairing_secret_outcome(sess: &mut PairSession, secret_hex: &str) -> PairOutcome {
    let Some(pairing_secret) = crypto::hex_decode(secret_hex) else {
        return PairOutcome::Malformed(malformed("Malformed clientpairingsecret"));
    };
    if pairing_secret.len() <= 16 {
        return PairOutcome::Malformed(malformed("Clientpairingsecret too short"));
    }
    if sess.client_hash.is_empty() || sess.server_challenge.is_empty() {
        return PairOutcome::Malformed(phase_order_error());
    }

    let secret = &pairing_secret[..16];
    let signature = &pairing_secret[16..];

    let verified = match crypto::pem_to_der(&sess.client.cert_pem) {
        Some(client_der) => match crypto::x509_signature_bytes(&client_der) {
            Some(client_cert_sig) => {
                let mut data = Vec::new();
                data.extend_from_slice(&sess.server_challenge);
                data.extend_from_slice(&client_cert_sig);
                data.extend_from_slice(secret);
                let expected_hash = crypto::sha256(&data);

                crypto::ct_eq(&expected_hash, &sess.client_hash)
                    && crypto::verify_sha256(&client_der, secret, signature)
            }
            None => false,
        },
        None => false,
    };

    let mut doc = XmlDoc::with_status(200);
    if !verified {
        doc.put("paired", 0);
        return PairOutcome::Rejected(doc);
    }
    doc.put("paired", 1);

    let name = sess
        .client
        .name
        .chars()
        .map(|c| match c {
            '(' => '[',
            ')' => ']',
            other => other,
        })
        .collect();
    PairOutcome::Accepted(
        doc,
        NamedCert {
            name,
            cert: sess.client.cert_pem.clone(),
            uuid: Uuid::new_v4().to_string(),
        },
    )
}

fn malformed(message: &str) -> XmlDoc {
    let mut doc = XmlDoc::error(400, message);
    doc.put("paired", 0);
    doc
}

fn phase_order_error() -> XmlDoc {
    malformed("Pairing not in progress for this device")
}
