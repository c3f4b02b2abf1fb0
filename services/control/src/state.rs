//! 控制服务共享状态：台账、信任链、配对会话、OTP 槽与协作方句柄。
//!
//! 所有跨请求可变状态都收在这里，并由各自的锁保护完整的临界区。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::api::xml::XmlDoc;
use crate::auth::chain::{CertChain, VerifyError};
use crate::auth::store::{self, Ledger, NamedCert};
use crate::config::Config;
use crate::crypto;
use crate::crypto::identity::ServerIdentity;
use crate::pairing::otp::OtpSlot;
use crate::pairing::{self, PairSession, PairingState};
use crate::stream::RtspStreamer;
use crate::stream::apps::AppCatalog;
use crate::stream::video::VideoProbe;

/// 进程级共享状态。
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<Config>,
    pub(crate) identity: Arc<ServerIdentity>,
    /// 已配对设备台账（持久化）。
    pub(crate) ledger: Arc<RwLock<Ledger>>,
    /// TLS 校验用信任链，随台账重建。
    pub(crate) chain: Arc<RwLock<CertChain>>,
    /// 进行中的配对会话。
    pub(crate) pairing: Arc<Mutex<PairingState>>,
    /// OTP 单槽。
    pub(crate) otp: Arc<Mutex<Option<OtpSlot>>>,
    pub(crate) apps: Arc<AppCatalog>,
    pub(crate) rtsp: Arc<RtspStreamer>,
    pub(crate) video: Arc<VideoProbe>,
    /// resume 不一定带 localAudioPlayMode，launch 存下的值在此兜底。
    pub(crate) host_audio: Arc<AtomicBool>,
    session_counter: Arc<AtomicU32>,
}

impl AppState {
    /// 装配共享状态；非 fresh 模式下读入状态文件并重建信任链。
    pub(crate) fn new(config: Arc<Config>, identity: Arc<ServerIdentity>) -> Self {
        let ledger = if config.fresh_state {
            Ledger::fresh()
        } else {
            store::load_state(&config.state_file)
        };
        let mut chain = CertChain::new();
        chain.rebuild(&ledger);
        let apps = AppCatalog::load(&config.apps_file);

        Self {
            config,
            identity,
            ledger: Arc::new(RwLock::new(ledger)),
            chain: Arc::new(RwLock::new(chain)),
            pairing: Arc::new(Mutex::new(PairingState::default())),
            otp: Arc::new(Mutex::new(None)),
            apps: Arc::new(apps),
            rtsp: Arc::new(RtspStreamer::new()),
            video: Arc::new(VideoProbe::new()),
            host_audio: Arc::new(AtomicBool::new(false)),
            session_counter: Arc::new(AtomicU32::new(0)),
        }
    }

    /// 服务端实例 UUID。
    pub(crate) async fn unique_id(&self) -> String {
        self.ledger.read().await.unique_id.clone()
    }

    /// 下一个 LaunchSession 序号。
    pub(crate) fn next_session_id(&self) -> u32 {
        self.session_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 配对成功后的证书入账：追加、落盘、回读并重建信任链。
    pub(crate) async fn add_authorized_client(&self, cert: NamedCert) {
        info!("authorizing client {} [{}]", cert.name, cert.uuid);
        {
            let mut ledger = self.ledger.write().await;
            ledger.devices.push(Arc::new(cert));
        }
        self.persist_and_reload().await;
    }

    /// 按 UUID 解除配对；返回移除条数。
    pub(crate) async fn unpair_client(&self, uuid: &str) -> usize {
        let removed = {
            let mut ledger = self.ledger.write().await;
            let before = ledger.devices.len();
            ledger.devices.retain(|device| device.uuid != uuid);
            before - ledger.devices.len()
        };
        self.persist_and_reload().await;
        removed
    }

    /// 清空全部已配对设备。
    pub(crate) async fn erase_all_clients(&self) {
        {
            let mut ledger = self.ledger.write().await;
            ledger.devices.clear();
        }
        self.chain.write().await.clear();
        self.persist_and_reload().await;
    }

    /// 当前设备清单（展示名 + UUID）。
    pub(crate) async fn list_clients(&self) -> Vec<(String, String)> {
        self.ledger
            .read()
            .await
            .devices
            .iter()
            .map(|device| (device.name.clone(), device.uuid.clone()))
            .collect()
    }

    /// 落盘后回读，保证后续 TLS 握手看到的信任链与磁盘一致；
    /// fresh 模式下跳过磁盘，仅用内存台账重建信任链。
    async fn persist_and_reload(&self) {
        let mut ledger = self.ledger.write().await;
        if !self.config.fresh_state {
            if let Err(err) = store::save_state(&self.config.state_file, &ledger) {
                warn!("persist state failed: {err}");
            } else {
                *ledger = store::load_state(&self.config.state_file);
            }
        }
        self.chain.write().await.rebuild(&ledger);
    }

    /// TLS 握手后的对端证书校验。
    pub(crate) async fn verify_peer(&self, peer_der: &[u8]) -> Result<Arc<NamedCert>, VerifyError> {
        self.chain.read().await.verify(peer_der)
    }

    /// 签发 OTP；口令不合规时返回空串。
    pub(crate) async fn request_otp(&self, passphrase: &str, device_name: &str) -> String {
        match OtpSlot::mint(passphrase, device_name) {
            Some(slot) => {
                let pin = slot.pin.clone();
                *self.otp.lock().await = Some(slot);
                pin
            }
            None => String::new(),
        }
    }

    /// OTP 路线的阶段一应答。
    ///
    /// 槽位缺失、过期或哈希不匹配时，用随机 PIN 派生诱饵密钥并返回与
    /// 成功路径同形的应答；攻击者要到阶段四才会失败，且无从区分原因。
    pub(crate) async fn otp_phase1_reply(&self, sess: &mut PairSession, otpauth: &str) -> XmlDoc {
        let mut slot = self.otp.lock().await;
        if slot.as_ref().is_some_and(|otp| otp.expired()) {
            *slot = None;
        }
        let matched = slot.as_ref().is_some_and(|otp| {
            crypto::ct_eq(otp.auth_hash(&sess.salt).as_bytes(), otpauth.trim().as_bytes())
        });
        if matched && let Some(otp) = slot.take() {
            if !otp.device_name.is_empty() {
                sess.client.name = otp.device_name.clone();
            }
            return pairing::server_cert_reply(sess, &self.identity.cert_pem, otp.pin.as_bytes());
        }
        pairing::server_cert_reply(sess, &self.identity.cert_pem, &crypto::rand_bytes(16))
    }

    /// 宿主侧 PIN 录入：完成挂起的阶段一应答。
    pub(crate) async fn enter_pin(&self, pin: &str, name: &str) -> bool {
        let mut pairing_state = self.pairing.lock().await;
        if pairing_state.sessions.is_empty() {
            return false;
        }
        if pin.len() != 4 || !pin.chars().all(|c| c.is_ascii_digit()) {
            warn!("rejected pin entry: must be 4 digits, got {} chars", pin.len());
            return false;
        }

        let Some(key) = pairing_state.pending_pin.take() else {
            return false;
        };
        let Some(sess) = pairing_state.sessions.get_mut(&key) else {
            return false;
        };

        let doc = pairing::server_cert_reply(sess, &self.identity.cert_pem, pin.as_bytes());
        if !name.is_empty() {
            sess.client.name = name.to_string();
        }
        match sess.parked.take() {
            Some(parked) => parked.send(doc).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("beamhost-state-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_state(dir: &std::path::Path) -> AppState {
        let config = Arc::new(Config::for_tests(dir));
        let identity = Arc::new(identity::generate().unwrap());
        AppState::new(config, identity)
    }

    fn client_cert() -> (NamedCert, Vec<u8>) {
        let id = identity::generate().unwrap();
        let der = crypto::pem_to_der(&id.cert_pem).unwrap();
        (
            NamedCert {
                name: "Phone".to_string(),
                cert: id.cert_pem,
                uuid: uuid::Uuid::new_v4().to_string(),
            },
            der,
        )
    }

    #[tokio::test]
    async fn authorized_cert_survives_save_load_and_verifies() {
        let dir = temp_dir();
        let state = test_state(&dir);
        let (cert, der) = client_cert();

        assert!(state.verify_peer(&der).await.is_err());
        state.add_authorized_client(cert.clone()).await;

        let verified = state.verify_peer(&der).await.unwrap();
        assert_eq!(verified.cert, cert.cert);
        assert!(state.config.state_file.exists());

        // 重新装配进程状态，证书应从磁盘恢复。
        let state2 = test_state(&dir);
        assert!(state2.verify_peer(&der).await.is_ok());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unpair_is_idempotent() {
        let dir = temp_dir();
        let state = test_state(&dir);
        let (cert, der) = client_cert();
        state.add_authorized_client(cert).await;

        let uuid = state.list_clients().await[0].1.clone();
        assert_eq!(state.unpair_client(&uuid).await, 1);
        assert_eq!(state.unpair_client(&uuid).await, 0);
        assert!(state.verify_peer(&der).await.is_err());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn erase_all_clients_empties_ledger_and_chain() {
        let dir = temp_dir();
        let state = test_state(&dir);
        let (cert_a, der_a) = client_cert();
        let (cert_b, der_b) = client_cert();
        state.add_authorized_client(cert_a).await;
        state.add_authorized_client(cert_b).await;

        state.erase_all_clients().await;
        assert!(state.list_clients().await.is_empty());
        assert!(state.verify_peer(&der_a).await.is_err());
        assert!(state.verify_peer(&der_b).await.is_err());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn distinct_pairings_get_distinct_uuids() {
        let dir = temp_dir();
        let state = test_state(&dir);
        let (cert_a, _) = client_cert();
        let (cert_b, _) = client_cert();
        state.add_authorized_client(cert_a).await;
        state.add_authorized_client(cert_b).await;

        let clients = state.list_clients().await;
        assert_eq!(clients.len(), 2);
        assert_ne!(clients[0].1, clients[1].1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn otp_match_and_mismatch_are_wire_identical() {
        let dir = temp_dir();
        let state = test_state(&dir);
        let salt_hex = "00".repeat(16);

        let pin = state.request_otp("secret!", "Phone").await;
        assert_eq!(pin.len(), 4);
        assert!(state.request_otp("abc", "").await.is_empty());
        // 短口令拒绝不会覆盖现有槽位。
        assert!(state.otp.lock().await.is_some());

        // 正确哈希：密钥来自真实 PIN，槽位清空，名字被 OTP 覆盖。
        let mut data = Vec::new();
        data.extend_from_slice(pin.as_bytes());
        data.extend_from_slice(salt_hex.as_bytes());
        data.extend_from_slice(b"secret!");
        let good_auth = crypto::hex_encode(&crypto::sha256(&data));

        let mut sess = PairSession::new(
            "abc".into(),
            "x".into(),
            "CERT".into(),
            salt_hex.clone(),
        );
        let doc = state.otp_phase1_reply(&mut sess, &good_auth).await;
        assert!(doc.render().contains("<paired>1</paired>"));
        assert_eq!(sess.client.name, "Phone");
        let expected_key =
            crypto::aes_key_from_pin(&[0u8; 16], pin.as_bytes());
        assert_eq!(sess.cipher_key.unwrap(), expected_key);
        assert!(state.otp.lock().await.is_none());

        // 错误哈希：应答同形，但派生密钥是诱饵。
        let _ = state.request_otp("secret!", "").await;
        let mut sess2 = PairSession::new(
            "def".into(),
            "x".into(),
            "CERT".into(),
            salt_hex,
        );
        let doc = state.otp_phase1_reply(&mut sess2, "badbadbad").await;
        assert!(doc.render().contains("<paired>1</paired>"));
        assert!(doc.render().contains("plaincert"));
        assert_ne!(sess2.cipher_key.unwrap(), expected_key);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn enter_pin_completes_parked_reply() {
        let dir = temp_dir();
        let state = test_state(&dir);

        assert!(!state.enter_pin("1234", "").await);

        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let mut pairing_state = state.pairing.lock().await;
            let mut sess = PairSession::new(
                "abc".into(),
                "roth".into(),
                "CERT".into(),
                "00".repeat(16),
            );
            sess.parked = Some(tx);
            pairing_state.sessions.insert("abc".into(), sess);
            pairing_state.pending_pin = Some("abc".into());
        }

        // 非法 PIN 不应消费挂起会话。
        assert!(!state.enter_pin("12", "").await);
        assert!(!state.enter_pin("abcd", "").await);
        assert!(state.pairing.lock().await.pending_pin.is_some());

        assert!(state.enter_pin("1234", "My Phone").await);

        let doc = rx.await.unwrap();
        assert!(doc.render().contains("<paired>1</paired>"));
        assert_eq!(
            state.pairing.lock().await.sessions["abc"].client.name,
            "My Phone"
        );

        let _ = std::fs::remove_dir_all(dir);
    }
}
