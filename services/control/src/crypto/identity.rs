//! 服务端身份：自签名 RSA 证书与私钥的加载或首次生成。

use std::fs;
use std::path::Path;

use anyhow::{Context, anyhow};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::pkcs1v15::SigningKey;
use sha2::Sha256;

/// 自签名证书的 CN。
const CERT_COMMON_NAME: &str = "Beamhost Gamestream Host";

/// 服务端密钥材料，进程启动时加载一次。
pub(crate) struct ServerIdentity {
    /// 证书 PEM，配对阶段以 hex 形式下发给客户端。
    pub(crate) cert_pem: String,
    /// 私钥 PEM，TLS 监听与配对签名共用。
    pub(crate) key_pem: String,
    /// 证书 DER。
    pub(crate) cert_der: Vec<u8>,
    /// 证书签名字段原始字节，配对哈希的绑定值。
    pub(crate) signature_bytes: Vec<u8>,
    /// RSA-SHA256 签名密钥。
    pub(crate) signing_key: SigningKey<Sha256>,
}

/// 读取配置路径下的证书与私钥；不存在则生成并落盘，已存在但损坏则报错终止。
pub(crate) fn load_or_create(cert_path: &Path, key_path: &Path) -> anyhow::Result<ServerIdentity> {
    if cert_path.exists() && key_path.exists() {
        let cert_pem = fs::read_to_string(cert_path)
            .with_context(|| format!("read server cert: {}", cert_path.display()))?;
        let key_pem = fs::read_to_string(key_path)
            .with_context(|| format!("read server key: {}", key_path.display()))?;
        return from_pems(cert_pem, key_pem);
    }

    tracing::info!("no server certificate found, generating a new identity");
    let identity = generate()?;
    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create identity dir: {}", parent.display()))?;
        }
    }
    fs::write(cert_path, &identity.cert_pem)
        .with_context(|| format!("write server cert: {}", cert_path.display()))?;
    fs::write(key_path, &identity.key_pem)
        .with_context(|| format!("write server key: {}", key_path.display()))?;
    Ok(identity)
}

/// 生成 RSA-2048 自签名身份。
pub(crate) fn generate() -> anyhow::Result<ServerIdentity> {
    let rsa_key =
        RsaPrivateKey::new(&mut rsa::rand_core::OsRng, 2048).context("generate rsa key")?;
    let key_der = rsa_key.to_pkcs8_der().context("encode key to pkcs8 der")?;
    let key_pair =
        KeyPair::try_from(key_der.as_bytes()).map_err(|err| anyhow!("rcgen key pair: {err}"))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CERT_COMMON_NAME);
    params.distinguished_name = dn;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|err| anyhow!("self-sign server cert: {err}"))?;
    from_pems(cert.pem(), key_pair.serialize_pem())
}

/// 从 PEM 文本装配身份；任一字段无法解析视为致命错误。
fn from_pems(cert_pem: String, key_pem: String) -> anyhow::Result<ServerIdentity> {
    let cert_der = super::pem_to_der(&cert_pem).context("server cert pem is malformed")?;
    let signature_bytes =
        super::x509_signature_bytes(&cert_der).context("server cert has no signature field")?;

    let rsa_key = RsaPrivateKey::from_pkcs8_pem(&key_pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&key_pem))
        .context("server key pem is malformed")?;

    Ok(ServerIdentity {
        cert_pem,
        key_pem,
        cert_der,
        signature_bytes,
        signing_key: SigningKey::<Sha256>::new(rsa_key),
    })
}
