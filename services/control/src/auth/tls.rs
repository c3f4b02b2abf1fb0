//! TLS 监听配置：TLS 1.2 起步，强制客户端证书，真正的信任判定推迟到握手后。
//!
//! 内置链式校验会拒绝自签名客户端证书，因此握手阶段仅要求证书存在，
//! 台账匹配由连接层在握手完成后调用 [`crate::auth::chain::CertChain`] 完成。

use std::io::BufReader;
use std::sync::Arc;

use anyhow::Context;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};

use crate::crypto::identity::ServerIdentity;

/// 握手期证书校验器：必须出示证书，但接受任意证书。
#[derive(Debug)]
struct DeferredClientCertVerifier;

impl ClientCertVerifier for DeferredClientCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// 用服务端身份装配 rustls 配置。
pub(crate) fn server_config(identity: &ServerIdentity) -> anyhow::Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(identity.cert_pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .context("parse server cert chain")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(identity.key_pem.as_bytes()))
        .context("parse server private key")?
        .context("server key pem contains no private key")?;

    let config = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_client_cert_verifier(Arc::new(DeferredClientCertVerifier))
    .with_single_cert(certs, key)
    .context("assemble tls server config")?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity;

    #[test]
    fn server_config_builds_from_generated_identity() {
        let id = identity::generate().unwrap();
        let config = server_config(&id).unwrap();
        assert!(!config.alpn_protocols.iter().any(|p| p == b"h2"));
    }
}
