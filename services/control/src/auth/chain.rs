//! 证书信任链：对端证书与台账记录按 DER 精确匹配。

use std::fmt;
use std::sync::Arc;

use tracing::warn;
use x509_parser::prelude::*;

use crate::auth::store::{Ledger, NamedCert};
use crate::crypto;

/// 校验失败原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerifyError {
    /// 证书格式合法但不在台账内。
    NotTrusted,
    /// 对端证书无法解析。
    Malformed,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::NotTrusted => write!(f, "certificate not trusted"),
            VerifyError::Malformed => write!(f, "malformed peer certificate"),
        }
    }
}

/// 台账证书的运行时索引；每次台账重载后整体重建。
#[derive(Debug, Default)]
pub(crate) struct CertChain {
    entries: Vec<(Vec<u8>, Arc<NamedCert>)>,
}

impl CertChain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 清空索引。
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// 加入一条台账记录；PEM 无法解析时丢弃并告警。
    pub(crate) fn add(&mut self, named_cert: Arc<NamedCert>) {
        match crypto::pem_to_der(&named_cert.cert) {
            Some(der) => self.entries.push((der, named_cert)),
            None => warn!("ledger entry {} has malformed cert pem", named_cert.uuid),
        }
    }

    /// 从台账整体重建。
    pub(crate) fn rebuild(&mut self, ledger: &Ledger) {
        self.clear();
        for device in &ledger.devices {
            self.add(device.clone());
        }
    }

    /// 校验对端证书：返回匹配的台账记录或失败原因。
    pub(crate) fn verify(&self, peer_der: &[u8]) -> Result<Arc<NamedCert>, VerifyError> {
        if X509Certificate::from_der(peer_der).is_err() {
            return Err(VerifyError::Malformed);
        }
        self.entries
            .iter()
            .find(|(der, _)| der == peer_der)
            .map(|(_, named_cert)| named_cert.clone())
            .ok_or(VerifyError::NotTrusted)
    }
}
