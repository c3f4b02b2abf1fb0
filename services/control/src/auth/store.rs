//! 已配对设备台账的持久化读写。
//!
//! 状态文件为单个 JSON：`root.uniqueid` 为服务端实例 UUID，
//! `root.named_devices[*]` 为 `{name, cert, uuid}` 设备记录；
//! 旧格式 `root.devices[*].certs[*]` 只读兼容，首次保存即升级。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// 一条已配对设备记录：展示名 + 证书 PEM + 服务端分配的 UUID。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct NamedCert {
    pub(crate) name: String,
    pub(crate) cert: String,
    pub(crate) uuid: String,
}

/// 内存中的设备台账。
#[derive(Debug, Clone)]
pub(crate) struct Ledger {
    /// 服务端实例 UUID，跨重启保持。
    pub(crate) unique_id: String,
    pub(crate) devices: Vec<Arc<NamedCert>>,
}

impl Ledger {
    /// 全新台账：铸造实例 UUID，无设备。
    pub(crate) fn fresh() -> Self {
        Self {
            unique_id: Uuid::new_v4().to_string(),
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    root: StateRoot,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateRoot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uniqueid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    named_devices: Vec<NamedCert>,
    /// 旧格式设备列表，只读。
    #[serde(default, skip_serializing)]
    devices: Vec<LegacyDevice>,
}

#[derive(Debug, Deserialize)]
struct LegacyDevice {
    #[serde(default)]
    certs: Vec<String>,
}

/// 读取状态文件；缺失或损坏时返回全新台账。
pub(crate) fn load_state(path: &Path) -> Ledger {
    if !path.exists() {
        info!("state file {} doesn't exist", path.display());
        return Ledger::fresh();
    }

    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!("read state file {} failed: {err}", path.display());
            return Ledger::fresh();
        }
    };
    let parsed: StateFile = match serde_json::from_slice(&raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("decode state file {} failed: {err}", path.display());
            return Ledger::fresh();
        }
    };

    // 没有 uniqueid 说明该文件不含本服务的凭证，忽略其余内容。
    let Some(unique_id) = parsed.root.uniqueid else {
        return Ledger::fresh();
    };

    let mut devices = Vec::new();
    for legacy in parsed.root.devices {
        for cert in legacy.certs {
            devices.push(Arc::new(NamedCert {
                name: String::new(),
                cert,
                uuid: Uuid::new_v4().to_string(),
            }));
        }
    }
    for named in parsed.root.named_devices {
        devices.push(Arc::new(named));
    }

    Ledger { unique_id, devices }
}

/// 保存台账：按证书去重、分配展示名后缀，写临时文件再原子改名。
pub(crate) fn save_state(path: &Path, ledger: &Ledger) -> Result<(), String> {
    let file = StateFile {
        root: StateRoot {
            uniqueid: Some(ledger.unique_id.clone()),
            named_devices: assign_display_names(&ledger.devices),
            devices: Vec::new(),
        },
    };
    let encoded =
        serde_json::to_vec_pretty(&file).map_err(|err| format!("encode state failed: {err}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| format!("create state dir failed: {err}"))?;
    }
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state.json");
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, encoded).map_err(|err| format!("write state tmp failed: {err}"))?;
    fs::rename(&tmp, path).map_err(|err| format!("finalize state file failed: {err}"))
}

/// 去重并分配展示名：同基础名的第二条起追加 " (2)"、" (3)"，按插入顺序；重复应用不变。
pub(crate) fn assign_display_names(devices: &[Arc<NamedCert>]) -> Vec<NamedCert> {
    let mut unique_certs: HashSet<&str> = HashSet::new();
    let mut name_counts: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::new();

    for device in devices {
        if !unique_certs.insert(device.cert.as_str()) {
            continue;
        }
        let base = match device.name.find(" (") {
            Some(pos) => device.name[..pos].to_string(),
            None => device.name.clone(),
        };
        let count = name_counts.entry(base.clone()).or_insert(0);
        *count += 1;
        let final_name = if *count > 1 {
            format!("{base} ({count})")
        } else {
            base
        };
        out.push(NamedCert {
            name: final_name,
            cert: device.cert.clone(),
            uuid: device.uuid.clone(),
        });
    }
    out
}
