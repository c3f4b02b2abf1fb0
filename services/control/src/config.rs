//! 配置模块职责：
//! 1. 读取控制服务所需的环境变量并提供默认值。
//! 2. 约定状态文件、身份文件与应用清单的落盘位置。
//! 3. 提供端口推导与 bool/整数/时长解析助手。

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::net::{self, AddressFamily, EncryptionMode};
use crate::stream;

/// 基准端口默认值；HTTPS = 基准 - 5，RTSP setup = 基准 + 21。
const DEFAULT_PORT: u16 = 47989;
/// 宿主机展示名兜底值。
const DEFAULT_HOST_NAME: &str = "Beamhost";

/// 控制服务运行时配置。
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// 基准端口。
    pub(crate) port: u16,
    /// 监听地址族。
    pub(crate) address_family: AddressFamily,
    /// 配对台账状态文件。
    pub(crate) state_file: PathBuf,
    /// 服务端证书路径。
    pub(crate) cert_file: PathBuf,
    /// 服务端私钥路径。
    pub(crate) key_file: PathBuf,
    /// 应用清单路径。
    pub(crate) apps_file: PathBuf,
    /// 宿主机展示名。
    pub(crate) host_name: String,
    /// 是否允许配对。
    pub(crate) enable_pairing: bool,
    /// 全新状态模式：不读写状态文件。
    pub(crate) fresh_state: bool,
    /// 交互 PIN 从 stdin 读取。
    pub(crate) pin_stdin: bool,
    /// 并发流上限。
    pub(crate) channels: usize,
    /// LAN 对端的加密策略。
    pub(crate) lan_encryption_mode: EncryptionMode,
    /// 其余对端的加密策略。
    pub(crate) wan_encryption_mode: EncryptionMode,
    /// serverinfo 广播的宿主命令名列表。
    pub(crate) server_cmds: Vec<String>,
    /// TLS 握手超时。
    pub(crate) handshake_timeout: Duration,
    /// 请求头读取超时。
    pub(crate) request_read_timeout: Duration,
}

impl Config {
    /// 从环境变量构建配置。
    pub(crate) fn from_env() -> Self {
        let dir = config_dir();
        Self {
            port: u16_from_env("CONTROL_PORT", DEFAULT_PORT),
            address_family: net::af_from_enum_string(&env_or_default(
                "CONTROL_ADDRESS_FAMILY",
                "both",
            )),
            state_file: path_from_env("CONTROL_STATE_FILE", dir.join("state.json")),
            cert_file: path_from_env("CONTROL_CERT_FILE", dir.join("cacert.pem")),
            key_file: path_from_env("CONTROL_KEY_FILE", dir.join("cakey.pem")),
            apps_file: path_from_env("CONTROL_APPS_FILE", dir.join("apps.json")),
            host_name: std::env::var("CONTROL_HOST_NAME")
                .ok()
                .map(|raw| normalize_host_name(&raw))
                .filter(|value| !value.is_empty())
                .unwrap_or_else(detect_host_name),
            enable_pairing: bool_from_env("CONTROL_ENABLE_PAIRING", true),
            fresh_state: bool_from_env("CONTROL_FRESH_STATE", false),
            pin_stdin: bool_from_env("CONTROL_PIN_STDIN", false),
            channels: usize_from_env("CONTROL_CHANNELS", 1),
            lan_encryption_mode: EncryptionMode::from_config(u8_from_env(
                "CONTROL_LAN_ENCRYPTION_MODE",
                0,
            )),
            wan_encryption_mode: EncryptionMode::from_config(u8_from_env(
                "CONTROL_WAN_ENCRYPTION_MODE",
                1,
            )),
            server_cmds: csv_list_from_env("CONTROL_SERVER_CMDS"),
            handshake_timeout: duration_from_env("CONTROL_HANDSHAKE_TIMEOUT_SEC", 5),
            request_read_timeout: duration_from_env("CONTROL_REQUEST_TIMEOUT_SEC", 10),
        }
    }

    /// 明文监听端口。
    pub(crate) fn port_http(&self) -> u16 {
        net::map_port(self.port, net::PORT_HTTP_OFFSET)
    }

    /// TLS 监听端口。
    pub(crate) fn port_https(&self) -> u16 {
        net::map_port(self.port, net::PORT_HTTPS_OFFSET)
    }

    /// RTSP setup 端口。
    pub(crate) fn port_rtsp(&self) -> u16 {
        net::map_port(self.port, stream::RTSP_SETUP_PORT_OFFSET)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(dir: &Path) -> Self {
        Self {
            port: DEFAULT_PORT,
            address_family: AddressFamily::Both,
            state_file: dir.join("state.json"),
            cert_file: dir.join("cacert.pem"),
            key_file: dir.join("cakey.pem"),
            apps_file: dir.join("apps.json"),
            host_name: "Testhost".to_string(),
            enable_pairing: true,
            fresh_state: false,
            pin_stdin: false,
            channels: 1,
            lan_encryption_mode: EncryptionMode::Never,
            wan_encryption_mode: EncryptionMode::Opportunistic,
            server_cmds: Vec::new(),
            handshake_timeout: Duration::from_secs(5),
            request_read_timeout: Duration::from_secs(10),
        }
    }
}

/// 配置目录：`~/.config/beamhost/control`。
fn config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home)
        .join(".config")
        .join("beamhost")
        .join("control")
}

/// 推断宿主机名称：优先系统环境变量，其次系统命令。
fn detect_host_name() -> String {
    for key in ["COMPUTERNAME", "HOSTNAME"] {
        if let Ok(value) = std::env::var(key) {
            let normalized = normalize_host_name(&value);
            if !normalized.is_empty() {
                return normalized;
            }
        }
    }
    if let Ok(output) = Command::new("hostname").output() {
        let value = String::from_utf8_lossy(&output.stdout);
        let normalized = normalize_host_name(&value);
        if !normalized.is_empty() {
            return normalized;
        }
    }
    DEFAULT_HOST_NAME.to_string()
}

/// 规范化宿主机名称：去掉空白，长度限制到 64 字符。
fn normalize_host_name(raw: &str) -> String {
    raw.trim().chars().take(64).collect()
}

/// 读取环境变量；不存在时返回默认值。
fn env_or_default(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

/// 路径配置；空值回退到默认路径。
fn path_from_env(key: &str, fallback: PathBuf) -> PathBuf {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or(fallback)
}

/// 解析布尔环境变量，支持常见 true/false 文本。
fn bool_from_env(key: &str, fallback: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => true,
            "0" | "false" | "no" | "n" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

/// 读取 u16 配置，非法值回退到默认值。
fn u16_from_env(key: &str, fallback: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u16>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(fallback)
}

/// 读取 u8 配置。
fn u8_from_env(key: &str, fallback: u8) -> u8 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u8>().ok())
        .unwrap_or(fallback)
}

/// 读取 usize 配置，非法值回退到默认值。
fn usize_from_env(key: &str, fallback: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(fallback)
}

/// 读取秒级时长配置，非法值回退到默认秒数。
fn duration_from_env(key: &str, fallback_sec: u64) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(fallback_sec))
}

/// 将逗号分隔的环境变量解析为字符串列表。
fn csv_list_from_env(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ports_follow_base() {
        let config = Config::for_tests(Path::new("/tmp"));
        assert_eq!(config.port_http(), 47989);
        assert_eq!(config.port_https(), 47984);
        assert_eq!(config.port_rtsp(), 48010);
    }

    #[test]
    fn host_name_is_normalized() {
        assert_eq!(normalize_host_name("  My Host \n"), "My Host");
        let long = "x".repeat(100);
        assert_eq!(normalize_host_name(&long).len(), 64);
    }
}
