//! 网络助手：端口映射、地址族、地址规范化与加密策略分区。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

/// HTTPS 监听端口相对基准端口的偏移。
pub(crate) const PORT_HTTPS_OFFSET: i32 = -5;
/// 明文 HTTP 监听端口相对基准端口的偏移。
pub(crate) const PORT_HTTP_OFFSET: i32 = 0;

/// 未配对/明文请求上报的占位 MAC。
pub(crate) const PLACEHOLDER_MAC: &str = "00:00:00:00:00:00";

/// 由基准端口与偏移算出实际端口。
pub(crate) fn map_port(base: u16, offset: i32) -> u16 {
    (base as i32 + offset) as u16
}

/// 监听地址族。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddressFamily {
    V4,
    Both,
}

/// 解析配置文本；未知值回退到双栈。
pub(crate) fn af_from_enum_string(raw: &str) -> AddressFamily {
    match raw.trim().to_ascii_lowercase().as_str() {
        "ipv4" | "v4" => AddressFamily::V4,
        _ => AddressFamily::Both,
    }
}

/// 地址族对应的通配监听地址。
pub(crate) fn bind_addr(af: AddressFamily, port: u16) -> SocketAddr {
    match af {
        AddressFamily::V4 => SocketAddr::from(([0, 0, 0, 0], port)),
        AddressFamily::Both => SocketAddr::from(([0u16; 8], port)),
    }
}

/// 规范化地址文本：v4-mapped IPv6 还原成 IPv4。
pub(crate) fn addr_to_normalized_string(addr: IpAddr) -> String {
    normalize(addr).to_string()
}

/// URL 可嵌入的地址文本：IPv6 加方括号。
pub(crate) fn addr_to_url_escaped_string(addr: IpAddr) -> String {
    match normalize(addr) {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// RTSP 加密要求。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EncryptionMode {
    Never,
    Opportunistic,
    Mandatory,
}

impl EncryptionMode {
    /// 配置数值映射；越界回退到 Opportunistic。
    pub(crate) fn from_config(raw: u8) -> Self {
        match raw {
            0 => EncryptionMode::Never,
            2 => EncryptionMode::Mandatory,
            _ => EncryptionMode::Opportunistic,
        }
    }
}

/// 按对端地址分区选择加密策略：LAN 用 lan_mode，其余用 wan_mode。
pub(crate) fn encryption_mode_for_address(
    addr: IpAddr,
    lan_mode: EncryptionMode,
    wan_mode: EncryptionMode,
) -> EncryptionMode {
    if is_lan_address(addr) { lan_mode } else { wan_mode }
}

/// LAN 地址判定：回环、RFC1918、链路本地、CGNAT、IPv6 ULA。
pub(crate) fn is_lan_address(addr: IpAddr) -> bool {
    match normalize(addr) {
        IpAddr::V4(v4) => {
            if v4.is_loopback() || v4.is_private() || v4.is_link_local() {
                return true;
            }
            // 100.64.0.0/10 (CGNAT)
            let octets = v4.octets();
            octets[0] == 100 && (64..=127).contains(&octets[1])
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// 本机局域网 MAC 地址；取第一个非回环接口，取不到则用占位值。
pub(crate) fn get_mac_address(_local_addr: &str) -> String {
    let Ok(entries) = std::fs::read_dir(Path::new("/sys/class/net")) else {
        return PLACEHOLDER_MAC.to_string();
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name == "lo" {
            continue;
        }
        if let Ok(raw) = std::fs::read_to_string(entry.path().join("address")) {
            let mac = raw.trim();
            if !mac.is_empty() && mac != PLACEHOLDER_MAC {
                return mac.to_string();
            }
        }
    }
    PLACEHOLDER_MAC.to_string()
}

/// 请求来自 IPv6 且非 v4-mapped 时，LocalIP 返回该占位地址。
pub(crate) fn local_ip_for_client(local: IpAddr) -> String {
    match local {
        IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => {
            IpAddr::V4(Ipv4Addr::LOCALHOST).to_string()
        }
        other => addr_to_normalized_string(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn port_offsets_follow_base() {
        assert_eq!(map_port(47989, PORT_HTTPS_OFFSET), 47984);
        assert_eq!(map_port(47989, PORT_HTTP_OFFSET), 47989);
        assert_eq!(map_port(47989, crate::stream::RTSP_SETUP_PORT_OFFSET), 48010);
    }

    #[test]
    fn v4_mapped_addresses_are_unwrapped() {
        let mapped: IpAddr = "::ffff:192.168.1.7".parse().unwrap();
        assert_eq!(addr_to_normalized_string(mapped), "192.168.1.7");
        assert_eq!(addr_to_url_escaped_string(mapped), "192.168.1.7");

        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(addr_to_url_escaped_string(v6), "[fe80::1]");
    }

    #[test]
    fn lan_classification() {
        for lan in ["127.0.0.1", "10.1.2.3", "192.168.0.4", "100.64.1.1", "fd00::1"] {
            assert!(is_lan_address(lan.parse().unwrap()), "{lan} should be lan");
        }
        for wan in ["8.8.8.8", "100.128.0.1", "2001:db8::1"] {
            assert!(!is_lan_address(wan.parse().unwrap()), "{wan} should be wan");
        }
    }

    #[test]
    fn encryption_mode_splits_by_zone() {
        let mode = encryption_mode_for_address(
            "192.168.1.2".parse().unwrap(),
            EncryptionMode::Never,
            EncryptionMode::Mandatory,
        );
        assert_eq!(mode, EncryptionMode::Never);

        let mode = encryption_mode_for_address(
            "8.8.8.8".parse().unwrap(),
            EncryptionMode::Never,
            EncryptionMode::Mandatory,
        );
        assert_eq!(mode, EncryptionMode::Mandatory);
    }

    #[test]
    fn ipv6_local_ip_uses_v4_placeholder() {
        let v6 = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
        assert_eq!(local_ip_for_client(v6), "127.0.0.1");
        assert_eq!(local_ip_for_client("192.168.0.2".parse().unwrap()), "192.168.0.2");
    }
}
