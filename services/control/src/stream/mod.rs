//! RTSP 流协作方：会话计数、LaunchSession 构造与移交。
//!
//! 控制服务只负责产出 [`LaunchSession`] 并移交；RTSP 建联、媒体传输
//! 均在此 crate 之外。

pub(crate) mod apps;
pub(crate) mod video;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use aes_gcm::Aes128Gcm;
use rand::RngCore;
use tracing::debug;

use crate::crypto;

/// RTSP setup 端口相对基准端口的偏移。
pub(crate) const RTSP_SETUP_PORT_OFFSET: i32 = 21;

/// `/launch`、`/resume` 产出并移交给 RTSP 层的会话记录。
#[derive(Clone)]
pub(crate) struct LaunchSession {
    pub(crate) id: u32,
    pub(crate) gcm_key: Vec<u8>,
    /// 16 字节 IV，前 4 字节为大端 `rikeyid`。
    pub(crate) iv: [u8; 16],
    /// `corever >= 1` 时为加密 RTSP 准备的 GCM 句柄。
    pub(crate) rtsp_cipher: Option<Aes128Gcm>,
    pub(crate) rtsp_iv_counter: u32,
    pub(crate) rtsp_url_scheme: &'static str,
    pub(crate) av_ping_payload: String,
    pub(crate) control_connect_data: u32,
    pub(crate) width: i32,
    pub(crate) height: i32,
    pub(crate) fps: i32,
    pub(crate) device_name: String,
    /// 台账分配的客户端 UUID，而非客户端自报的 uniqueid。
    pub(crate) unique_id: String,
    pub(crate) appid: i32,
    pub(crate) enable_sops: bool,
    pub(crate) surround_info: i32,
    pub(crate) surround_params: String,
    pub(crate) gcmap: i32,
    pub(crate) enable_hdr: bool,
    pub(crate) virtual_display: bool,
    pub(crate) scale_factor: i32,
    pub(crate) host_audio: bool,
}

/// 由请求参数构造会话记录；参数畸形时返回错误文案。
pub(crate) fn make_launch_session(
    id: u32,
    host_audio: bool,
    args: &HashMap<String, String>,
    client_uuid: &str,
) -> Result<LaunchSession, String> {
    let rikey = args
        .get("rikey")
        .and_then(|raw| crypto::hex_decode(raw))
        .filter(|key| key.len() >= 16)
        .ok_or_else(|| "Invalid rikey parameter".to_string())?;
    let rikeyid = args
        .get("rikeyid")
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .ok_or_else(|| "Invalid rikeyid parameter".to_string())? as u32;

    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&rikeyid.to_be_bytes());

    // mode 形如 "1920x1080x60"，缺省 0x0x0。
    let mode = args.get("mode").map(String::as_str).unwrap_or("0x0x0");
    let mut dims = mode.split('x').map(|seg| seg.parse::<i32>().unwrap_or(0));
    let width = dims.next().unwrap_or(0);
    let height = dims.next().unwrap_or(0);
    let fps = dims.next().unwrap_or(0);

    let corever = int_arg(args, "corever", 0);
    let rtsp_cipher = if corever >= 1 {
        crypto::gcm_cipher(&rikey)
    } else {
        None
    };
    let rtsp_url_scheme = if rtsp_cipher.is_some() {
        "rtspenc://"
    } else {
        "rtsp://"
    };

    let mut control_connect_data = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut control_connect_data);

    Ok(LaunchSession {
        id,
        gcm_key: rikey,
        iv,
        rtsp_cipher,
        rtsp_iv_counter: 0,
        rtsp_url_scheme,
        av_ping_payload: crypto::hex_encode(&crypto::rand_bytes(8)),
        control_connect_data: u32::from_ne_bytes(control_connect_data),
        width,
        height,
        fps,
        device_name: args
            .get("devicename")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
        unique_id: client_uuid.to_string(),
        appid: int_arg(args, "appid", 0) as i32,
        enable_sops: int_arg(args, "sops", 0) != 0,
        surround_info: int_arg(args, "surroundAudioInfo", 196610) as i32,
        surround_params: args.get("surroundParams").cloned().unwrap_or_default(),
        gcmap: int_arg(args, "gcmap", 0) as i32,
        enable_hdr: int_arg(args, "hdrMode", 0) != 0,
        virtual_display: int_arg(args, "virtualDisplay", 0) != 0,
        scale_factor: int_arg(args, "scaleFactor", 100) as i32,
        host_audio,
    })
}

/// 读取整数参数；缺省用 default，存在但非数字按 0 处理。
fn int_arg(args: &HashMap<String, String>, name: &str, default: i64) -> i64 {
    match args.get(name) {
        Some(raw) => raw.trim().parse::<i64>().unwrap_or(0),
        None => default,
    }
}

/// RTSP 协作方句柄：活跃会话计数与待建联会话槽。
pub(crate) struct RtspStreamer {
    active: AtomicUsize,
    pending: Mutex<Option<LaunchSession>>,
}

impl RtspStreamer {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            pending: Mutex::new(None),
        }
    }

    /// 当前活跃 RTSP 会话数。
    pub(crate) fn session_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// RTSP 层会话建立/断开时回调。
    pub(crate) fn session_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn session_ended(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// 移交一条新会话，等待 RTSP setup 消费。
    pub(crate) fn launch_session_raise(&self, session: LaunchSession) {
        debug!(
            "raising launch session {} for device {}",
            session.id, session.device_name
        );
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
    }

    /// RTSP 层取走待建联会话。
    pub(crate) fn take_pending(&self) -> Option<LaunchSession> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> HashMap<String, String> {
        let mut args = HashMap::new();
        args.insert("rikey".to_string(), "00".repeat(16));
        args.insert("rikeyid".to_string(), "305419896".to_string()); // 0x12345678
        args
    }

    #[test]
    fn iv_prefix_is_big_endian_rikeyid() {
        let session = make_launch_session(1, false, &base_args(), "uuid").unwrap();
        assert_eq!(&session.iv[..4], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&session.iv[4..], &[0u8; 12]);
    }

    #[test]
    fn plaintext_rtsp_without_corever() {
        let session = make_launch_session(1, false, &base_args(), "uuid").unwrap();
        assert!(session.rtsp_cipher.is_none());
        assert_eq!(session.rtsp_url_scheme, "rtsp://");
        assert_eq!(session.width, 0);
        assert_eq!(session.surround_info, 196610);
        assert_eq!(session.scale_factor, 100);
    }

    #[test]
    fn encrypted_rtsp_with_corever() {
        let mut args = base_args();
        args.insert("corever".to_string(), "1".to_string());
        args.insert("mode".to_string(), "1920x1080x60".to_string());

        let session = make_launch_session(2, true, &args, "uuid").unwrap();
        assert!(session.rtsp_cipher.is_some());
        assert_eq!(session.rtsp_url_scheme, "rtspenc://");
        assert_eq!((session.width, session.height, session.fps), (1920, 1080, 60));
        assert!(session.host_audio);
        assert_eq!(session.av_ping_payload.len(), 16);
    }

    #[test]
    fn short_rikey_is_rejected() {
        let mut args = base_args();
        args.insert("rikey".to_string(), "0011".to_string());
        assert!(make_launch_session(1, false, &args, "uuid").is_err());
    }

    #[test]
    fn streamer_counts_sessions() {
        let streamer = RtspStreamer::new();
        assert_eq!(streamer.session_count(), 0);
        streamer.session_started();
        assert_eq!(streamer.session_count(), 1);
        streamer.session_ended();
        assert_eq!(streamer.session_count(), 0);
    }
}
