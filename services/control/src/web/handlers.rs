//! 信息、应用与会话端点。

use std::collections::HashMap;

use axum::Extension;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{error, info, warn};

use crate::api::xml::{XmlDoc, XmlNode};
use crate::net;
use crate::state::AppState;
use crate::stream::{self, video};
use crate::web::{RequestContext, Transport};

/// GameStream 兼容层上报的固定 GFE 版本。
const GFE_VERSION: &str = "3.23.0.74";
/// serverinfo 的服务状态标记，客户端按 `_SERVER_BUSY` 后缀判断占用。
const SERVER_STATE_BUSY: &str = "SUNSHINE_SERVER_BUSY";
const SERVER_STATE_FREE: &str = "SUNSHINE_SERVER_FREE";

/// 并发流达到上限时的提示。
const CHANNEL_LIMIT_MESSAGE: &str =
    "The host's concurrent stream limit has been reached. Stop an existing stream or increase the channel limit.";
const ENCODER_FAILURE_MESSAGE: &str =
    "Failed to initialize video capture/encoding. Is a display connected and turned on?";

/// 未匹配路径的兜底应答。
pub(crate) async fn not_found() -> XmlDoc {
    XmlDoc::with_status(404).http_status(StatusCode::NOT_FOUND)
}

/// `/serverinfo`：两个口共用；MAC 与宿主命令只对已验证的 TLS 请求暴露。
pub(crate) async fn serverinfo(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(args): Query<HashMap<String, String>>,
) -> XmlDoc {
    let mut pair_status = 0;
    if let Some(cert) = ctx.verified_cert() {
        info!("device {} requested server info", cert.name);
        if args.contains_key("uniqueid") {
            pair_status = 1;
        }
    }

    let mut doc = XmlDoc::with_status(200);
    doc.put("hostname", &state.config.host_name);
    doc.put("appversion", env!("CARGO_PKG_VERSION"));
    doc.put("GfeVersion", GFE_VERSION);
    doc.put("uniqueid", state.unique_id().await);
    doc.put("HttpsPort", state.config.port_https());
    doc.put("ExternalPort", state.config.port_http());
    doc.put(
        "MaxLumaPixelsHEVC",
        if state.video.active_hevc_mode() > 1 {
            video::MAX_LUMA_PIXELS_HEVC
        } else {
            "0"
        },
    );

    match &ctx.transport {
        Transport::Tls(_) => {
            doc.put(
                "mac",
                net::get_mac_address(&net::addr_to_normalized_string(ctx.local.ip())),
            );
            for cmd in &state.config.server_cmds {
                doc.put("ServerCommand", cmd);
            }
        }
        Transport::Plain => {
            // 明文请求给占位 MAC，客户端会忽略。
            doc.put("mac", net::PLACEHOLDER_MAC);
        }
    }

    doc.put("LocalIP", net::local_ip_for_client(ctx.local.ip()));
    doc.put("ServerCodecModeSupport", state.video.codec_mode_flags());

    let current_appid = state.apps.running();
    doc.put("PairStatus", pair_status);
    doc.put("currentgame", current_appid);
    doc.put(
        "state",
        if current_appid > 0 {
            SERVER_STATE_BUSY
        } else {
            SERVER_STATE_FREE
        },
    );
    doc
}

/// `/applist`：枚举可启动应用。
pub(crate) async fn applist(State(state): State<AppState>) -> XmlDoc {
    let mut doc = XmlDoc::with_status(200);
    let hdr_supported = state.video.active_hevc_mode() == 3;
    for app in state.apps.apps() {
        let mut node = XmlNode::new("App");
        node.put("IsHdrSupported", if hdr_supported { 1 } else { 0 });
        node.put("AppTitle", &app.name);
        node.put("ID", app.id);
        doc.push(node);
    }
    doc
}

/// `/appasset`：按 appid 下发 PNG 封面。
pub(crate) async fn appasset(
    State(state): State<AppState>,
    Query(args): Query<HashMap<String, String>>,
) -> Response {
    let appid = args
        .get("appid")
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .unwrap_or(0);
    let Some(image) = state.apps.image(appid) else {
        return XmlDoc::error(404, "Cannot find requested application").into_response();
    };
    match tokio::fs::read(&image).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "image/png"),
                (header::CONNECTION, "close"),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => {
            warn!("read app image {} failed: {err}", image.display());
            XmlDoc::error(404, "Cannot find app asset").into_response()
        }
    }
}

/// `/launch`：校验、构造 LaunchSession、执行应用并移交 RTSP。
pub(crate) async fn launch(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(args): Query<HashMap<String, String>>,
) -> XmlDoc {
    let Some(named_cert) = ctx.verified_cert().cloned() else {
        return XmlDoc::error(401, "Launch requires a verified client");
    };

    if state.rtsp.session_count() >= state.config.channels {
        let mut doc = XmlDoc::error(503, CHANNEL_LIMIT_MESSAGE);
        doc.put("resume", 0);
        return doc;
    }

    if args.get("rikey").is_none()
        || args.get("rikeyid").is_none()
        || args.get("localAudioPlayMode").is_none()
        || args.get("appid").is_none()
    {
        let mut doc = XmlDoc::error(400, "Missing a required launch parameter");
        doc.put("resume", 0);
        return doc;
    }

    if state.apps.running() > 0 {
        let mut doc = XmlDoc::error(400, "An app is already running on this host");
        doc.put("resume", 0);
        return doc;
    }

    let host_audio = args
        .get("localAudioPlayMode")
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .unwrap_or(0)
        != 0;
    state
        .host_audio
        .store(host_audio, std::sync::atomic::Ordering::SeqCst);

    let session =
        match stream::make_launch_session(state.next_session_id(), host_audio, &args, &named_cert.uuid)
        {
            Ok(session) => session,
            Err(message) => {
                let mut doc = XmlDoc::error(400, message);
                doc.put("gamesession", 0);
                return doc;
            }
        };

    if session.rtsp_cipher.is_none() && mandatory_encryption(&state, &ctx) {
        error!("rejecting client that cannot comply with mandatory encryption requirement");
        let mut doc = XmlDoc::error(
            403,
            "Encryption is mandatory for this host but unsupported by the client",
        );
        doc.put("gamesession", 0);
        return doc;
    }

    if session.appid > 0 {
        let Some(app) = state.apps.find(session.appid).cloned() else {
            error!("couldn't find app with id [{}]", session.appid);
            let mut doc = XmlDoc::error(404, "Cannot find requested application");
            doc.put("gamesession", 0);
            return doc;
        };
        let err = state.apps.execute(session.appid, &app, &session);
        if err != 0 {
            let mut doc = XmlDoc::error(
                err,
                if err == 503 {
                    ENCODER_FAILURE_MESSAGE
                } else {
                    "Failed to start the specified application"
                },
            );
            doc.put("gamesession", 0);
            return doc;
        }
    }

    let mut doc = XmlDoc::with_status(200);
    doc.put("sessionUrl0", session_url(&state, &ctx, session.rtsp_url_scheme));
    doc.put("gamesession", 1);
    state.rtsp.launch_session_raise(session);
    doc
}

/// `/resume`：要求已有应用在运行；会话数归零时先重探编码器。
pub(crate) async fn resume(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(args): Query<HashMap<String, String>>,
) -> XmlDoc {
    let Some(named_cert) = ctx.verified_cert().cloned() else {
        return XmlDoc::error(401, "Resume requires a verified client");
    };

    if state.rtsp.session_count() >= state.config.channels {
        let mut doc = XmlDoc::error(503, CHANNEL_LIMIT_MESSAGE);
        doc.put("resume", 0);
        return doc;
    }

    if state.apps.running() == 0 {
        let mut doc = XmlDoc::error(503, "No running app to resume");
        doc.put("resume", 0);
        return doc;
    }

    if args.get("rikey").is_none() || args.get("rikeyid").is_none() {
        let mut doc = XmlDoc::error(400, "Missing a required resume parameter");
        doc.put("resume", 0);
        return doc;
    }

    if state.rtsp.session_count() == 0 {
        // 会话归零后 GPU 环境可能已经变化，先确认编码器仍可用。
        if state.video.probe_encoders() {
            let mut doc = XmlDoc::error(503, ENCODER_FAILURE_MESSAGE);
            doc.put("resume", 0);
            return doc;
        }
        if let Some(raw) = args.get("localAudioPlayMode") {
            let host_audio = raw.trim().parse::<i32>().unwrap_or(0) != 0;
            state
                .host_audio
                .store(host_audio, std::sync::atomic::Ordering::SeqCst);
        }
    }

    let host_audio = state.host_audio.load(std::sync::atomic::Ordering::SeqCst);
    let session =
        match stream::make_launch_session(state.next_session_id(), host_audio, &args, &named_cert.uuid)
        {
            Ok(session) => session,
            Err(message) => {
                let mut doc = XmlDoc::error(400, message);
                doc.put("gamesession", 0);
                return doc;
            }
        };

    if session.rtsp_cipher.is_none() && mandatory_encryption(&state, &ctx) {
        error!("rejecting client that cannot comply with mandatory encryption requirement");
        let mut doc = XmlDoc::error(
            403,
            "Encryption is mandatory for this host but unsupported by the client",
        );
        doc.put("gamesession", 0);
        return doc;
    }

    let mut doc = XmlDoc::with_status(200);
    doc.put("sessionUrl0", session_url(&state, &ctx, session.rtsp_url_scheme));
    doc.put("resume", 1);
    state.rtsp.launch_session_raise(session);
    doc
}

/// `/cancel`：RTSP 会话全部断开后才允许终止应用。
pub(crate) async fn cancel(State(state): State<AppState>) -> XmlDoc {
    if state.rtsp.session_count() != 0 {
        let mut doc = XmlDoc::error(503, "All sessions must be disconnected before quitting");
        doc.put("resume", 0);
        return doc;
    }

    let mut doc = XmlDoc::with_status(200);
    doc.put("cancel", 1);
    if state.apps.running() > 0 {
        state.apps.terminate();
    }
    doc
}

/// 对端是否落在“强制加密”分区。
fn mandatory_encryption(state: &AppState, ctx: &RequestContext) -> bool {
    net::encryption_mode_for_address(
        ctx.remote.ip(),
        state.config.lan_encryption_mode,
        state.config.wan_encryption_mode,
    ) == net::EncryptionMode::Mandatory
}

/// RTSP 接入地址。
fn session_url(state: &AppState, ctx: &RequestContext, scheme: &str) -> String {
    format!(
        "{scheme}{}:{}",
        net::addr_to_url_escaped_string(ctx.local.ip()),
        state.config.port_rtsp()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::NamedCert;
    use crate::config::Config;
    use crate::crypto::identity;
    use crate::net::EncryptionMode;
    use std::sync::Arc;

    fn test_state(configure: impl FnOnce(&mut Config)) -> (AppState, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("beamhost-web-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = Config::for_tests(&dir);
        configure(&mut config);
        let identity = Arc::new(identity::generate().unwrap());
        (AppState::new(Arc::new(config), identity), dir)
    }

    fn tls_ctx() -> RequestContext {
        RequestContext {
            transport: Transport::Tls(Arc::new(NamedCert {
                name: "Phone".to_string(),
                cert: "CERT".to_string(),
                uuid: "ledger-uuid".to_string(),
            })),
            remote: "192.168.1.50:40000".parse().unwrap(),
            local: "192.168.1.2:47984".parse().unwrap(),
        }
    }

    fn plain_ctx() -> RequestContext {
        RequestContext {
            transport: Transport::Plain,
            remote: "192.168.1.50:40000".parse().unwrap(),
            local: "192.168.1.2:47989".parse().unwrap(),
        }
    }

    fn launch_args() -> HashMap<String, String> {
        let mut args = HashMap::new();
        args.insert("rikey".to_string(), "00".repeat(16));
        args.insert("rikeyid".to_string(), "1".to_string());
        args.insert("localAudioPlayMode".to_string(), "1".to_string());
        args.insert("appid".to_string(), "1".to_string());
        args
    }

    #[tokio::test]
    async fn serverinfo_hides_mac_from_plaintext() {
        let (state, dir) = test_state(|_| {});
        let doc = serverinfo(
            State(state.clone()),
            Extension(plain_ctx()),
            Query(HashMap::new()),
        )
        .await;
        let rendered = doc.render();
        assert!(rendered.contains("<mac>00:00:00:00:00:00</mac>"));
        assert!(rendered.contains("<PairStatus>0</PairStatus>"));
        assert!(rendered.contains("<state>SUNSHINE_SERVER_FREE</state>"));
        assert!(rendered.contains("<HttpsPort>47984</HttpsPort>"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn serverinfo_reports_pair_status_on_tls() {
        let (state, dir) = test_state(|_| {});
        let mut args = HashMap::new();
        args.insert("uniqueid".to_string(), "abc".to_string());

        let doc = serverinfo(State(state.clone()), Extension(tls_ctx()), Query(args)).await;
        assert!(doc.render().contains("<PairStatus>1</PairStatus>"));

        state.apps.mark_running(1);
        let doc = serverinfo(
            State(state),
            Extension(tls_ctx()),
            Query(HashMap::new()),
        )
        .await;
        let rendered = doc.render();
        assert!(rendered.contains("<currentgame>1</currentgame>"));
        assert!(rendered.contains("<state>SUNSHINE_SERVER_BUSY</state>"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn launch_rejects_at_channel_capacity() {
        let (state, dir) = test_state(|_| {});
        state.rtsp.session_started();

        let doc = launch(State(state.clone()), Extension(tls_ctx()), Query(launch_args())).await;
        let rendered = doc.render();
        assert!(rendered.contains("status_code=\"503\""));
        assert!(rendered.contains("<resume>0</resume>"));
        assert!(rendered.contains("concurrent stream limit"));
        assert!(state.rtsp.take_pending().is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn launch_requires_all_parameters() {
        let (state, dir) = test_state(|_| {});
        let mut args = launch_args();
        args.remove("rikeyid");

        let doc = launch(State(state), Extension(tls_ctx()), Query(args)).await;
        assert!(doc.render().contains("status_code=\"400\""));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn launch_enforces_mandatory_encryption() {
        let (state, dir) = test_state(|config| {
            config.wan_encryption_mode = EncryptionMode::Mandatory;
        });
        let mut ctx = tls_ctx();
        ctx.remote = "8.8.8.8:40000".parse().unwrap();

        let doc = launch(State(state.clone()), Extension(ctx), Query(launch_args())).await;
        let rendered = doc.render();
        assert!(rendered.contains("status_code=\"403\""));
        assert!(rendered.contains("<gamesession>0</gamesession>"));
        assert!(state.rtsp.take_pending().is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn launch_raises_session_with_ledger_uuid() {
        let (state, dir) = test_state(|_| {});
        let doc = launch(State(state.clone()), Extension(tls_ctx()), Query(launch_args())).await;
        let rendered = doc.render();
        assert!(rendered.contains("status_code=\"200\""));
        assert!(rendered.contains("<gamesession>1</gamesession>"));
        assert!(rendered.contains("<sessionUrl0>rtsp://192.168.1.2:48010</sessionUrl0>"));

        let session = state.rtsp.take_pending().unwrap();
        assert_eq!(session.unique_id, "ledger-uuid");
        assert!(session.host_audio);
        assert_eq!(state.apps.running(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn launch_rejects_unknown_app() {
        let (state, dir) = test_state(|_| {});
        let mut args = launch_args();
        args.insert("appid".to_string(), "42".to_string());

        let doc = launch(State(state.clone()), Extension(tls_ctx()), Query(args)).await;
        let rendered = doc.render();
        assert!(rendered.contains("status_code=\"404\""));
        assert!(state.rtsp.take_pending().is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn second_launch_while_running_is_rejected() {
        let (state, dir) = test_state(|_| {});
        let _ = launch(State(state.clone()), Extension(tls_ctx()), Query(launch_args())).await;
        let _ = state.rtsp.take_pending();

        let doc = launch(State(state), Extension(tls_ctx()), Query(launch_args())).await;
        let rendered = doc.render();
        assert!(rendered.contains("status_code=\"400\""));
        assert!(rendered.contains("already running"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn resume_requires_running_app() {
        let (state, dir) = test_state(|_| {});
        let doc = resume(State(state), Extension(tls_ctx()), Query(launch_args())).await;
        let rendered = doc.render();
        assert!(rendered.contains("status_code=\"503\""));
        assert!(rendered.contains("No running app to resume"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn resume_reprobes_encoders_when_idle() {
        let (state, dir) = test_state(|_| {});
        state.apps.mark_running(1);
        state.video.set_probe_failed(true);

        let doc = resume(State(state.clone()), Extension(tls_ctx()), Query(launch_args())).await;
        let rendered = doc.render();
        assert!(rendered.contains("status_code=\"503\""));
        assert!(rendered.contains("video capture"));

        state.video.set_probe_failed(false);
        let doc = resume(State(state), Extension(tls_ctx()), Query(launch_args())).await;
        assert!(doc.render().contains("<resume>1</resume>"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn cancel_refuses_while_rtsp_live() {
        let (state, dir) = test_state(|_| {});
        state.apps.mark_running(1);
        state.rtsp.session_started();

        let doc = cancel(State(state.clone())).await;
        assert!(doc.render().contains("status_code=\"503\""));
        assert_eq!(state.apps.running(), 1);

        state.rtsp.session_ended();
        let doc = cancel(State(state.clone())).await;
        assert!(doc.render().contains("<cancel>1</cancel>"));
        assert_eq!(state.apps.running(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn applist_reports_hdr_with_hevc_main10() {
        let (state, dir) = test_state(|_| {});
        state.video.set_modes(3, 1);

        let doc = applist(State(state)).await;
        let rendered = doc.render();
        assert!(rendered.contains("<App>"));
        assert!(rendered.contains("<IsHdrSupported>1</IsHdrSupported>"));
        assert!(rendered.contains("<AppTitle>Desktop</AppTitle>"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
