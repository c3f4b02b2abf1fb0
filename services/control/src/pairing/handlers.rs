//! `/pair` 路由处理：按判别参数分发到各配对阶段。

use std::collections::HashMap;

use axum::extract::{Query, State};
use tokio::sync::oneshot;
use tracing::info;

use crate::api::xml::XmlDoc;
use crate::crypto;
use crate::crypto::identity::ServerIdentity;
use crate::pairing::{self, PairOutcome, PairSession};
use crate::state::AppState;

/// 配对入口；明文与 TLS 监听共用。
pub(crate) async fn pair_handler(
    State(state): State<AppState>,
    Query(args): Query<HashMap<String, String>>,
) -> XmlDoc {
    if !state.config.enable_pairing {
        return XmlDoc::error(403, "Pairing is disabled for this instance");
    }
    let Some(unique_id) = args.get("uniqueid").cloned() else {
        return XmlDoc::error(400, "Missing uniqueid parameter");
    };

    if let Some(phrase) = args.get("phrase") {
        return match phrase.as_str() {
            "getservercert" => phase_one(&state, unique_id, &args).await,
            "pairchallenge" => {
                let mut doc = XmlDoc::with_status(200);
                doc.put("paired", 1);
                doc
            }
            _ => invalid_request(),
        };
    }
    if let Some(challenge) = args.get("clientchallenge") {
        return with_session(&state, &unique_id, |sess, identity| {
            pairing::client_challenge_reply(sess, identity, challenge)
        })
        .await;
    }
    if let Some(response) = args.get("serverchallengeresp") {
        return with_session(&state, &unique_id, |sess, identity| {
            pairing::server_challenge_reply(sess, identity, response)
        })
        .await;
    }
    if let Some(secret) = args.get("clientpairingsecret") {
        return phase_four(&state, &unique_id, secret).await;
    }

    invalid_request()
}

/// 阶段一：建档会话，走 OTP、stdin 或挂起等待宿主 PIN。
async fn phase_one(state: &AppState, unique_id: String, args: &HashMap<String, String>) -> XmlDoc {
    let (Some(device_name), Some(client_cert_hex), Some(salt)) = (
        args.get("devicename"),
        args.get("clientcert"),
        args.get("salt"),
    ) else {
        return XmlDoc::error(400, "Missing a required pairing parameter");
    };

    let device_name = if device_name == "roth" {
        "Legacy Moonlight Client".to_string()
    } else {
        device_name.clone()
    };
    let cert_pem = match crypto::hex_decode(client_cert_hex).map(String::from_utf8) {
        Some(Ok(pem)) => pem,
        _ => return XmlDoc::error(400, "Malformed clientcert parameter"),
    };

    let mut sess = PairSession::new(unique_id.clone(), device_name, cert_pem, salt.clone());

    if let Some(otpauth) = args.get("otpauth") {
        let doc = state.otp_phase1_reply(&mut sess, otpauth).await;
        state
            .pairing
            .lock()
            .await
            .sessions
            .insert(unique_id, sess);
        return doc;
    }

    if state.config.pin_stdin {
        let pin = tokio::task::spawn_blocking(read_pin_from_stdin)
            .await
            .unwrap_or_default();
        let doc =
            pairing::server_cert_reply(&mut sess, &state.identity.cert_pem, pin.trim().as_bytes());
        state
            .pairing
            .lock()
            .await
            .sessions
            .insert(unique_id, sess);
        return doc;
    }

    // 挂起应答，等待宿主侧录入 PIN；同 uniqueid 的旧会话被顶替后，
    // 其挂起应答随发送端析构而解除。
    let (tx, rx) = oneshot::channel();
    sess.parked = Some(tx);
    {
        let mut pairing_state = state.pairing.lock().await;
        pairing_state.sessions.insert(unique_id.clone(), sess);
        pairing_state.pending_pin = Some(unique_id);
    }
    info!("pairing requested, waiting for a pin entry on the host");

    match rx.await {
        Ok(doc) => doc,
        Err(_) => {
            let mut doc = XmlDoc::error(400, "Pairing session interrupted");
            doc.put("paired", 0);
            doc
        }
    }
}

/// 阶段二/三的公共包装：取会话并执行，未知会话一律 400。
async fn with_session<F>(state: &AppState, unique_id: &str, run: F) -> XmlDoc
where
    F: FnOnce(&mut PairSession, &ServerIdentity) -> XmlDoc,
{
    let mut pairing_state = state.pairing.lock().await;
    match pairing_state.sessions.get_mut(unique_id) {
        Some(sess) => run(sess, &state.identity),
        None => unknown_session(),
    }
}

/// 阶段四：校验并在成功时入账；无论成败会话都在此销毁。
async fn phase_four(state: &AppState, unique_id: &str, secret_hex: &str) -> XmlDoc {
    let (doc, accepted) = {
        let mut pairing_state = state.pairing.lock().await;
        let Some(sess) = pairing_state.sessions.get_mut(unique_id) else {
            return unknown_session();
        };
        match pairing::pairing_secret_outcome(sess, secret_hex) {
            PairOutcome::Malformed(doc) => return doc,
            PairOutcome::Accepted(doc, cert) => {
                pairing_state.sessions.remove(unique_id);
                if pairing_state.pending_pin.as_deref() == Some(unique_id) {
                    pairing_state.pending_pin = None;
                }
                (doc, Some(cert))
            }
            PairOutcome::Rejected(doc) => {
                pairing_state.sessions.remove(unique_id);
                if pairing_state.pending_pin.as_deref() == Some(unique_id) {
                    pairing_state.pending_pin = None;
                }
                (doc, None)
            }
        }
    };

    if let Some(cert) = accepted {
        state.add_authorized_client(cert).await;
    }
    doc
}

fn invalid_request() -> XmlDoc {
    XmlDoc::error(404, "Invalid pairing request")
}

fn unknown_session() -> XmlDoc {
    let mut doc = XmlDoc::error(400, "Pairing not in progress for this device");
    doc.put("paired", 0);
    doc
}

fn read_pin_from_stdin() -> String {
    use std::io::{BufRead, Write};
    print!("Please insert pin: ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
    line
}
