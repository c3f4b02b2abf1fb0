//! HTTP/HTTPS 监听装配。
//!
//! 明文口只路由发现与配对引导；TLS 口要求客户端证书，握手完成后用
//! 台账校验对端，把命中的设备记录作为请求身份注入，校验失败的连接
//! 对任何请求只回 401 文档。两口都不做 keep-alive。

pub(crate) mod handlers;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::Request;
use axum::routing::get;
use hyper::body::Incoming;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::api::xml::XmlDoc;
use crate::auth::chain::VerifyError;
use crate::auth::store::NamedCert;
use crate::pairing::handlers::pair_handler;
use crate::state::AppState;

/// 请求到达的通道。
#[derive(Clone)]
pub(crate) enum Transport {
    /// 明文发现口。
    Plain,
    /// TLS 口，携带台账校验出的设备身份。
    Tls(Arc<NamedCert>),
}

/// 注入每个请求的连接上下文。
#[derive(Clone)]
pub(crate) struct RequestContext {
    pub(crate) transport: Transport,
    pub(crate) remote: SocketAddr,
    pub(crate) local: SocketAddr,
}

impl RequestContext {
    /// TLS 身份；明文请求为 None。
    pub(crate) fn verified_cert(&self) -> Option<&Arc<NamedCert>> {
        match &self.transport {
            Transport::Tls(cert) => Some(cert),
            Transport::Plain => None,
        }
    }
}

/// 明文口路由：发现与配对引导。
pub(crate) fn plain_router(state: AppState) -> Router {
    Router::new()
        .route("/serverinfo", get(handlers::serverinfo))
        .route("/pair", get(pair_handler))
        .fallback(handlers::not_found)
        .with_state(state)
}

/// TLS 口路由：全部端点。
pub(crate) fn tls_router(state: AppState) -> Router {
    Router::new()
        .route("/serverinfo", get(handlers::serverinfo))
        .route("/pair", get(pair_handler))
        .route("/applist", get(handlers::applist))
        .route("/appasset", get(handlers::appasset))
        .route("/launch", get(handlers::launch))
        .route("/resume", get(handlers::resume))
        .route("/cancel", get(handlers::cancel))
        .fallback(handlers::not_found)
        .with_state(state)
}

/// 明文监听循环。
pub(crate) async fn serve_plain(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let router = plain_router(state.clone());
    let read_timeout = state.config.request_read_timeout;
    info!("http listener ready on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("http accept failed: {err}");
                        continue;
                    }
                };
                let local = local_addr_of(&stream);
                let ctx = RequestContext {
                    transport: Transport::Plain,
                    remote,
                    local,
                };
                let router = router.clone();
                tokio::spawn(async move {
                    serve_connection(stream, router, ctx, read_timeout).await;
                });
            }
        }
    }
    Ok(())
}

/// TLS 监听循环。
pub(crate) async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let router = tls_router(state.clone());
    info!("https listener ready on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("https accept failed: {err}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let router = router.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    handle_tls_connection(stream, remote, acceptor, router, state).await;
                });
            }
        }
    }
    Ok(())
}

/// 单个 TLS 连接：握手、台账校验、身份注入或 401 服务。
async fn handle_tls_connection(
    stream: TcpStream,
    remote: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
    state: AppState,
) {
    let local = local_addr_of(&stream);
    let read_timeout = state.config.request_read_timeout;

    let tls_stream =
        match tokio::time::timeout(state.config.handshake_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(err)) => {
                debug!("tls handshake with {remote} failed: {err}");
                return;
            }
            Err(_) => {
                debug!("tls handshake with {remote} timed out");
                return;
            }
        };

    let peer_der = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.to_vec());
    let verified = match peer_der {
        Some(der) => state.verify_peer(&der).await,
        None => Err(VerifyError::NotTrusted),
    };

    match verified {
        Ok(named_cert) => {
            info!("device {} verified", named_cert.name);
            let ctx = RequestContext {
                transport: Transport::Tls(named_cert),
                remote,
                local,
            };
            serve_connection(tls_stream, router, ctx, read_timeout).await;
        }
        Err(err) => {
            warn!("certificate verification for {remote} failed: {err}");
            serve_unauthorized(tls_stream, read_timeout).await;
        }
    }
}

/// 在连接上跑 router，并把连接上下文注入每个请求。
async fn serve_connection<S>(stream: S, router: Router, ctx: RequestContext, read_timeout: Duration)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
        let router = router.clone();
        let ctx = ctx.clone();
        async move {
            req.extensions_mut().insert(ctx);
            router.oneshot(req.map(axum::body::Body::new)).await
        }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout)
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service);
    if let Err(err) = conn.await {
        debug!("connection closed with error: {err}");
    }
}

/// 未通过台账校验的连接：任何请求都只拿到 401 文档。
async fn serve_unauthorized<S>(stream: S, read_timeout: Duration)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |req: Request<Incoming>| async move {
        let doc = XmlDoc::error(
            401,
            "The client is not authorized. Certificate verification failed.",
        )
        .attr("query", req.uri().path());
        Ok::<_, Infallible>(axum::response::IntoResponse::into_response(doc))
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout)
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service);
    if let Err(err) = conn.await {
        debug!("unauthorized connection closed with error: {err}");
    }
}

fn local_addr_of(stream: &TcpStream) -> SocketAddr {
    stream
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
}
