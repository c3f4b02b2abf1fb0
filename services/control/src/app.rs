//! 应用装配：配置与状态加载、双监听启动、停机信号桥接。

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use crate::auth;
use crate::config::Config;
use crate::crypto::identity;
use crate::net;
use crate::state::AppState;
use crate::web;

/// 控制服务入口：任一监听失败都会触发另一侧停机。
pub(crate) async fn run() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    let identity = Arc::new(
        identity::load_or_create(&config.cert_file, &config.key_file)
            .context("load server identity")?,
    );
    let tls_config = auth::tls::server_config(&identity)?;
    let state = AppState::new(config.clone(), identity);

    let http_addr = net::bind_addr(config.address_family, config.port_http());
    let https_addr = net::bind_addr(config.address_family, config.port_https());
    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("bind http listener on {http_addr}"))?;
    let https_listener = TcpListener::bind(https_addr)
        .await
        .with_context(|| format!("bind https listener on {https_addr}"))?;

    info!(
        "control server for host '{}' on ports [{}, {}]",
        config.host_name,
        config.port_http(),
        config.port_https()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let acceptor = TlsAcceptor::from(tls_config);

    let plain_task = {
        let state = state.clone();
        let rx = shutdown_rx.clone();
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = web::serve_plain(http_listener, state, rx).await {
                error!("http listener failed: {err}");
                let _ = tx.send(true);
            }
        })
    };
    let tls_task = {
        let state = state.clone();
        let rx = shutdown_rx.clone();
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = web::serve_tls(https_listener, acceptor, state, rx).await {
                error!("https listener failed: {err}");
                let _ = tx.send(true);
            }
        })
    };

    let mut shutdown_rx = shutdown_rx;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        _ = shutdown_rx.changed() => {}
    }
    let _ = shutdown_tx.send(true);

    let _ = plain_task.await;
    let _ = tls_task.await;
    info!("control server stopped");
    Ok(())
}
