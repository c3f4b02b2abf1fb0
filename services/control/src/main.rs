//! 控制服务二进制入口：初始化日志后启动应用。

mod api;
mod app;
mod auth;
mod config;
mod crypto;
mod logging;
mod net;
mod pairing;
mod state;
mod stream;
mod web;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_runtime = logging::init("control")?;
    app::run().await
}
