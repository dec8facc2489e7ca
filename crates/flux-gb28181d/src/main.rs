use anyhow::Context;
use clap::Parser;
use flux_config::{ConfigLoader, GatewayConfig};
use flux_gb28181::store::{create_tables, Store};
use flux_gb28181::{Gateway, ZlmClient};
use sea_orm::Database;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

mod api;
mod logging;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// 配置目录，读取其中的 gb28181.toml
    #[arg(long, default_value = "./config")]
    config_dir: PathBuf,

    /// 覆盖 api.bind
    #[arg(long)]
    http_bind: Option<String>,

    /// 打印默认配置后退出
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.dump_config {
        println!("{}", ConfigLoader::render_default()?);
        return Ok(());
    }

    let mut config = ConfigLoader::new(&args.config_dir)
        .load_gateway()
        .with_context(|| format!("failed to load config from {}", args.config_dir.display()))?;
    if let Some(bind) = args.http_bind {
        config.api.bind = bind;
    }
    logging::init(&config.log)?;

    let addr: SocketAddr = config
        .api
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api.bind {}: {}", config.api.bind, e))?;

    let store = connect_store(&config).await?;
    let media = Arc::new(ZlmClient::new(&config.media)?);
    let gateway = Gateway::bootstrap(config, store, media).await?;

    let (shutdown, _) = broadcast::channel(1);
    let tasks = gateway.start(&shutdown);
    tokio::spawn(forward_ctrl_c(shutdown.clone()));

    tracing::info!(
        target: "gb28181d",
        http = %addr,
        sip = %gateway.sip().local_addr(),
        "flux-gb28181d listening"
    );

    let mut stopped = shutdown.subscribe();
    let served = axum::Server::bind(&addr)
        .serve(api::router(gateway.clone()).into_make_service())
        .with_graceful_shutdown(async move {
            let _ = stopped.recv().await;
        })
        .await;

    // HTTP 异常退出时也要停掉 SIP 与后台任务
    let _ = shutdown.send(());
    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            tracing::warn!(target: "gb28181d", "Background task did not stop in time");
        }
    }

    served.context("http server error")?;
    tracing::info!(target: "gb28181d", "flux-gb28181d stopped");
    Ok(())
}

async fn forward_ctrl_c(shutdown: broadcast::Sender<()>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!(target: "gb28181d", "Received Ctrl+C, shutting down"),
        Err(e) => tracing::error!(target: "gb28181d", "Failed to listen for Ctrl+C: {}", e),
    }
    let _ = shutdown.send(());
}

/// 连接数据库并建表；SQLite 文件所在目录不存在时先创建
async fn connect_store(config: &GatewayConfig) -> anyhow::Result<Store> {
    let url = &config.database.url;
    if let Some(dir) = sqlite_dir(url) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create database dir {}", dir.display()))?;
    }

    let db = Database::connect(url.as_str())
        .await
        .with_context(|| format!("failed to connect database {}", url))?;
    create_tables(&db).await.context("failed to create tables")?;
    tracing::info!(target: "gb28181d", "Database ready");
    Ok(Store::new(Arc::new(db)))
}

fn sqlite_dir(url: &str) -> Option<&Path> {
    let path = url.strip_prefix("sqlite://")?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(':') {
        return None;
    }
    Path::new(path).parent().filter(|p| !p.as_os_str().is_empty())
}
