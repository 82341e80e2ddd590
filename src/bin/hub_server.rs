//! hub-server - 升级请求同步 Hub
//!
//! 负责：
//! - 唯一写入者（请求登记表 + 知识库）
//! - 按角色扇出生命周期事件与知识库补丁
//! - 超时扫描 + 连接心跳

use std::sync::Arc;

use anyhow::Result;
use escalation_hub::hub::{cleanup_stale_hub, is_hub_running, Hub, HubConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("escalation_hub=debug".parse()?))
        .init();

    tracing::info!("🚀 hub-server v{}", env!("CARGO_PKG_VERSION"));

    // 解析配置
    let config = HubConfig::default();

    // 检查是否已有 Hub 运行
    if is_hub_running(&config) {
        tracing::error!("❌ Hub is already running, exiting");
        std::process::exit(1);
    }

    // 清理残留状态
    if let Err(e) = cleanup_stale_hub(&config) {
        tracing::warn!("Failed to cleanup stale state: {}", e);
    }

    // 创建并运行 Hub
    let hub = Arc::new(Hub::new(config)?);
    hub.run().await?;

    tracing::info!("👋 hub-server exiting");
    Ok(())
}
