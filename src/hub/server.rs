//! Hub 服务器
//!
//! Unix Socket 服务：接入 Agent / Observer 连接，串行化所有写入，
//! 扇出状态变更事件，并运行超时扫描与心跳两个后台定时器。

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::interval;

use super::broadcaster::ConnectionManager;
use super::handler::Handler;
use crate::config::StoreConfig;
use crate::protocol::{Request, Response};
use crate::registry::RequestRegistry;
use crate::store::SqliteStore;

/// 每连接发送队列上限
const SEND_QUEUE_SIZE: usize = 100;

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 数据目录（默认 ~/.escalation-hub）
    pub data_dir: PathBuf,
    /// pending 请求超时时长（秒，默认 24 小时）
    pub request_timeout_secs: u64,
    /// 超时扫描间隔（秒）
    pub sweep_interval_secs: u64,
    /// 心跳下发间隔（秒）
    pub ping_interval_secs: u64,
    /// 连续未应答多少次 ping 后断开
    pub max_missed_pings: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".escalation-hub");

        Self {
            data_dir,
            request_timeout_secs: 24 * 3600,
            sweep_interval_secs: 60,
            ping_interval_secs: 15,
            max_missed_pings: 3,
        }
    }
}

impl HubConfig {
    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("hub.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("hub.pid")
    }

    /// 数据库路径
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("escalation-hub.db")
    }
}

/// Hub 服务
pub struct Hub {
    config: HubConfig,
    registry: Arc<RequestRegistry>,
    manager: Arc<ConnectionManager>,
    handler: Arc<Handler>,
    shutdown: Arc<AtomicBool>,
}

impl Hub {
    /// 创建 Hub（打开存储并恢复 pending 请求）
    pub fn new(config: HubConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).context("创建数据目录失败")?;

        let store = Arc::new(SqliteStore::open(&StoreConfig::local(config.db_path()))?);
        let registry = Arc::new(RequestRegistry::new(store)?);
        let manager = Arc::new(ConnectionManager::new());
        let handler = Arc::new(Handler::new(registry.clone(), manager.clone()));

        Ok(Self {
            config,
            registry,
            manager,
            handler,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 运行 Hub
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.write_pid_file()?;

        // 清理旧的 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

        tracing::info!("🚀 Hub 启动: {:?}", socket_path);

        // 超时扫描
        let hub_for_sweep = self.clone();
        tokio::spawn(async move {
            hub_for_sweep.expiry_sweeper().await;
        });

        // 心跳
        let hub_for_ping = self.clone();
        tokio::spawn(async move {
            hub_for_ping.liveness_pinger().await;
        });

        // 接受连接
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let hub = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = hub.handle_connection(stream).await {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    self.shutdown.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    /// 处理单个连接
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let (tx, mut rx) = mpsc::channel::<String>(SEND_QUEUE_SIZE);

        // 发送端全部交给 manager；注销后通道关闭，发送任务随之退出，
        // 对端观察到写半关闭后走重连 + Bootstrap
        let conn_id = self.manager.register(tx);
        tracing::debug!("📥 新连接: conn_id={}", conn_id);

        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // 连接关闭
                Ok(_) => {
                    let request: Request = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("解析请求失败: {}", e);
                            let response = Response::Error {
                                code: 400,
                                message: format!("Invalid JSON: {}", e),
                            };
                            let resp_json = serde_json::to_string(&response)?;
                            self.manager.try_send_to(conn_id, format!("{}\n", resp_json));
                            continue;
                        }
                    };

                    if let Some(response) = self.handler.handle(conn_id, request).await {
                        let resp_json = serde_json::to_string(&response)?;
                        if !self.manager.send_to(conn_id, format!("{}\n", resp_json)).await {
                            // 已被 manager 淘汰（队列溢出 / 心跳超限）
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("读取失败: {}", e);
                    break;
                }
            }
        }

        // 连接关闭只停止对它的投递，已触发的 Registry 变更照常完成
        self.manager.unregister(conn_id);
        write_handle.abort();
        tracing::debug!("📤 连接关闭: conn_id={}", conn_id);

        Ok(())
    }

    /// 超时扫描定时器
    async fn expiry_sweeper(&self) {
        let timeout_ms = (self.config.request_timeout_secs * 1000) as i64;
        let mut sweep_interval = interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        sweep_interval.tick().await; // 跳过立即触发的第一次

        loop {
            sweep_interval.tick().await;
            let expired = self.registry.expire_overdue(timeout_ms);
            if !expired.is_empty() {
                tracing::info!("⏰ 超时扫描: {} 个请求终结", expired.len());
                self.handler.publish_timeouts(&expired);
            }
        }
    }

    /// 心跳定时器
    async fn liveness_pinger(&self) {
        let mut ping_interval = interval(Duration::from_secs(self.config.ping_interval_secs.max(1)));
        ping_interval.tick().await;

        loop {
            ping_interval.tick().await;
            let evicted = self.manager.ping_round(self.config.max_missed_pings);
            if !evicted.is_empty() {
                tracing::warn!("心跳淘汰连接: {:?}", evicted);
            }
        }
    }

    /// 写入 PID 文件
    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        fs::write(&pid_path, pid.to_string())?;
        fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
        Ok(())
    }

    /// 清理资源
    fn cleanup(&self) {
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        let pid_path = self.config.pid_path();
        if pid_path.exists() {
            let _ = fs::remove_file(&pid_path);
        }

        tracing::info!("🧹 Hub 清理完成");
    }
}

/// 检查 Hub 是否正在运行
pub fn is_hub_running(config: &HubConfig) -> bool {
    let pid_path = config.pid_path();
    if !pid_path.exists() {
        return false;
    }

    let pid_str = match fs::read_to_string(&pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // 检查进程是否存在
    unsafe { libc::kill(pid, 0) == 0 }
}

/// 清理残留的 Hub 状态
pub fn cleanup_stale_hub(config: &HubConfig) -> Result<()> {
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
        tracing::debug!("🧹 删除残留 socket: {:?}", socket_path);
    }

    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
        tracing::debug!("🧹 删除残留 PID 文件: {:?}", pid_path);
    }

    Ok(())
}
