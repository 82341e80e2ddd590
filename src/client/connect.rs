//! Hub Client 连接逻辑
//!
//! HubClient: 单连接上的请求/应答 + 推送流，自动应答下行 ping。
//! AgentReplica: Agent 侧副本，显式的重连状态机
//! （disconnected → connecting → connected），退避封顶，
//! 每次连接成功都等待全量快照重建，绝不尝试续传增量流。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

use crate::cache::KnowledgeCache;
use crate::protocol::{Push, Request, Response, Role};
use crate::types::KnowledgeEntry;

/// Client 配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 数据目录（默认 ~/.escalation-hub）
    pub data_dir: PathBuf,
    /// 组件名称（用于日志和诊断）
    pub component: String,
    pub version: String,
    /// 单次连接的重试次数
    pub connect_retries: u32,
    /// 重试间隔（毫秒）
    pub retry_interval_ms: u64,
    /// 重连退避起点（毫秒）
    pub reconnect_base_ms: u64,
    /// 重连退避上限（毫秒）
    pub reconnect_max_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".escalation-hub");

        Self {
            data_dir,
            component: "unknown".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connect_retries: 3,
            retry_interval_ms: 500,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// 创建新的配置
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            ..Default::default()
        }
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("hub.sock")
    }
}

/// Hub Client
pub struct HubClient {
    out_tx: mpsc::Sender<String>,
    push_rx: mpsc::Receiver<Push>,
    /// 等待中的一问一答（同一时刻最多一个）
    pending: Arc<Mutex<Option<oneshot::Sender<Response>>>>,
}

impl HubClient {
    /// 连接 Hub 并以指定角色握手
    pub async fn connect(config: &ClientConfig, role: Role) -> Result<Self> {
        let socket_path = config.socket_path();

        let mut stream = None;
        for attempt in 1..=config.connect_retries.max(1) {
            match UnixStream::connect(&socket_path).await {
                Ok(s) => {
                    tracing::debug!("连接 Hub 成功 (attempt={})", attempt);
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    tracing::debug!("连接 Hub 失败 (attempt={}): {}", attempt, e);
                    if attempt < config.connect_retries {
                        sleep(Duration::from_millis(config.retry_interval_ms)).await;
                    }
                }
            }
        }
        let stream =
            stream.ok_or_else(|| anyhow::anyhow!("连接 Hub 失败: {:?}", socket_path))?;

        let mut client = Self::finish_connect(stream);

        // 握手；Hub 随后按角色下发 Bootstrap 推送
        let response = client
            .request(&Request::Hello {
                role,
                component: config.component.clone(),
                version: config.version.clone(),
            })
            .await?;
        match response {
            Response::HelloOk { hub_version } => {
                tracing::info!("握手成功: role={}, hub_version={}", role, hub_version);
            }
            Response::Error { code, message } => {
                anyhow::bail!("握手失败: {} (code={})", message, code);
            }
            _ => anyhow::bail!("握手响应异常"),
        }

        Ok(client)
    }

    /// 建立读写任务
    fn finish_connect(stream: UnixStream) -> Self {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let (out_tx, mut out_rx) = mpsc::channel::<String>(100);
        let (push_tx, push_rx) = mpsc::channel::<Push>(100);
        let pending: Arc<Mutex<Option<oneshot::Sender<Response>>>> = Arc::new(Mutex::new(None));

        // 写任务
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // 读任务：按 tag 区分推送和应答；下行 ping 自动回 pong
        let pending_for_reader = pending.clone();
        let out_for_reader = out_tx.clone();
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break, // 连接关闭
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }

                        if let Ok(push) = serde_json::from_str::<Push>(trimmed) {
                            if matches!(push, Push::Ping) {
                                if let Ok(pong) = serde_json::to_string(&Request::Pong) {
                                    let _ = out_for_reader.try_send(format!("{}\n", pong));
                                }
                            }
                            if push_tx.send(push).await.is_err() {
                                break;
                            }
                        } else if let Ok(response) = serde_json::from_str::<Response>(trimmed) {
                            let waiter = pending_for_reader.lock().take();
                            match waiter {
                                Some(waiter) => {
                                    let _ = waiter.send(response);
                                }
                                // fire-and-forget 请求的 ok 应答
                                None => tracing::debug!("丢弃无等待方的应答: {:?}", response),
                            }
                        } else {
                            tracing::warn!("无法识别的消息: {}", trimmed);
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            out_tx,
            push_rx,
            pending,
        }
    }

    /// 发送请求并等待应答
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(tx);

        let json = serde_json::to_string(request)?;
        self.out_tx
            .send(format!("{}\n", json))
            .await
            .map_err(|_| anyhow::anyhow!("连接已关闭"))?;

        rx.await.map_err(|_| anyhow::anyhow!("连接已关闭"))
    }

    /// 发送请求，不等待应答（应答到达后被读任务丢弃）
    pub async fn send(&self, request: &Request) -> Result<()> {
        let json = serde_json::to_string(request)?;
        self.out_tx
            .send(format!("{}\n", json))
            .await
            .map_err(|_| anyhow::anyhow!("连接已关闭"))?;
        Ok(())
    }

    /// 升级一个无法回答的问题，返回 request_id
    pub async fn escalate(&mut self, question: &str, customer_reference: &str) -> Result<String> {
        let response = self
            .request(&Request::Escalate {
                question: question.to_string(),
                customer_reference: customer_reference.to_string(),
            })
            .await?;

        match response {
            Response::Escalated { request_id } => Ok(request_id),
            Response::Error { code, message } => {
                Err(anyhow::anyhow!("升级失败: {} (code={})", message, code))
            }
            _ => Err(anyhow::anyhow!("升级响应异常")),
        }
    }

    /// 解决一个求助请求
    pub async fn resolve(
        &mut self,
        request_id: &str,
        answer: &str,
        supervisor_id: &str,
    ) -> Result<()> {
        let response = self
            .request(&Request::Resolve {
                request_id: request_id.to_string(),
                answer: answer.to_string(),
                supervisor_id: supervisor_id.to_string(),
            })
            .await?;

        match response {
            Response::Resolved { .. } => Ok(()),
            Response::Error { code, message } => {
                Err(anyhow::anyhow!("解决失败: {} (code={})", message, code))
            }
            _ => Err(anyhow::anyhow!("解决响应异常")),
        }
    }

    /// 接收推送事件
    pub async fn recv_push(&mut self) -> Option<Push> {
        self.push_rx.recv().await
    }
}

/// 连接状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Agent 副本的查询句柄（可跨任务克隆）
#[derive(Clone)]
pub struct ReplicaHandle {
    cache: Arc<KnowledgeCache>,
    usage_tx: mpsc::UnboundedSender<String>,
}

impl ReplicaHandle {
    /// 纯内存查找；命中时异步上报权威 usage 计数。
    /// 断线期间照常服务（数据旧但可用）。
    pub fn lookup(&self, question: &str) -> Option<KnowledgeEntry> {
        let hit = self.cache.lookup(question)?;
        let _ = self.usage_tx.send(hit.id.clone());
        Some(hit)
    }

    pub fn cache(&self) -> &Arc<KnowledgeCache> {
        &self.cache
    }
}

/// Agent 侧知识库副本
///
/// run() 负责维护连接：连接成功后等待 kb_snapshot 全量重建缓存，
/// 之后应用 kb_updated 补丁；断开后按封顶指数退避重连。
pub struct AgentReplica {
    config: ClientConfig,
    cache: Arc<KnowledgeCache>,
    state: ConnState,
    usage_tx: mpsc::UnboundedSender<String>,
    usage_rx: mpsc::UnboundedReceiver<String>,
}

impl AgentReplica {
    pub fn new(config: ClientConfig) -> Self {
        let (usage_tx, usage_rx) = mpsc::unbounded_channel();
        Self {
            config,
            cache: KnowledgeCache::new(),
            state: ConnState::Disconnected,
            usage_tx,
            usage_rx,
        }
    }

    /// 查询句柄（lookup 入口）
    pub fn handle(&self) -> ReplicaHandle {
        ReplicaHandle {
            cache: self.cache.clone(),
            usage_tx: self.usage_tx.clone(),
        }
    }

    /// 连接维护循环（不返回；随任务取消而结束）
    pub async fn run(mut self) {
        let mut backoff = self.config.reconnect_base_ms.max(1);

        loop {
            tracing::debug!("副本状态: {:?} → Connecting", self.state);
            self.state = ConnState::Connecting;

            match HubClient::connect(&self.config, Role::Agent).await {
                Ok(mut client) => {
                    tracing::debug!("副本状态: {:?} → Connected", self.state);
                    self.state = ConnState::Connected;
                    backoff = self.config.reconnect_base_ms.max(1);

                    self.serve_connection(&mut client).await;

                    // 断线后继续用本地缓存服务，直到重连 Bootstrap 完成
                    tracing::warn!(
                        "连接断开，使用本地缓存继续服务 ({} 条)",
                        self.cache.len()
                    );
                }
                Err(e) => {
                    tracing::debug!("连接 Hub 失败: {}", e);
                }
            }

            self.state = ConnState::Disconnected;
            sleep(Duration::from_millis(backoff)).await;
            backoff = (backoff * 2).min(self.config.reconnect_max_ms.max(1));
        }
    }

    /// 单条连接的服务循环：消费推送 + 转发 usage 上报
    async fn serve_connection(&mut self, client: &mut HubClient) {
        loop {
            tokio::select! {
                push = client.recv_push() => {
                    match push {
                        Some(Push::KbSnapshot(entries)) => self.cache.bootstrap(entries),
                        Some(Push::KbUpdated(entry)) => self.cache.apply_patch(entry),
                        // 下行 ping 由读任务自动回 pong
                        Some(Push::Ping) => {}
                        Some(other) => {
                            tracing::debug!("忽略与 agent 无关的推送: {:?}", other);
                        }
                        None => break,
                    }
                }
                Some(entry_id) = self.usage_rx.recv() => {
                    if client.send(&Request::ReportUsage { entry_id }).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
