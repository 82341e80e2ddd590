//! 请求分发
//!
//! 每类入站事件一个处理函数，返回类型化的结果而不是隐式副作用。
//! 顺序固定为先变更（Registry + 落库）后发布（fire-and-forget 扇出），
//! 单个订阅者投递失败不影响发起方的结果。

use std::sync::Arc;

use super::broadcaster::{ConnId, ConnectionManager};
use crate::error::Error;
use crate::protocol::{Push, Request, Response, Role};
use crate::registry::RequestRegistry;

/// Hub 版本号（跟随 crate 版本）
pub const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 请求处理器
pub struct Handler {
    registry: Arc<RequestRegistry>,
    manager: Arc<ConnectionManager>,
}

impl Handler {
    pub fn new(registry: Arc<RequestRegistry>, manager: Arc<ConnectionManager>) -> Self {
        Self { registry, manager }
    }

    /// 处理请求；返回 None 表示无需应答（pong / 已在内部应答）
    pub async fn handle(&self, conn_id: ConnId, request: Request) -> Option<Response> {
        // 任意入站流量都算一次存活证明
        self.manager.mark_alive(conn_id);

        match request {
            Request::Hello {
                role,
                component,
                version,
            } => {
                self.handle_hello(conn_id, role, &component, &version).await;
                None
            }

            Request::Escalate {
                question,
                customer_reference,
            } => Some(self.handle_escalate(&question, &customer_reference)),

            Request::Resolve {
                request_id,
                answer,
                supervisor_id,
            } => Some(self.handle_resolve(&request_id, &answer, &supervisor_id)),

            Request::ReportUsage { entry_id } => Some(self.handle_report_usage(&entry_id)),

            Request::Ping => Some(Response::Pong),

            // 对下行 ping 的应答，mark_alive 已经生效
            Request::Pong => None,
        }
    }

    /// 握手：登记角色并立即下发该角色的 Bootstrap 数据。
    /// 应答与 Bootstrap 推送走同一条 FIFO 队列，客户端先看到 hello_ok。
    async fn handle_hello(&self, conn_id: ConnId, role: Role, component: &str, version: &str) {
        tracing::info!(
            "握手: conn_id={}, role={}, component={}, version={}",
            conn_id,
            role,
            component,
            version
        );
        self.manager.set_role(conn_id, role);

        self.respond(
            conn_id,
            &Response::HelloOk {
                hub_version: HUB_VERSION.to_string(),
            },
        )
        .await;

        match role {
            Role::Agent => match self.registry.knowledge_snapshot() {
                Ok(entries) => {
                    tracing::info!("下发知识库快照: conn_id={}, entries={}", conn_id, entries.len());
                    self.push_to(conn_id, &Push::KbSnapshot(entries)).await;
                }
                Err(e) => {
                    // 没有快照就不能保留 agent 连接：后续补丁会落在
                    // 空缓存上。注销让对端重连重试 Bootstrap。
                    tracing::error!("知识库快照读取失败，断开连接: conn_id={}, {}", conn_id, e);
                    self.manager.unregister(conn_id);
                }
            },
            Role::Observer => {
                self.push_to(conn_id, &Push::PendingRequests(self.registry.list_pending()))
                    .await;
                match self.registry.stats() {
                    Ok(stats) => self.push_to(conn_id, &Push::StatsUpdate(stats)).await,
                    Err(e) => tracing::error!("统计读取失败: {}", e),
                }
            }
        }
    }

    /// Agent 升级问题：落库 → 通知 observer
    fn handle_escalate(&self, question: &str, customer_reference: &str) -> Response {
        match self.registry.create(question, customer_reference) {
            Ok(request) => {
                let request_id = request.id.clone();
                self.manager.broadcast(Role::Observer, &Push::NewRequest(request));
                self.broadcast_stats();
                Response::Escalated { request_id }
            }
            Err(e) => {
                tracing::error!("升级失败: {}", e);
                error_response(&e)
            }
        }
    }

    /// 主管解决请求：请求终结 + 知识库 upsert → 分别通知 observer 和 agent。
    /// 知识库补丁在 Registry 的序列化点内发布，并发 resolve 撞到同一
    /// normalized_key 时补丁顺序与落库顺序一致。
    fn handle_resolve(&self, request_id: &str, answer: &str, supervisor_id: &str) -> Response {
        let result = self
            .registry
            .resolve_with(request_id, answer, supervisor_id, |_, entry| {
                self.manager
                    .broadcast(Role::Agent, &Push::KbUpdated(entry.clone()));
            });

        match result {
            Ok((request, _entry)) => {
                self.manager.broadcast(
                    Role::Observer,
                    &Push::RequestResolved {
                        request_id: request.id.clone(),
                    },
                );
                self.broadcast_stats();
                Response::Resolved {
                    request_id: request.id,
                }
            }
            Err(e) => {
                match &e {
                    // 状态机拒绝是正常业务路径
                    Error::NotFound(_) | Error::AlreadyTerminal { .. } => {
                        tracing::warn!("解决被拒绝: id={}, {}", request_id, e)
                    }
                    _ => tracing::error!("解决失败: id={}, {}", request_id, e),
                }
                error_response(&e)
            }
        }
    }

    fn handle_report_usage(&self, entry_id: &str) -> Response {
        match self.registry.record_usage(entry_id) {
            Ok(()) => Response::Ok,
            Err(e) => {
                tracing::error!("命中计数失败: entry_id={}, {}", entry_id, e);
                error_response(&e)
            }
        }
    }

    /// 超时扫描结果的发布（由 Hub 的定时器调用）
    pub fn publish_timeouts(&self, expired: &[crate::types::HelpRequest]) {
        for request in expired {
            self.manager.broadcast(
                Role::Observer,
                &Push::RequestTimeout {
                    request_id: request.id.clone(),
                },
            );
        }
        if !expired.is_empty() {
            self.broadcast_stats();
        }
    }

    fn broadcast_stats(&self) {
        match self.registry.stats() {
            Ok(stats) => self.manager.broadcast(Role::Observer, &Push::StatsUpdate(stats)),
            Err(e) => tracing::error!("统计读取失败: {}", e),
        }
    }

    async fn respond(&self, conn_id: ConnId, response: &Response) {
        if let Ok(json) = serde_json::to_string(response) {
            self.manager.send_to(conn_id, format!("{}\n", json)).await;
        }
    }

    async fn push_to(&self, conn_id: ConnId, push: &Push) {
        if let Ok(json) = serde_json::to_string(push) {
            self.manager.send_to(conn_id, format!("{}\n", json)).await;
        }
    }
}

/// 错误到线上响应的映射
pub fn error_response(error: &Error) -> Response {
    let code = match error {
        Error::NotFound(_) => 404,
        Error::AlreadyTerminal { .. } => 409,
        _ => 500,
    };
    Response::Error {
        code,
        message: error.to_string(),
    }
}
