//! 通信协议定义
//!
//! 通信方式：Unix Socket + JSONL（每条消息一行 JSON + '\n'）。
//! 消息统一为 {"type": ..., "data": ...} 形式，tag 使用 snake_case，
//! 与管理后台的 WebSocket 事件名保持一致。

use serde::{Deserialize, Serialize};

use crate::types::{HelpRequest, KnowledgeEntry, RequestStats};

/// 连接角色
///
/// - `agent`: 接待 Agent，接收知识库快照与补丁
/// - `observer`: 主管侧观察者（管理后台），接收请求生命周期事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Observer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Agent => write!(f, "agent"),
            Role::Observer => write!(f, "observer"),
        }
    }
}

/// 请求类型（Client → Hub）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Request {
    /// 握手，声明角色；Hub 随后立即下发该角色的 Bootstrap 数据
    Hello {
        role: Role,
        /// 组件名称（用于日志和诊断）
        component: String,
        version: String,
    },

    /// Agent 升级无法回答的问题
    Escalate {
        question: String,
        customer_reference: String,
    },

    /// 主管解决请求
    Resolve {
        request_id: String,
        answer: String,
        supervisor_id: String,
    },

    /// Agent 上报一次缓存命中（权威 usage_count +1）
    ReportUsage { entry_id: String },

    /// 心跳探测
    Ping,

    /// 对 Hub 下行 ping 的应答
    Pong,
}

/// 响应类型（Hub → Client，一问一答）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
    /// 成功
    Ok,

    /// 握手成功
    HelloOk { hub_version: String },

    /// 升级已受理
    Escalated { request_id: String },

    /// 解决已受理
    Resolved { request_id: String },

    /// 错误（400 载荷非法 / 404 不存在 / 409 已终结 / 500 存储）
    Error { code: i32, message: String },

    /// 对 ping 的应答
    Pong,
}

/// 推送事件（Hub → 订阅方，按角色扇出）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Push {
    /// 新的求助请求（→ observer）
    NewRequest(HelpRequest),

    /// 请求已解决（→ observer）
    RequestResolved { request_id: String },

    /// 请求已超时（→ observer；知识库未变化，agent 不受影响）
    RequestTimeout { request_id: String },

    /// 连接时的 pending 列表（→ observer，新的在前）
    PendingRequests(Vec<HelpRequest>),

    /// 统计推送（→ observer）
    StatsUpdate(RequestStats),

    /// 知识库全量快照（→ agent，连接时 Bootstrap）
    KbSnapshot(Vec<KnowledgeEntry>),

    /// 知识库增量补丁（→ agent）
    KbUpdated(KnowledgeEntry),

    /// Hub 下行心跳探测
    Ping,
}

impl Push {
    /// 关键事件：队列满时不可丢弃，只能断开连接，
    /// 由客户端重连 + Bootstrap 恢复一致性。
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Push::KbSnapshot(_) | Push::KbUpdated(_) | Push::RequestResolved { .. }
        )
    }
}
