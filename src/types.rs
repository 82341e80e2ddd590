//! 数据类型定义

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 当前毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 求助请求状态
///
/// 状态迁移单向：pending → resolved 或 pending → timed_out，
/// 终结态之间不可再迁移。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Resolved,
    TimedOut,
}

impl RequestStatus {
    /// 是否为终结态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "resolved" => Ok(RequestStatus::Resolved),
            "timed_out" => Ok(RequestStatus::TimedOut),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Resolved => write!(f, "resolved"),
            RequestStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// 求助请求
///
/// Agent 遇到无法回答的问题时升级给人工主管。
/// 只有 Hub 可以写入；Agent / Observer 只读。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpRequest {
    pub id: String,
    /// 客户标识（电话号码等来电方身份）
    pub customer_reference: String,
    /// 问题原文
    pub question: String,
    pub status: RequestStatus,
    /// 主管的回答（仅 resolved 时存在）
    pub answer: Option<String>,
    /// 解决人（主管标识）
    pub resolved_by: Option<String>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
    pub timed_out_at: Option<i64>,
}

impl HelpRequest {
    /// 创建新请求（初始状态恒为 pending）
    pub fn new(question: &str, customer_reference: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            customer_reference: customer_reference.to_string(),
            question: question.to_string(),
            status: RequestStatus::Pending,
            answer: None,
            resolved_by: None,
            created_at: now_millis(),
            resolved_at: None,
            timed_out_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 知识库条目
///
/// 由 resolve 产生（upsert by normalized_key），核心内不做硬删除。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    /// 问题原文
    pub question: String,
    /// 归一化 key（大小写/空白/标点折叠），知识库内唯一
    pub normalized_key: String,
    pub answer: String,
    /// 自由分类标签
    pub category: String,
    /// 命中次数（单调递增）
    pub usage_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 默认分类
pub const DEFAULT_CATEGORY: &str = "general";

impl KnowledgeEntry {
    /// 从问答对创建条目
    pub fn from_answer(question: &str, normalized_key: &str, answer: &str) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            question: question.to_string(),
            normalized_key: normalized_key.to_string(),
            answer: answer.to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            usage_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 请求统计（推送给 Observer 的 stats_update）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    pub total: i64,
    pub pending: i64,
    pub resolved: i64,
    pub timed_out: i64,
    /// 平均解决耗时（分钟，仅统计 resolved）
    pub avg_resolution_minutes: f64,
}
