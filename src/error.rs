//! 错误类型定义

use crate::types::RequestStatus;
use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 请求不存在
    #[error("请求不存在: {0}")]
    NotFound(String),

    /// 请求已终结（resolve / expire 只允许作用于 pending）
    #[error("请求已终结: {id} (status={status})")]
    AlreadyTerminal { id: String, status: RequestStatus },

    /// 部分写入：请求已落库，派生的知识库写入失败。
    /// 必须对运维可见，不允许静默吞掉。
    #[error("部分写入: 请求 {request_id} 已落库，知识库写入失败: {source}")]
    PartialWrite {
        request_id: String,
        #[source]
        source: Box<Error>,
    },

    /// 连接错误
    #[error("连接错误: {0}")]
    Connection(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
