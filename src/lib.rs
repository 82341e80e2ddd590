//! escalation-hub - 升级请求同步底座
//!
//! 为 AI 接待员的人工升级流程提供统一的状态同步层。
//!
//! # 核心功能
//!
//! - **请求登记表**: 求助请求的状态机（pending → resolved / timed_out）
//! - **知识库**: 主管回答沉淀为可复用条目，按归一化问题键去重
//! - **Hub 模式**: 唯一 Writer + 按角色扇出事件 + 超时扫描 + 心跳
//! - **Agent 副本**: 本地内存缓存，快照 Bootstrap + 增量补丁
//!
//! # Feature Flags
//!
//! - `hub`: Hub 模式（唯一 Writer + 事件推送）
//! - `client`: Hub Client（Agent / Observer 侧使用）
//!
//! # 架构
//!
//! 所有写入操作统一通过 hub-server 处理，Agent 与 Observer 只通过
//! Client 通信。这消除了多组件同时写入的冲突问题：每个状态迁移
//! 恰好发生一次，事件按角色推送给需要它的一方。

pub mod cache;
pub mod config;
pub mod error;
pub mod normalize;
pub mod protocol;
pub mod schema;
pub mod types;

#[cfg(feature = "hub")]
pub mod registry;

#[cfg(feature = "hub")]
pub mod store;

#[cfg(feature = "hub")]
pub mod hub;

#[cfg(feature = "client")]
pub mod client;

// Re-exports
pub use cache::KnowledgeCache;
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use normalize::normalize_question;
pub use types::*;

// Protocol types (always available)
pub use protocol::{Push, Request, Response, Role};

#[cfg(feature = "hub")]
pub use registry::RequestRegistry;

#[cfg(feature = "hub")]
pub use store::{SqliteStore, Store};

#[cfg(feature = "hub")]
pub use hub::{cleanup_stale_hub, is_hub_running, Hub, HubConfig};

#[cfg(feature = "client")]
pub use client::{AgentReplica, ClientConfig, HubClient, ReplicaHandle};
