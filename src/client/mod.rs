//! Hub Client 模块
//!
//! 提供连接 Hub 的客户端功能：
//! - `HubClient`: 底层连接（请求/应答 + 推送流）
//! - `AgentReplica`: Agent 侧知识库副本（重连 + Bootstrap）

mod connect;

pub use connect::{AgentReplica, ClientConfig, ConnState, HubClient, ReplicaHandle};
