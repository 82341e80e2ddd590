//! Hub 模块 - 唯一 Writer + 事件推送
//!
//! Hub 是请求登记表和知识库的唯一写入者，负责：
//! - 接收 Agent 的升级事件、主管的解决事件
//! - 串行化所有状态迁移并落库（请求 → 知识库的写入顺序固定）
//! - 按角色扇出生命周期事件与知识库补丁
//! - 超时扫描与连接心跳

mod broadcaster;
mod handler;
mod server;

pub use broadcaster::{ConnId, ConnectionManager, MessageSender};
pub use handler::{error_response, Handler, HUB_VERSION};
pub use server::{cleanup_stale_hub, is_hub_running, Hub, HubConfig};
