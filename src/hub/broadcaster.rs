//! 连接管理与事件扇出
//!
//! 连接按角色分组，广播逐连接独立投递（try_send），慢连接不会阻塞
//! 其他连接。每个连接的发送队列有界：非关键事件在队列满时丢弃；
//! 关键事件（知识库补丁/快照、resolve 通知）不允许静默丢弃，队列满
//! 直接断开该连接，交给客户端的重连 + Bootstrap 恢复一致性。

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::{Push, Role};

/// 连接 ID
pub type ConnId = u64;

/// 消息发送通道
pub type MessageSender = mpsc::Sender<String>;

struct ConnEntry {
    /// Hello 之前角色未知，不参与广播
    role: Option<Role>,
    sender: MessageSender,
    /// 连续未应答的 ping 次数
    missed_pings: u32,
}

/// 连接管理器
pub struct ConnectionManager {
    conns: RwLock<HashMap<ConnId, ConnEntry>>,
    next_conn_id: RwLock<ConnId>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            next_conn_id: RwLock::new(1),
        }
    }

    /// 注册新连接，返回连接 ID
    pub fn register(&self, sender: MessageSender) -> ConnId {
        let mut next_id = self.next_conn_id.write();
        let conn_id = *next_id;
        *next_id += 1;

        self.conns.write().insert(
            conn_id,
            ConnEntry {
                role: None,
                sender,
                missed_pings: 0,
            },
        );

        tracing::debug!("连接注册: conn_id={}", conn_id);
        conn_id
    }

    /// 注销连接
    pub fn unregister(&self, conn_id: ConnId) {
        if self.conns.write().remove(&conn_id).is_some() {
            tracing::debug!("连接注销: conn_id={}", conn_id);
        }
    }

    /// Hello 时声明角色
    pub fn set_role(&self, conn_id: ConnId, role: Role) {
        if let Some(entry) = self.conns.write().get_mut(&conn_id) {
            entry.role = Some(role);
            tracing::debug!("连接角色: conn_id={}, role={}", conn_id, role);
        }
    }

    pub fn role_of(&self, conn_id: ConnId) -> Option<Role> {
        self.conns.read().get(&conn_id).and_then(|e| e.role)
    }

    /// 任意入站流量视为存活
    pub fn mark_alive(&self, conn_id: ConnId) {
        if let Some(entry) = self.conns.write().get_mut(&conn_id) {
            entry.missed_pings = 0;
        }
    }

    /// 按角色广播事件（非阻塞，fire-and-forget）
    pub fn broadcast(&self, role: Role, push: &Push) {
        let message = match serde_json::to_string(push) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                tracing::error!("事件序列化失败: {}", e);
                return;
            }
        };
        let critical = push.is_critical();

        let targets: Vec<(ConnId, MessageSender)> = {
            let conns = self.conns.read();
            conns
                .iter()
                .filter(|(_, entry)| entry.role == Some(role))
                .map(|(conn_id, entry)| (*conn_id, entry.sender.clone()))
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!("无 {} 订阅者", role);
            return;
        }

        tracing::debug!("广播事件: role={}, targets={}", role, targets.len());

        let mut to_evict = Vec::new();
        for (conn_id, sender) in targets {
            match sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if critical {
                        tracing::warn!("队列满且事件关键，断开连接: conn_id={}", conn_id);
                        to_evict.push(conn_id);
                    } else {
                        tracing::warn!("队列满，丢弃非关键事件: conn_id={}", conn_id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("通道已关闭: conn_id={}", conn_id);
                }
            }
        }

        for conn_id in to_evict {
            self.unregister(conn_id);
        }
    }

    /// 发送消息到指定连接（等待队列空位）
    pub async fn send_to(&self, conn_id: ConnId, message: String) -> bool {
        let sender = {
            let conns = self.conns.read();
            conns.get(&conn_id).map(|e| e.sender.clone())
        };

        if let Some(sender) = sender {
            sender.send(message).await.is_ok()
        } else {
            false
        }
    }

    /// 尝试发送消息到指定连接（非阻塞）
    pub fn try_send_to(&self, conn_id: ConnId, message: String) -> bool {
        let sender = {
            let conns = self.conns.read();
            conns.get(&conn_id).map(|e| e.sender.clone())
        };

        if let Some(sender) = sender {
            sender.try_send(message).is_ok()
        } else {
            false
        }
    }

    /// 下发一轮 ping，累计未应答计数，返回被淘汰的连接。
    /// 超过 max_missed 的连接被强制注销（通道随之关闭）。
    pub fn ping_round(&self, max_missed: u32) -> Vec<ConnId> {
        let ping = match serde_json::to_string(&Push::Ping) {
            Ok(json) => format!("{}\n", json),
            Err(_) => return Vec::new(),
        };

        let mut evicted = Vec::new();
        {
            let mut conns = self.conns.write();
            conns.retain(|conn_id, entry| {
                if entry.missed_pings >= max_missed {
                    tracing::warn!(
                        "连接心跳超限，强制断开: conn_id={}, missed={}",
                        conn_id,
                        entry.missed_pings
                    );
                    evicted.push(*conn_id);
                    return false;
                }
                entry.missed_pings += 1;
                let _ = entry.sender.try_send(ping.clone());
                true
            });
        }
        evicted
    }

    /// 当前连接数
    pub fn connection_count(&self) -> usize {
        self.conns.read().len()
    }

    /// 指定角色的连接数
    pub fn count_by_role(&self, role: Role) -> usize {
        self.conns
            .read()
            .values()
            .filter(|e| e.role == Some(role))
            .count()
    }

    pub fn has_connections(&self) -> bool {
        !self.conns.read().is_empty()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
