//! 知识库缓存（Agent 侧只读副本）
//!
//! 每个 Agent 进程持有一份，按 normalized_key 索引。(重)连接时全量
//! Bootstrap 重建，之后靠 kb_updated 补丁增量维护。缓存永远不是
//! 权威数据，可随时丢弃重建；Lookup 是纯内存操作，不碰网络和存储。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::normalize::normalize_question;
use crate::types::KnowledgeEntry;

pub struct KnowledgeCache {
    entries: RwLock<HashMap<String, KnowledgeEntry>>,
}

impl KnowledgeCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// 查找答案；命中时本地 usage_count +1（权威计数由 Hub 维护）
    pub fn lookup(&self, question: &str) -> Option<KnowledgeEntry> {
        let key = normalize_question(question);
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&key)?;
        entry.usage_count += 1;
        Some(entry.clone())
    }

    /// 全量重建本地集合（丢弃旧内容）
    pub fn bootstrap(&self, snapshot: Vec<KnowledgeEntry>) {
        let mut entries = self.entries.write();
        entries.clear();
        for entry in snapshot {
            entries.insert(entry.normalized_key.clone(), entry);
        }
        tracing::info!("知识库缓存已重建: {} 条", entries.len());
    }

    /// 按 normalized_key upsert 一条补丁；幂等，重复应用结果不变
    pub fn apply_patch(&self, entry: KnowledgeEntry) {
        let mut entries = self.entries.write();
        tracing::debug!("应用知识库补丁: key={:?}", entry.normalized_key);
        entries.insert(entry.normalized_key.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
