//! 请求登记表与升级状态机
//!
//! Hub 独占写入：所有并发的 resolve / expire 通过同一把锁串行化，
//! 同一请求最多只有一次 pending → 终结态的迁移，第二个竞争者拿到
//! AlreadyTerminal。知识库补丁的发布回调同样在锁内执行，发布顺序
//! 恒等于落库顺序。落库失败按有限次数重试，重试耗尽后上抛；请求落库
//! 成功但知识库写入失败时上抛 PartialWrite，不允许静默丢失。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::normalize::normalize_question;
use crate::store::Store;
use crate::types::{now_millis, HelpRequest, KnowledgeEntry, RequestStats, RequestStatus};

/// 落库重试次数
const PUT_RETRIES: u32 = 3;

/// 请求登记表
pub struct RequestRegistry {
    store: Arc<dyn Store>,
    /// 内存中只保留 pending 请求（启动时从存储重建）；终结后移除，
    /// 终结态的判定回退到存储
    requests: Mutex<HashMap<String, HelpRequest>>,
}

impl RequestRegistry {
    /// 创建登记表并从存储恢复 pending 请求
    pub fn new(store: Arc<dyn Store>) -> Result<Self> {
        let pending = store.list_pending_requests()?;
        if !pending.is_empty() {
            tracing::info!("恢复 {} 个 pending 请求", pending.len());
        }

        let requests = pending
            .into_iter()
            .map(|request| (request.id.clone(), request))
            .collect();

        Ok(Self {
            store,
            requests: Mutex::new(requests),
        })
    }

    /// 创建新请求（恒为 pending），落库成功后才对外可见
    pub fn create(&self, question: &str, customer_reference: &str) -> Result<HelpRequest> {
        let request = HelpRequest::new(question, customer_reference);

        let mut requests = self.requests.lock();
        self.put_with_retry(&request)?;
        requests.insert(request.id.clone(), request.clone());

        tracing::info!("新求助请求: id={}, question={:?}", request.id, request.question);
        Ok(request)
    }

    /// 解决请求：请求终结 + 知识库 upsert。
    ///
    /// 两次写入从调用方视角是原子的：请求写入失败时状态不变（可重试）；
    /// 请求写入成功但知识库写入失败时返回 PartialWrite。
    pub fn resolve(
        &self,
        id: &str,
        answer: &str,
        supervisor_id: &str,
    ) -> Result<(HelpRequest, KnowledgeEntry)> {
        self.resolve_with(id, answer, supervisor_id, |_, _| {})
    }

    /// 同 resolve，额外在序列化点内执行发布回调。
    ///
    /// 并发 resolve 撞到同一 normalized_key 时，补丁的发布顺序必须与
    /// 落库顺序一致，否则副本会停留在被覆盖的旧答案上。回调在锁内
    /// 调用，必须非阻塞（try_send 扇出满足此要求）。
    pub fn resolve_with(
        &self,
        id: &str,
        answer: &str,
        supervisor_id: &str,
        publish: impl FnOnce(&HelpRequest, &KnowledgeEntry),
    ) -> Result<(HelpRequest, KnowledgeEntry)> {
        let mut requests = self.requests.lock();
        let current = self.load_for_transition(&requests, id)?;

        let mut resolved = current;
        resolved.status = RequestStatus::Resolved;
        resolved.answer = Some(answer.to_string());
        resolved.resolved_by = Some(supervisor_id.to_string());
        resolved.resolved_at = Some(now_millis());

        // 先写请求：失败则登记表不变，调用方可重试；
        // 成功后从内存表移除，终结态交还给存储
        self.put_with_retry(&resolved)?;
        requests.remove(id);

        // 再写知识库：失败升级为 PartialWrite（请求已终结，需要运维介入）
        let key = normalize_question(&resolved.question);
        let entry = KnowledgeEntry::from_answer(&resolved.question, &key, answer);
        let stored = self
            .put_entry_with_retry(&entry)
            .map_err(|e| Error::PartialWrite {
                request_id: resolved.id.clone(),
                source: Box::new(e),
            })?;

        publish(&resolved, &stored);

        tracing::info!(
            "请求已解决: id={}, supervisor={}, key={:?}",
            resolved.id,
            supervisor_id,
            stored.normalized_key
        );
        Ok((resolved, stored))
    }

    /// 将 pending 请求标记为超时（仅 Hub 内部的扫描定时器调用）
    pub fn expire(&self, id: &str) -> Result<HelpRequest> {
        let mut requests = self.requests.lock();
        let current = self.load_for_transition(&requests, id)?;

        let mut expired = current;
        expired.status = RequestStatus::TimedOut;
        expired.timed_out_at = Some(now_millis());

        self.put_with_retry(&expired)?;
        requests.remove(id);

        tracing::info!("请求超时: id={}", expired.id);
        Ok(expired)
    }

    /// 扫描并终结超过 timeout_ms 的 pending 请求，返回新终结的请求。
    /// 超时只上报一次，不重试。
    pub fn expire_overdue(&self, timeout_ms: i64) -> Vec<HelpRequest> {
        let cutoff = now_millis() - timeout_ms;

        let overdue: Vec<String> = {
            let requests = self.requests.lock();
            requests
                .values()
                .filter(|r| r.status == RequestStatus::Pending && r.created_at <= cutoff)
                .map(|r| r.id.clone())
                .collect()
        };

        let mut expired = Vec::new();
        for id in overdue {
            match self.expire(&id) {
                Ok(request) => expired.push(request),
                // resolve 抢先终结了它，不是错误
                Err(Error::AlreadyTerminal { .. }) => {}
                Err(e) => tracing::error!("超时标记失败: id={}, error={}", id, e),
            }
        }
        expired
    }

    /// pending 请求列表（新的在前）
    pub fn list_pending(&self) -> Vec<HelpRequest> {
        let requests = self.requests.lock();
        let mut pending: Vec<HelpRequest> = requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        pending
    }

    /// 请求统计
    pub fn stats(&self) -> Result<RequestStats> {
        self.store.request_stats()
    }

    /// 知识库全量快照（Agent Bootstrap 用）
    pub fn knowledge_snapshot(&self) -> Result<Vec<KnowledgeEntry>> {
        self.store.list_knowledge_entries()
    }

    /// 记录一次缓存命中（权威 usage_count +1）
    pub fn record_usage(&self, entry_id: &str) -> Result<()> {
        self.store.increment_usage(entry_id)
    }

    /// 取出待迁移的 pending 请求；不存在 → NotFound，已终结 → AlreadyTerminal。
    /// 内存表之外还回查存储，覆盖上一次进程生命周期里终结的请求。
    fn load_for_transition(
        &self,
        requests: &HashMap<String, HelpRequest>,
        id: &str,
    ) -> Result<HelpRequest> {
        let current = match requests.get(id) {
            Some(request) => request.clone(),
            None => self
                .store
                .get_request(id)?
                .ok_or_else(|| Error::NotFound(id.to_string()))?,
        };

        if current.is_terminal() {
            return Err(Error::AlreadyTerminal {
                id: current.id,
                status: current.status,
            });
        }
        Ok(current)
    }

    fn put_with_retry(&self, request: &HelpRequest) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=PUT_RETRIES {
            match self.store.put_request(request) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        "请求落库失败 (attempt={}/{}): id={}, error={}",
                        attempt,
                        PUT_RETRIES,
                        request.id,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("retry loop ran at least once"))
    }

    fn put_entry_with_retry(&self, entry: &KnowledgeEntry) -> Result<KnowledgeEntry> {
        let mut last_err = None;
        for attempt in 1..=PUT_RETRIES {
            match self.store.put_knowledge_entry(entry) {
                Ok(stored) => return Ok(stored),
                Err(e) => {
                    tracing::warn!(
                        "知识库落库失败 (attempt={}/{}): key={:?}, error={}",
                        attempt,
                        PUT_RETRIES,
                        entry.normalized_key,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("retry loop ran at least once"))
    }
}
