//! 存储适配层
//!
//! 只做 CRUD + 简单查询，不承载业务逻辑。接口不提供跨文档事务；
//! resolve 的两次写入（请求 → 知识库）由 Registry 负责排序和错误上报。

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::schema;
use crate::types::{HelpRequest, KnowledgeEntry, RequestStats, RequestStatus};

/// 存储接口（Hub 消费）
pub trait Store: Send + Sync {
    /// 写入请求（按 id upsert）
    fn put_request(&self, request: &HelpRequest) -> Result<()>;

    /// 读取单个请求
    fn get_request(&self, id: &str) -> Result<Option<HelpRequest>>;

    /// 列出 pending 请求（新的在前）
    fn list_pending_requests(&self) -> Result<Vec<HelpRequest>>;

    /// 写入知识库条目（按 normalized_key upsert），返回落库后的权威内容。
    /// key 冲突时保留原条目的 id / usage_count / created_at。
    fn put_knowledge_entry(&self, entry: &KnowledgeEntry) -> Result<KnowledgeEntry>;

    /// 列出全部知识库条目（新的在前）
    fn list_knowledge_entries(&self) -> Result<Vec<KnowledgeEntry>>;

    /// 命中计数 +1
    fn increment_usage(&self, id: &str) -> Result<()>;

    /// 请求统计聚合
    fn request_stats(&self) -> Result<RequestStats>;
}

/// SQLite 实现
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// 打开本地 SQLite 文件
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path: &Path = &config.path;

        // 确保目录存在
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(schema::SCHEMA_SQL)?;

        tracing::info!("数据库已连接: {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 内存数据库（用于测试）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_request(row: &Row<'_>) -> rusqlite::Result<HelpRequest> {
        let status_str: String = row.get(3)?;
        let status: RequestStatus = status_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?;

        Ok(HelpRequest {
            id: row.get(0)?,
            customer_reference: row.get(1)?,
            question: row.get(2)?,
            status,
            answer: row.get(4)?,
            resolved_by: row.get(5)?,
            created_at: row.get(6)?,
            resolved_at: row.get(7)?,
            timed_out_at: row.get(8)?,
        })
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<KnowledgeEntry> {
        Ok(KnowledgeEntry {
            id: row.get(0)?,
            question: row.get(1)?,
            normalized_key: row.get(2)?,
            answer: row.get(3)?,
            category: row.get(4)?,
            usage_count: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

const REQUEST_COLUMNS: &str =
    "id, customer_reference, question, status, answer, resolved_by, created_at, resolved_at, timed_out_at";

const ENTRY_COLUMNS: &str =
    "id, question, normalized_key, answer, category, usage_count, created_at, updated_at";

impl Store for SqliteStore {
    fn put_request(&self, request: &HelpRequest) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO help_requests \
             (id, customer_reference, question, status, answer, resolved_by, created_at, resolved_at, timed_out_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                request.id,
                request.customer_reference,
                request.question,
                request.status.to_string(),
                request.answer,
                request.resolved_by,
                request.created_at,
                request.resolved_at,
                request.timed_out_at,
            ],
        )?;
        Ok(())
    }

    fn get_request(&self, id: &str) -> Result<Option<HelpRequest>> {
        let conn = self.conn.lock();
        let request = conn
            .query_row(
                &format!("SELECT {} FROM help_requests WHERE id = ?1", REQUEST_COLUMNS),
                params![id],
                Self::row_to_request,
            )
            .optional()?;
        Ok(request)
    }

    fn list_pending_requests(&self) -> Result<Vec<HelpRequest>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM help_requests WHERE status = 'pending' ORDER BY created_at DESC",
            REQUEST_COLUMNS
        ))?;
        let requests = stmt
            .query_map([], Self::row_to_request)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(requests)
    }

    fn put_knowledge_entry(&self, entry: &KnowledgeEntry) -> Result<KnowledgeEntry> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO knowledge_entries \
             (id, question, normalized_key, answer, category, usage_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(normalized_key) DO UPDATE SET \
                 question = excluded.question, \
                 answer = excluded.answer, \
                 category = excluded.category, \
                 updated_at = excluded.updated_at",
            params![
                entry.id,
                entry.question,
                entry.normalized_key,
                entry.answer,
                entry.category,
                entry.usage_count,
                entry.created_at,
                entry.updated_at,
            ],
        )?;

        // 回读权威内容（冲突路径下 id / usage_count / created_at 来自原条目）
        let stored = conn.query_row(
            &format!(
                "SELECT {} FROM knowledge_entries WHERE normalized_key = ?1",
                ENTRY_COLUMNS
            ),
            params![entry.normalized_key],
            Self::row_to_entry,
        )?;
        Ok(stored)
    }

    fn list_knowledge_entries(&self) -> Result<Vec<KnowledgeEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM knowledge_entries ORDER BY created_at DESC",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map([], Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn increment_usage(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE knowledge_entries SET usage_count = usage_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn request_stats(&self) -> Result<RequestStats> {
        let conn = self.conn.lock();
        let (total, pending, resolved, timed_out, avg_ms) = conn.query_row(
            "SELECT COUNT(*), \
                    COALESCE(SUM(status = 'pending'), 0), \
                    COALESCE(SUM(status = 'resolved'), 0), \
                    COALESCE(SUM(status = 'timed_out'), 0), \
                    AVG(CASE WHEN status = 'resolved' THEN resolved_at - created_at END) \
             FROM help_requests",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                ))
            },
        )?;

        Ok(RequestStats {
            total,
            pending,
            resolved,
            timed_out,
            avg_resolution_minutes: avg_ms.map(|ms| ms / 60_000.0).unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_millis;

    #[test]
    fn test_request_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let request = HelpRequest::new("Do you offer botox?", "+15551234567");

        store.put_request(&request).unwrap();
        let loaded = store.get_request(&request.id).unwrap().unwrap();

        assert_eq!(loaded.id, request.id);
        assert_eq!(loaded.question, "Do you offer botox?");
        assert_eq!(loaded.status, RequestStatus::Pending);

        assert!(store.get_request("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_pending_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();

        let mut first = HelpRequest::new("q1", "c1");
        first.created_at = 1000;
        let mut second = HelpRequest::new("q2", "c2");
        second.created_at = 2000;
        let mut resolved = HelpRequest::new("q3", "c3");
        resolved.created_at = 3000;
        resolved.status = RequestStatus::Resolved;
        resolved.resolved_at = Some(3500);

        store.put_request(&first).unwrap();
        store.put_request(&second).unwrap();
        store.put_request(&resolved).unwrap();

        let pending = store.list_pending_requests().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, second.id);
        assert_eq!(pending[1].id, first.id);
    }

    #[test]
    fn test_knowledge_upsert_overwrites_in_place() {
        let store = SqliteStore::open_in_memory().unwrap();

        let original = KnowledgeEntry::from_answer("What are your hours?", "what are your hours", "9 to 7");
        let stored = store.put_knowledge_entry(&original).unwrap();
        assert_eq!(stored.id, original.id);

        store.increment_usage(&stored.id).unwrap();

        // 同 key 再次写入：覆盖内容，保留 id / usage_count / created_at
        let rewrite =
            KnowledgeEntry::from_answer("what are your HOURS", "what are your hours", "9am to 7pm");
        let updated = store.put_knowledge_entry(&rewrite).unwrap();

        assert_eq!(updated.id, original.id);
        assert_eq!(updated.answer, "9am to 7pm");
        assert_eq!(updated.usage_count, 1);
        assert_eq!(updated.created_at, stored.created_at);

        // 不产生重复行
        assert_eq!(store.list_knowledge_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_request_stats() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.request_stats().unwrap(), RequestStats::default());

        let now = now_millis();

        let mut resolved = HelpRequest::new("q1", "c1");
        resolved.status = RequestStatus::Resolved;
        resolved.created_at = now;
        resolved.resolved_at = Some(now + 120_000); // 2 分钟

        let mut timed_out = HelpRequest::new("q2", "c2");
        timed_out.status = RequestStatus::TimedOut;
        timed_out.timed_out_at = Some(now);

        let pending = HelpRequest::new("q3", "c3");

        store.put_request(&resolved).unwrap();
        store.put_request(&timed_out).unwrap();
        store.put_request(&pending).unwrap();

        let stats = store.request_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.timed_out, 1);
        assert!((stats.avg_resolution_minutes - 2.0).abs() < 1e-9);
    }
}
