//! 数据库 Schema 定义

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- 求助请求表
CREATE TABLE IF NOT EXISTS help_requests (
    id TEXT PRIMARY KEY,
    customer_reference TEXT NOT NULL,
    question TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',  -- pending / resolved / timed_out
    answer TEXT,
    resolved_by TEXT,
    created_at INTEGER NOT NULL,             -- 毫秒时间戳
    resolved_at INTEGER,
    timed_out_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_requests_status ON help_requests(status);
CREATE INDEX IF NOT EXISTS idx_requests_created ON help_requests(created_at DESC);

-- 知识库表
CREATE TABLE IF NOT EXISTS knowledge_entries (
    id TEXT PRIMARY KEY,
    question TEXT NOT NULL,
    normalized_key TEXT NOT NULL UNIQUE,     -- 归一化 key，冲突时原地覆盖
    answer TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'general',
    usage_count INTEGER NOT NULL DEFAULT 0,  -- 命中次数，单调递增
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_knowledge_created ON knowledge_entries(created_at DESC);
"#;
