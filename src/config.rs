//! 存储配置

use std::path::PathBuf;

/// 存储连接配置
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite 文件路径
    pub path: PathBuf,
}

impl StoreConfig {
    /// 指定本地文件
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// 从环境变量或默认路径创建配置
    ///
    /// 默认路径: ~/.escalation-hub/db/escalation-hub.db
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var("ESCALATION_HUB_DB") {
            return Self::local(path);
        }

        let default_path = dirs::home_dir()
            .map(|h| h.join(".escalation-hub").join("db").join("escalation-hub.db"))
            .unwrap_or_else(|| PathBuf::from("escalation-hub.db"));

        Self::local(default_path)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
