//! 问题归一化
//!
//! 知识库按归一化 key 去重和查找：大小写折叠、空白折叠、标点丢弃。
//! Agent 侧和 Hub 侧必须使用同一个函数，否则缓存命中会漂移。

/// 归一化问题文本（纯函数，无 IO）
///
/// - 字母数字折叠为小写
/// - 连续空白折叠为单个空格
/// - 其余字符（标点）丢弃
pub fn normalize_question(question: &str) -> String {
    let mut key = String::with_capacity(question.len());
    let mut pending_space = false;

    for ch in question.chars() {
        if ch.is_whitespace() {
            pending_space = !key.is_empty();
        } else if ch.is_alphanumeric() {
            if pending_space {
                key.push(' ');
                pending_space = false;
            }
            for lower in ch.to_lowercase() {
                key.push(lower);
            }
        }
        // 标点不产生分隔，直接丢弃
    }

    key
}
