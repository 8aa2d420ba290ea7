//! 分词与词袋相似度
//!
//! 提供中英文混合分词能力，用于教训去重（词袋余弦相似度）与关键词回退检索。
//! 使用 jieba-rs 进行中文分词，英文按非字母数字字符切分。

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use jieba_rs::Jieba;

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // CJK Unified Ideographs Extension A
        '\u{F900}'..='\u{FAFF}' |   // CJK Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

/// 判断文本是否包含 CJK 字符
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

fn is_term_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// 英文按非字母数字切分，丢弃单字符
fn split_latin(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !is_term_char(c))
        .filter(|s| s.chars().count() > 1)
        .map(|s| s.to_lowercase())
}

/// 智能分词：根据文本内容自动选择分词策略
/// - 包含 CJK 字符时使用 jieba 分词（搜索引擎模式），再对非 CJK 片段做英文切分
/// - 纯英文时直接切分
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .flat_map(|word| {
                if word.chars().any(is_cjk) {
                    vec![word.to_lowercase()]
                } else {
                    split_latin(word).collect()
                }
            })
            .collect()
    } else {
        split_latin(text).collect()
    }
}

/// 分词并返回词集合（用于关键词重叠）
pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 词频向量（词袋表示）
pub fn term_frequencies(text: &str) -> HashMap<String, f32> {
    let mut tf = HashMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0.0) += 1.0;
    }
    tf
}

/// 两个词频向量的余弦相似度，任一为空时为 0
pub fn cosine_similarity(a: &HashMap<String, f32>, b: &HashMap<String, f32>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f32 = a
        .iter()
        .filter_map(|(term, wa)| b.get(term).map(|wb| wa * wb))
        .sum();
    let norm_a: f32 = a.values().map(|w| w * w).sum::<f32>().sqrt();
    let norm_b: f32 = b.values().map(|w| w * w).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// 文本级余弦相似度
pub fn text_similarity(a: &str, b: &str) -> f32 {
    cosine_similarity(&term_frequencies(a), &term_frequencies(b))
}

/// 计算两个词集合的重叠分数（交集大小）
pub fn overlap_score(set1: &HashSet<String>, set2: &HashSet<String>) -> usize {
    set1.intersection(set2).count()
}
