//! 长期记忆：教训检索后端
//!
//! Error Learning Service 只通过 LessonSearch 访问后端（写入 + 排序检索），并自带超时。
//! 当前实现为 InMemoryLessonIndex（关键词重叠），后续可接 Qdrant/LanceDB 等真实向量库。

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::learning::Lesson;
use crate::memory::tokenizer;

/// 教训检索后端：支持写入与按查询排序检索
#[async_trait]
pub trait LessonSearch: Send + Sync {
    /// 存入一条教训
    async fn store(&self, lesson: &Lesson) -> Result<(), String>;

    /// 按查询检索最相关的 k 条（按相关度降序）
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Lesson>, String>;
}

/// 简单内存实现：按关键词重叠检索（无真实向量，适合 MVP）
pub struct InMemoryLessonIndex {
    /// (lesson, 小写词集合)
    store: RwLock<Vec<(Lesson, HashSet<String>)>>,
    max_entries: usize,
}

impl InMemoryLessonIndex {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: RwLock::new(Vec::new()),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLessonIndex {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl LessonSearch for InMemoryLessonIndex {
    async fn store(&self, lesson: &Lesson) -> Result<(), String> {
        let tokens = tokenizer::tokenize_to_set(&format!(
            "{} {} {}",
            lesson.pattern_signature, lesson.tool, lesson.content
        ));
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        store.push((lesson.clone(), tokens));
        let n = store.len();
        if n > self.max_entries {
            store.drain(0..n - self.max_entries);
        }
        Ok(())
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<Lesson>, String> {
        let query_tokens = tokenizer::tokenize_to_set(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(usize, &Lesson)> = store
            .iter()
            .map(|(lesson, tokens)| (tokenizer::overlap_score(&query_tokens, tokens), lesson))
            .filter(|(s, _)| *s > 0)
            .collect();
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.confidence.total_cmp(&a.1.confidence))
        });
        Ok(scored.into_iter().take(k).map(|(_, l)| l.clone()).collect())
    }
}
