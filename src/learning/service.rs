//! Error Learning Service：记录错误模式、抽取去重后的教训、限时检索
//!
//! - record：追加/刷新错误模式，写入时顺带清理过期模式（无后台清扫）
//! - extract_lesson：计算置信度，余弦相似度 ≥ 阈值视为重复并丢弃
//! - retrieve：后端检索受超时约束；超时或不可用时回退到最近教训的关键词匹配，再回退为空，永不返回错误
//!
//! 进程级单例通过 init_global 以双重检查加锁构造；也可以直接 new 后以 Arc 注入控制循环。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::LearningSection;
use crate::memory::{tokenizer, LessonSearch};

use super::{ErrorClass, ErrorPattern, Lesson};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

static GLOBAL: OnceLock<Arc<ErrorLearningService>> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());
static GLOBAL_CONSTRUCTIONS: AtomicU64 = AtomicU64::new(0);

/// extract_lesson 的结果
#[derive(Debug, Clone)]
pub enum LessonOutcome {
    Stored(Lesson),
    /// 与已有教训过于相似，被丢弃
    Duplicate { existing_id: String, similarity: f32 },
    /// 模式不存在（或已过期）
    UnknownPattern,
}

/// 并发安全的计数器
#[derive(Debug, Default)]
struct LearningCounters {
    total_errors_recorded: AtomicU64,
    retrievals: AtomicU64,
    retrieval_time_total_ms: AtomicU64,
    retrieval_timeout_count: AtomicU64,
    memory_write_failures: AtomicU64,
    deduplication_saves: AtomicU64,
}

/// 只读指标快照（供外部监控）
#[derive(Debug, Clone, Serialize)]
pub struct LearningMetrics {
    pub total_errors_recorded: u64,
    pub average_retrieval_time_ms: f64,
    pub retrieval_timeout_count: u64,
    pub memory_write_failures: u64,
    pub deduplication_saves: u64,
    pub active_patterns: usize,
    pub stored_lessons: usize,
}

pub struct ErrorLearningService {
    config: LearningSection,
    patterns: Mutex<HashMap<String, ErrorPattern>>,
    /// pattern signature -> lessons
    lessons: RwLock<HashMap<String, Vec<Lesson>>>,
    /// 最近写入的教训（关键词回退检索用）
    recent: Mutex<VecDeque<Lesson>>,
    backend: Option<Arc<dyn LessonSearch>>,
    counters: LearningCounters,
}

impl ErrorLearningService {
    pub fn new(config: LearningSection, backend: Option<Arc<dyn LessonSearch>>) -> Self {
        Self {
            config,
            patterns: Mutex::new(HashMap::new()),
            lessons: RwLock::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
            backend,
            counters: LearningCounters::default(),
        }
    }

    /// 进程级单例：首次调用时以给定配置构造，之后忽略参数直接返回同一实例
    pub fn init_global(
        config: LearningSection,
        backend: Option<Arc<dyn LessonSearch>>,
    ) -> Arc<Self> {
        if let Some(service) = GLOBAL.get() {
            return Arc::clone(service);
        }
        let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(service) = GLOBAL.get() {
            return Arc::clone(service);
        }
        let service = Arc::new(Self::new(config, backend));
        GLOBAL_CONSTRUCTIONS.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Error learning service initialized");
        // 在 INIT_LOCK 内且已确认为空，set 不会失败
        let _ = GLOBAL.set(Arc::clone(&service));
        service
    }

    /// 默认配置的进程级单例
    pub fn global() -> Arc<Self> {
        Self::init_global(LearningSection::default(), None)
    }

    /// 单例被真正构造的次数（正常情况下 ≤ 1）
    pub fn global_constructions() -> u64 {
        GLOBAL_CONSTRUCTIONS.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &LearningSection {
        &self.config
    }

    fn max_age_secs(&self) -> u64 {
        self.config.max_age_days.saturating_mul(SECS_PER_DAY)
    }

    /// 记录一次错误：追加或刷新模式，并顺带清理过期模式
    pub fn record(&self, tool: &str, error_class: ErrorClass, context: &str) -> ErrorPattern {
        self.record_at(tool, error_class, context, Utc::now())
    }

    pub(crate) fn record_at(
        &self,
        tool: &str,
        error_class: ErrorClass,
        context: &str,
        now: DateTime<Utc>,
    ) -> ErrorPattern {
        self.counters.total_errors_recorded.fetch_add(1, Ordering::Relaxed);

        let mut patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = patterns
            .iter()
            .filter(|(_, p)| p.is_expired(now))
            .map(|(sig, _)| sig.clone())
            .collect();
        for sig in &expired {
            patterns.remove(sig);
        }

        let candidate = ErrorPattern::new(tool, error_class, context, self.max_age_secs(), now);
        let pattern = patterns
            .entry(candidate.signature.clone())
            .and_modify(|p| p.refresh(context, now))
            .or_insert(candidate)
            .clone();
        drop(patterns);

        if !expired.is_empty() {
            let mut lessons = self.lessons.write().unwrap_or_else(PoisonError::into_inner);
            for sig in &expired {
                lessons.remove(sig);
            }
            drop(lessons);
            self.recent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|l| !expired.contains(&l.pattern_signature));
            tracing::debug!(purged = expired.len(), "expired error patterns purged");
        }

        tracing::debug!(signature = %pattern.signature, occurrences = pattern.occurrences, "error recorded");
        pattern
    }

    pub fn pattern(&self, signature: &str) -> Option<ErrorPattern> {
        self.patterns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(signature)
            .cloned()
    }

    pub fn patterns(&self) -> Vec<ErrorPattern> {
        self.patterns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn lessons_for(&self, signature: &str) -> Vec<Lesson> {
        self.lessons
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(signature)
            .cloned()
            .unwrap_or_default()
    }

    /// 候选教训与同模式已有教训的最高相似度达到阈值时返回 (已有 id, 相似度)
    pub fn is_duplicate(&self, signature: &str, candidate: &str) -> Option<(String, f32)> {
        let lessons = self.lessons.read().unwrap_or_else(PoisonError::into_inner);
        find_duplicate(
            lessons.get(signature).map(Vec::as_slice).unwrap_or(&[]),
            candidate,
            self.config.dedup_threshold,
        )
    }

    /// 从修正文本抽取教训：去重后存储，并写入检索后端
    pub async fn extract_lesson(&self, signature: &str, correction: &str) -> LessonOutcome {
        let Some(pattern) = self.pattern(signature) else {
            return LessonOutcome::UnknownPattern;
        };
        let lesson = Lesson::new(signature, &pattern.tool, pattern.error_class, correction);

        {
            // 判重与插入在同一把写锁内完成，避免并发下存入两条相同教训
            let mut lessons = self.lessons.write().unwrap_or_else(PoisonError::into_inner);
            let existing = lessons.entry(signature.to_string()).or_default();
            if let Some((existing_id, similarity)) =
                find_duplicate(existing, &lesson.content, self.config.dedup_threshold)
            {
                self.counters.deduplication_saves.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%signature, similarity, "duplicate lesson dropped");
                return LessonOutcome::Duplicate { existing_id, similarity };
            }
            existing.push(lesson.clone());
        }

        {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            recent.push_back(lesson.clone());
            while recent.len() > self.config.recent_lessons_capacity {
                recent.pop_front();
            }
        }

        if let Some(backend) = &self.backend {
            let write = tokio::time::timeout(self.retrieval_timeout(), backend.store(&lesson)).await;
            match write {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.counters.memory_write_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "lesson write to memory backend failed");
                }
                Err(_) => {
                    self.counters.memory_write_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("lesson write to memory backend timed out");
                }
            }
        }

        tracing::info!(%signature, confidence = lesson.confidence, "lesson stored");
        LessonOutcome::Stored(lesson)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.config.retrieval_timeout_ms)
    }

    /// 使用配置的超时（默认 3000ms）检索
    pub async fn retrieve(&self, query: &str) -> Vec<Lesson> {
        self.retrieve_with_timeout(query, self.retrieval_timeout()).await
    }

    /// 限时检索：后端 -> 最近教训关键词匹配 -> 空
    pub async fn retrieve_with_timeout(&self, query: &str, timeout: Duration) -> Vec<Lesson> {
        let start = Instant::now();
        let k = self.config.max_lessons_returned.max(1);

        let from_backend = match &self.backend {
            Some(backend) => match tokio::time::timeout(timeout, backend.search(query, k)).await {
                Ok(Ok(lessons)) => Some(lessons),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "memory backend search failed, falling back to keyword match");
                    None
                }
                Err(_) => {
                    self.counters.retrieval_timeout_count.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "memory backend search timed out, falling back to keyword match");
                    None
                }
            },
            None => None,
        };

        // 后端不随模式过期删除，过滤掉已被清理模式的教训
        let from_backend = from_backend.map(|lessons| self.retain_live(lessons));
        let lessons = match from_backend {
            Some(lessons) if !lessons.is_empty() => lessons,
            _ => self.keyword_fallback(query, k),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.counters.retrievals.fetch_add(1, Ordering::Relaxed);
        self.counters
            .retrieval_time_total_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        lessons
    }

    fn retain_live(&self, mut lessons: Vec<Lesson>) -> Vec<Lesson> {
        let patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        lessons.retain(|l| patterns.contains_key(&l.pattern_signature));
        lessons
    }

    fn keyword_fallback(&self, query: &str, k: usize) -> Vec<Lesson> {
        let query_tokens = tokenizer::tokenize_to_set(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(usize, &Lesson)> = recent
            .iter()
            .map(|lesson| {
                let tokens = tokenizer::tokenize_to_set(&format!(
                    "{} {}",
                    lesson.pattern_signature, lesson.content
                ));
                (tokenizer::overlap_score(&query_tokens, &tokens), lesson)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.confidence.total_cmp(&a.1.confidence)));
        scored.into_iter().take(k).map(|(_, l)| l.clone()).collect()
    }

    pub fn metrics(&self) -> LearningMetrics {
        let retrievals = self.counters.retrievals.load(Ordering::Relaxed);
        let total_ms = self.counters.retrieval_time_total_ms.load(Ordering::Relaxed);
        let average_retrieval_time_ms = if retrievals == 0 {
            0.0
        } else {
            total_ms as f64 / retrievals as f64
        };
        LearningMetrics {
            total_errors_recorded: self.counters.total_errors_recorded.load(Ordering::Relaxed),
            average_retrieval_time_ms,
            retrieval_timeout_count: self.counters.retrieval_timeout_count.load(Ordering::Relaxed),
            memory_write_failures: self.counters.memory_write_failures.load(Ordering::Relaxed),
            deduplication_saves: self.counters.deduplication_saves.load(Ordering::Relaxed),
            active_patterns: self.patterns.lock().unwrap_or_else(PoisonError::into_inner).len(),
            stored_lessons: self
                .lessons
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .map(Vec::len)
                .sum(),
        }
    }
}

fn find_duplicate(existing: &[Lesson], candidate: &str, threshold: f32) -> Option<(String, f32)> {
    let candidate_tf = tokenizer::term_frequencies(candidate);
    existing
        .iter()
        .map(|l| {
            let sim = tokenizer::cosine_similarity(&candidate_tf, &tokenizer::term_frequencies(&l.content));
            (l.id.clone(), sim)
        })
        .filter(|(_, sim)| *sim >= threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use crate::memory::InMemoryLessonIndex;

    fn service() -> ErrorLearningService {
        ErrorLearningService::new(LearningSection::default(), None)
    }

    /// 永不返回的后端
    struct HungBackend;

    #[async_trait]
    impl LessonSearch for HungBackend {
        async fn store(&self, _lesson: &Lesson) -> Result<(), String> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn search(&self, _query: &str, _k: usize) -> Result<Vec<Lesson>, String> {
            std::future::pending::<()>().await;
            Ok(Vec::new())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl LessonSearch for FailingBackend {
        async fn store(&self, _lesson: &Lesson) -> Result<(), String> {
            Err("disk full".to_string())
        }

        async fn search(&self, _query: &str, _k: usize) -> Result<Vec<Lesson>, String> {
            Err("index offline".to_string())
        }
    }

    #[test]
    fn test_record_refreshes_same_signature() {
        let svc = service();
        let a = svc.record("read_file", ErrorClass::NotFound, "Path not found: a.txt");
        let b = svc.record("read_file", ErrorClass::NotFound, "Path not found: a.txt");
        assert_eq!(a.signature, b.signature);
        assert_eq!(b.occurrences, 2);
        assert_eq!(svc.metrics().total_errors_recorded, 2);
        assert_eq!(svc.metrics().active_patterns, 1);
    }

    #[test]
    fn test_expired_pattern_purged_on_next_record() {
        let svc = service();
        let old = svc.record_at(
            "read_file",
            ErrorClass::NotFound,
            "old context",
            Utc::now() - ChronoDuration::days(8),
        );
        assert!(svc.pattern(&old.signature).is_some());

        svc.record("run_in_terminal", ErrorClass::Syntax, "fresh");
        assert!(svc.pattern(&old.signature).is_none());
        assert_eq!(svc.patterns().len(), 1);
    }

    #[test]
    fn test_refreshed_pattern_still_expires_from_creation() {
        let svc = service();
        let now = Utc::now();
        let old = svc.record_at("read_file", ErrorClass::NotFound, "a.txt", now - ChronoDuration::days(8));
        svc.record_at("read_file", ErrorClass::NotFound, "a.txt", now - ChronoDuration::days(3));
        assert_eq!(svc.pattern(&old.signature).map(|p| p.occurrences), Some(2));

        svc.record_at("echo", ErrorClass::Unknown, "other", now);
        assert!(svc.pattern(&old.signature).is_none());
    }

    #[tokio::test]
    async fn test_purged_pattern_lessons_not_retrieved() {
        for backend in [None, Some(Arc::new(InMemoryLessonIndex::default()) as Arc<dyn LessonSearch>)] {
            let svc = ErrorLearningService::new(LearningSection::default(), backend);
            let old = svc.record_at(
                "write_file",
                ErrorClass::NotFound,
                "parent directory missing",
                Utc::now() - ChronoDuration::days(8),
            );
            svc.extract_lesson(&old.signature, "create the parent directory before writing")
                .await;
            assert_eq!(svc.retrieve("write_file parent directory").await.len(), 1);

            svc.record("echo", ErrorClass::Unknown, "unrelated");
            assert!(svc.pattern(&old.signature).is_none());
            assert!(svc.lessons_for(&old.signature).is_empty());
            assert!(svc.retrieve("write_file parent directory").await.is_empty());
        }
    }

    #[test]
    fn test_pattern_within_max_age_survives() {
        let svc = service();
        let recent = svc.record_at(
            "read_file",
            ErrorClass::NotFound,
            "recent",
            Utc::now() - ChronoDuration::days(6),
        );
        svc.record("echo", ErrorClass::Unknown, "other");
        assert!(svc.pattern(&recent.signature).is_some());
    }

    #[tokio::test]
    async fn test_similar_lessons_deduplicated() {
        let svc = service();
        let p = svc.record("write_file", ErrorClass::NotFound, "parent directory missing");
        let first = svc
            .extract_lesson(&p.signature, "create the parent directory before writing the file")
            .await;
        assert!(matches!(first, LessonOutcome::Stored(_)));

        let second = svc
            .extract_lesson(&p.signature, "Create the parent directory before writing the file.")
            .await;
        match second {
            LessonOutcome::Duplicate { similarity, .. } => assert!(similarity >= 0.85),
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(svc.lessons_for(&p.signature).len(), 1);
        assert_eq!(svc.metrics().deduplication_saves, 1);
    }

    #[tokio::test]
    async fn test_dissimilar_lessons_both_stored() {
        let svc = service();
        let p = svc.record("write_file", ErrorClass::NotFound, "parent directory missing");
        svc.extract_lesson(&p.signature, "create the parent directory before writing")
            .await;
        let second = svc
            .extract_lesson(&p.signature, "use an absolute workspace path instead of ~")
            .await;
        assert!(matches!(second, LessonOutcome::Stored(_)));
        assert_eq!(svc.lessons_for(&p.signature).len(), 2);
        assert_eq!(svc.metrics().deduplication_saves, 0);
    }

    #[tokio::test]
    async fn test_extract_for_unknown_pattern() {
        let svc = service();
        let outcome = svc.extract_lesson("nope", "anything").await;
        assert!(matches!(outcome, LessonOutcome::UnknownPattern));
    }

    #[tokio::test]
    async fn test_is_duplicate_threshold() {
        let svc = service();
        let p = svc.record("echo", ErrorClass::Unknown, "ctx");
        svc.extract_lesson(&p.signature, "alpha beta gamma delta").await;
        assert!(svc.is_duplicate(&p.signature, "alpha beta gamma delta").is_some());
        // cos = 2 / (2 * 2) = 0.5
        assert!(svc.is_duplicate(&p.signature, "alpha beta epsilon zeta").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrieve_hung_backend_bounded() {
        let svc = ErrorLearningService::new(LearningSection::default(), Some(Arc::new(HungBackend)));
        let start = tokio::time::Instant::now();
        let lessons = svc.retrieve("read_file not_found").await;
        let waited = start.elapsed();
        assert!(lessons.is_empty());
        assert!(waited >= Duration::from_millis(3000));
        assert!(waited < Duration::from_millis(3100));
        assert_eq!(svc.metrics().retrieval_timeout_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrieve_falls_back_to_recent_keyword_match() {
        let svc = ErrorLearningService::new(LearningSection::default(), Some(Arc::new(HungBackend)));
        let p = svc.record("read_file", ErrorClass::NotFound, "config.toml missing");
        // 写入后端挂起 -> 记为写失败，但本地最近教训仍可用
        let outcome = svc
            .extract_lesson(&p.signature, "generate config.toml with the init command first")
            .await;
        assert!(matches!(outcome, LessonOutcome::Stored(_)));
        assert_eq!(svc.metrics().memory_write_failures, 1);

        let lessons = svc.retrieve(&p.query_text()).await;
        assert_eq!(lessons.len(), 1);
        assert!(lessons[0].content.contains("init command"));
    }

    #[tokio::test]
    async fn test_failing_backend_degrades_gracefully() {
        let svc = ErrorLearningService::new(LearningSection::default(), Some(Arc::new(FailingBackend)));
        let p = svc.record("read_file", ErrorClass::NotFound, "x");
        svc.extract_lesson(&p.signature, "check the path spelling").await;
        assert_eq!(svc.metrics().memory_write_failures, 1);
        let lessons = svc.retrieve("totally unrelated words").await;
        assert!(lessons.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_prefers_backend_results() {
        let index = Arc::new(InMemoryLessonIndex::default());
        let svc = ErrorLearningService::new(LearningSection::default(), Some(index.clone()));
        let p = svc.record("run_in_terminal", ErrorClass::Syntax, "unterminated quote");
        svc.extract_lesson(&p.signature, "escape single quotes inside the command")
            .await;
        assert_eq!(index.len(), 1);

        let lessons = svc.retrieve("run_in_terminal syntax quote").await;
        assert_eq!(lessons.len(), 1);
        assert!(svc.metrics().average_retrieval_time_ms >= 0.0);
    }

    #[test]
    fn test_global_singleton_constructed_once() {
        let barrier = Arc::new(std::sync::Barrier::new(10));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    ErrorLearningService::global()
                })
            })
            .collect();
        let instances: Vec<Arc<ErrorLearningService>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(instances.iter().all(|s| Arc::ptr_eq(s, &instances[0])));
        assert_eq!(ErrorLearningService::global_constructions(), 1);
    }
}
