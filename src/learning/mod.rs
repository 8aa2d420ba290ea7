//! 错误学习层：错误模式、教训（置信度 + 去重）与限时检索服务

pub mod lesson;
pub mod pattern;
pub mod service;

pub use lesson::{confidence_score, Lesson};
pub use pattern::{signature_of, ErrorClass, ErrorPattern};
pub use service::{ErrorLearningService, LearningMetrics, LessonOutcome};
