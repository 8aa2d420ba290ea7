//! 记忆层：任务对话、分词与词袋相似度、教训检索后端

pub mod conversation;
pub mod long_term;
pub mod tokenizer;

pub use conversation::{Conversation, Message, Role};
pub use long_term::{InMemoryLessonIndex, LessonSearch};
