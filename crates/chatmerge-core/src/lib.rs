//! chatmerge-core: normalized chat history model, storage DAOs and the
//! dataset merge engine.
//!
//! Chat histories exported from heterogeneous sources (desktop messengers,
//! mobile app databases, text exports) are normalized into one relational
//! representation. Two snapshots of the same conversation, taken at
//! different times and possibly in different formats, can then be diffed
//! and merged into a consolidated dataset without losing messages or
//! attachments.

pub mod config;
pub mod dao;
pub mod diff;
pub mod equality;
pub mod error;
pub mod memory;
pub mod merge;
pub mod models;
pub mod schema;
pub mod sqlite;
pub mod stream;

pub use config::Config;
pub use dao::{ChatHistoryDao, MutableChatHistoryDao};
pub use diff::{DatasetDiffAnalyzer, MessagesMergeDiff};
pub use error::{Error, Result};
pub use memory::InMemoryDao;
pub use sqlite::SqliteDao;

/// Application name used for config directories and paths.
pub const APP_NAME: &str = "chatmerge";
