//! The storage contract every backend implements.
//!
//! The merge engine only ever talks to storage through these traits: master
//! and slave snapshots are read through [`ChatHistoryDao`], the merge target
//! is written through [`MutableChatHistoryDao`]. A merge owns its target
//! exclusively for its duration, hence the `&mut self` on the write side.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Chat, ChatId, ChatWithDetails, Dataset, DatasetRoot, Message, MessageInternalId,
    MessageSourceId, User,
};

/// Read side of a chat history storage backend.
///
/// Within a chat, messages are totally ordered by the backend's internal id,
/// which must be consistent with `(timestamp ASC, source_id ASC)` where
/// source ids are present. A backend must return identical sequences for
/// identical queries; the diff engine's determinism depends on it.
#[async_trait]
pub trait ChatHistoryDao: Send + Sync {
    /// Storage name, for logs and error reports.
    fn name(&self) -> &str;

    async fn datasets(&self) -> Result<Vec<Dataset>>;

    /// Directory holding the dataset's media files. Every path inside a
    /// message resolves relative to it.
    async fn dataset_root(&self, ds_uuid: &Uuid) -> Result<DatasetRoot>;

    /// The user designated as self in the dataset.
    async fn myself(&self, ds_uuid: &Uuid) -> Result<User>;

    /// All dataset users, self first, the rest in stable order.
    async fn users(&self, ds_uuid: &Uuid) -> Result<Vec<User>>;

    async fn chats(&self, ds_uuid: &Uuid) -> Result<Vec<ChatWithDetails>>;

    async fn chat_option(&self, ds_uuid: &Uuid, id: ChatId) -> Result<Option<ChatWithDetails>>;

    /// Messages in forward time order: skip `offset`, take `limit`.
    async fn scroll_messages(&self, chat: &Chat, offset: usize, limit: usize)
        -> Result<Vec<Message>>;

    /// First `limit` messages of the chat.
    async fn first_messages(&self, chat: &Chat, limit: usize) -> Result<Vec<Message>> {
        self.scroll_messages(chat, 0, limit).await
    }

    /// Last `limit` messages of the chat, still in forward time order.
    async fn last_messages(&self, chat: &Chat, limit: usize) -> Result<Vec<Message>>;

    /// Up to `limit` messages ending at `msg`, inclusive. Returns at least
    /// one element (the anchor itself).
    async fn messages_before(&self, chat: &Chat, msg: &Message, limit: usize)
        -> Result<Vec<Message>>;

    /// Up to `limit` messages starting at `msg`, inclusive. Returns at least
    /// one element (the anchor itself).
    async fn messages_after(&self, chat: &Chat, msg: &Message, limit: usize)
        -> Result<Vec<Message>>;

    /// Messages between the two anchors, inclusive on both ends.
    async fn messages_between(&self, chat: &Chat, first: &Message, last: &Message)
        -> Result<Vec<Message>>;

    /// Number of messages strictly between the two anchors.
    async fn count_messages_between(&self, chat: &Chat, first: &Message, last: &Message)
        -> Result<usize>;

    async fn message_option(&self, chat: &Chat, source_id: MessageSourceId)
        -> Result<Option<Message>>;

    async fn message_option_by_internal_id(
        &self,
        chat: &Chat,
        internal_id: MessageInternalId,
    ) -> Result<Option<Message>>;
}

/// Write side of a storage backend, the subset the merge executor needs.
///
/// Insertions that reference files take the source dataset root so the
/// backend can copy the referenced files into its own root. Copies are
/// idempotent: a file that already exists at the destination is skipped.
#[async_trait]
pub trait MutableChatHistoryDao: ChatHistoryDao {
    /// Takes a backup of the current storage state, honoring the
    /// backups-enabled flag.
    async fn backup(&mut self) -> Result<()>;

    async fn enable_backups(&mut self) -> Result<()>;

    async fn disable_backups(&mut self) -> Result<()>;

    async fn insert_dataset(&mut self, ds: Dataset) -> Result<Dataset>;

    /// Inserts a user, preserving its id within the dataset.
    async fn insert_user(&mut self, user: User, is_myself: bool) -> Result<User>;

    /// Inserts a chat, copying its avatar from `src_root` if it has one.
    async fn insert_chat(&mut self, chat: Chat, src_root: &DatasetRoot) -> Result<Chat>;

    /// Inserts messages in the given order, assigning fresh monotonic
    /// internal ids, and copies every file they reference from `src_root`.
    async fn insert_messages(
        &mut self,
        msgs: Vec<Message>,
        chat: &Chat,
        src_root: &DatasetRoot,
    ) -> Result<()>;
}

/// Copies one root-relative file from `src_root` into `dst_root`.
///
/// Skips files already present at the destination, so retried copies are
/// safe. A missing source file is a warning, not an error: practical
/// equality already treats it as "resolves to nothing".
pub async fn copy_file(rel_path: &str, src_root: &DatasetRoot, dst_root: &DatasetRoot) -> Result<()> {
    let src = src_root.to_absolute(rel_path);
    let dst = dst_root.to_absolute(rel_path);
    if dst.exists() {
        return Ok(());
    }
    if !src.is_file() {
        tracing::warn!(path = rel_path, root = %src_root.0.display(), "referenced file is missing, skipping copy");
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(&src, &dst).await?;
    Ok(())
}

/// Copies every file referenced by the given messages from `src_root` into
/// `dst_root`. See [`copy_file`] for the per-file semantics.
pub async fn copy_referenced_files(
    msgs: &[Message],
    src_root: &DatasetRoot,
    dst_root: &DatasetRoot,
) -> Result<()> {
    for msg in msgs {
        for rel_path in msg.files_relative() {
            copy_file(rel_path, src_root, dst_root).await?;
        }
    }
    Ok(())
}
