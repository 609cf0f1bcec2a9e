//! In-memory DAO, intended primarily for testing and as a landing zone for
//! freshly parsed datasets before they are persisted.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use uuid::Uuid;

use crate::dao::{copy_file, copy_referenced_files, ChatHistoryDao, MutableChatHistoryDao};
use crate::error::{Error, Result};
use crate::models::{
    Chat, ChatId, ChatWithDetails, Dataset, DatasetRoot, Message, MessageInternalId,
    MessageSourceId, User, UserId,
};

#[derive(Debug, Clone)]
struct DatasetEntry {
    ds: Dataset,
    myself_id: Option<UserId>,
    users: Vec<User>,
    chats: Vec<ChatEntry>,
}

#[derive(Debug, Clone)]
struct ChatEntry {
    chat: Chat,
    messages: Vec<Message>,
}

/// An in-memory implementation of the DAO contract.
///
/// Dataset roots live under a caller-supplied base directory, one
/// subdirectory per dataset UUID, so file-copy semantics are identical to
/// the persistent backend.
pub struct InMemoryDao {
    name: String,
    root_dir: PathBuf,
    datasets: Vec<DatasetEntry>,
    next_internal_id: i64,
    backups_enabled: bool,
    backup_count: usize,
}

impl InMemoryDao {
    pub fn new(name: impl Into<String>, root_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            root_dir,
            datasets: Vec::new(),
            next_internal_id: 1,
            backups_enabled: true,
            backup_count: 0,
        }
    }

    /// Populates a dataset in one go, assigning internal ids in message
    /// order. The first user is taken to be myself.
    pub fn add_dataset(
        &mut self,
        ds: Dataset,
        users: Vec<User>,
        chats_with_messages: Vec<(Chat, Vec<Message>)>,
    ) {
        let myself_id = users.first().map(|u| u.id);
        let chats = chats_with_messages
            .into_iter()
            .map(|(chat, mut messages)| {
                for msg in &mut messages {
                    msg.internal_id = MessageInternalId(self.next_internal_id);
                    self.next_internal_id += 1;
                }
                ChatEntry { chat, messages }
            })
            .collect();
        self.datasets.push(DatasetEntry {
            ds,
            myself_id,
            users,
            chats,
        });
    }

    /// Number of backups taken so far. Test observability.
    pub fn backup_count(&self) -> usize {
        self.backup_count
    }

    /// Whether automatic backups are currently enabled. Test observability.
    pub fn backups_enabled(&self) -> bool {
        self.backups_enabled
    }

    fn dataset_entry(&self, ds_uuid: &Uuid) -> Result<&DatasetEntry> {
        self.datasets
            .iter()
            .find(|e| e.ds.uuid == *ds_uuid)
            .ok_or_else(|| Error::NotFound(format!("dataset {ds_uuid}")))
    }

    fn dataset_entry_mut(&mut self, ds_uuid: &Uuid) -> Result<&mut DatasetEntry> {
        self.datasets
            .iter_mut()
            .find(|e| e.ds.uuid == *ds_uuid)
            .ok_or_else(|| Error::NotFound(format!("dataset {ds_uuid}")))
    }

    fn chat_entry(&self, chat: &Chat) -> Result<&ChatEntry> {
        self.dataset_entry(&chat.ds_uuid)?
            .chats
            .iter()
            .find(|e| e.chat.id == chat.id)
            .ok_or_else(|| Error::NotFound(format!("chat {}", chat.qualified_name())))
    }

    fn root_for(&self, ds_uuid: &Uuid) -> DatasetRoot {
        DatasetRoot(self.root_dir.join(ds_uuid.to_string()))
    }

    fn anchor_index(entry: &ChatEntry, msg: &Message) -> Result<usize> {
        entry
            .messages
            .iter()
            .position(|m| m.internal_id == msg.internal_id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "message with internal id {} in chat {}",
                    msg.internal_id.0,
                    entry.chat.qualified_name()
                ))
            })
    }

    fn details(&self, entry: &DatasetEntry, chat_entry: &ChatEntry) -> Result<ChatWithDetails> {
        let mut chat = chat_entry.chat.clone();
        chat.msg_count = chat_entry.messages.len() as i64;

        let mut members = Vec::with_capacity(chat.member_ids.len());
        if let Some(myself_id) = entry.myself_id {
            if let Some(myself) = entry.users.iter().find(|u| u.id == myself_id) {
                members.push(myself.clone());
            }
        }
        for member_id in &chat.member_ids {
            if Some(*member_id) == entry.myself_id {
                continue;
            }
            let user = entry.users.iter().find(|u| u.id == *member_id).ok_or_else(|| {
                Error::DataIntegrity {
                    context: chat.qualified_name(),
                    details: format!("member id {} references an unknown user", member_id.0),
                }
            })?;
            members.push(user.clone());
        }

        Ok(ChatWithDetails {
            last_msg: chat_entry.messages.last().cloned(),
            chat,
            members,
        })
    }
}

#[async_trait]
impl ChatHistoryDao for InMemoryDao {
    fn name(&self) -> &str {
        &self.name
    }

    async fn datasets(&self) -> Result<Vec<Dataset>> {
        Ok(self.datasets.iter().map(|e| e.ds.clone()).collect())
    }

    async fn dataset_root(&self, ds_uuid: &Uuid) -> Result<DatasetRoot> {
        self.dataset_entry(ds_uuid)?;
        Ok(self.root_for(ds_uuid))
    }

    async fn myself(&self, ds_uuid: &Uuid) -> Result<User> {
        let entry = self.dataset_entry(ds_uuid)?;
        let myself_id = entry
            .myself_id
            .ok_or_else(|| Error::NotFound(format!("self user in dataset {ds_uuid}")))?;
        entry
            .users
            .iter()
            .find(|u| u.id == myself_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("self user in dataset {ds_uuid}")))
    }

    async fn users(&self, ds_uuid: &Uuid) -> Result<Vec<User>> {
        let entry = self.dataset_entry(ds_uuid)?;
        let mut users: Vec<User> = Vec::with_capacity(entry.users.len());
        for user in &entry.users {
            if Some(user.id) == entry.myself_id {
                users.insert(0, user.clone());
            } else {
                users.push(user.clone());
            }
        }
        Ok(users)
    }

    async fn chats(&self, ds_uuid: &Uuid) -> Result<Vec<ChatWithDetails>> {
        let entry = self.dataset_entry(ds_uuid)?;
        entry.chats.iter().map(|c| self.details(entry, c)).collect()
    }

    async fn chat_option(&self, ds_uuid: &Uuid, id: ChatId) -> Result<Option<ChatWithDetails>> {
        let entry = self.dataset_entry(ds_uuid)?;
        entry
            .chats
            .iter()
            .find(|c| c.chat.id == id)
            .map(|c| self.details(entry, c))
            .transpose()
    }

    async fn scroll_messages(
        &self,
        chat: &Chat,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let entry = self.chat_entry(chat)?;
        Ok(entry.messages.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn last_messages(&self, chat: &Chat, limit: usize) -> Result<Vec<Message>> {
        let entry = self.chat_entry(chat)?;
        let skip = entry.messages.len().saturating_sub(limit);
        Ok(entry.messages.iter().skip(skip).cloned().collect())
    }

    async fn messages_before(&self, chat: &Chat, msg: &Message, limit: usize)
        -> Result<Vec<Message>> {
        let entry = self.chat_entry(chat)?;
        let idx = Self::anchor_index(entry, msg)?;
        let start = (idx + 1).saturating_sub(limit);
        Ok(entry.messages[start..=idx].to_vec())
    }

    async fn messages_after(&self, chat: &Chat, msg: &Message, limit: usize)
        -> Result<Vec<Message>> {
        let entry = self.chat_entry(chat)?;
        let idx = Self::anchor_index(entry, msg)?;
        let end = (idx + limit).min(entry.messages.len());
        Ok(entry.messages[idx..end].to_vec())
    }

    async fn messages_between(&self, chat: &Chat, first: &Message, last: &Message)
        -> Result<Vec<Message>> {
        let entry = self.chat_entry(chat)?;
        let first_idx = Self::anchor_index(entry, first)?;
        let last_idx = Self::anchor_index(entry, last)?;
        Ok(entry.messages[first_idx..=last_idx].to_vec())
    }

    async fn count_messages_between(&self, chat: &Chat, first: &Message, last: &Message)
        -> Result<usize> {
        let entry = self.chat_entry(chat)?;
        let first_idx = Self::anchor_index(entry, first)?;
        let last_idx = Self::anchor_index(entry, last)?;
        Ok(last_idx.saturating_sub(first_idx + 1))
    }

    async fn message_option(&self, chat: &Chat, source_id: MessageSourceId)
        -> Result<Option<Message>> {
        let entry = self.chat_entry(chat)?;
        Ok(entry.messages.iter().find(|m| m.source_id == Some(source_id)).cloned())
    }

    async fn message_option_by_internal_id(
        &self,
        chat: &Chat,
        internal_id: MessageInternalId,
    ) -> Result<Option<Message>> {
        let entry = self.chat_entry(chat)?;
        Ok(entry.messages.iter().find(|m| m.internal_id == internal_id).cloned())
    }
}

#[async_trait]
impl MutableChatHistoryDao for InMemoryDao {
    async fn backup(&mut self) -> Result<()> {
        if self.backups_enabled {
            self.backup_count += 1;
        }
        Ok(())
    }

    async fn enable_backups(&mut self) -> Result<()> {
        self.backups_enabled = true;
        Ok(())
    }

    async fn disable_backups(&mut self) -> Result<()> {
        self.backups_enabled = false;
        Ok(())
    }

    async fn insert_dataset(&mut self, ds: Dataset) -> Result<Dataset> {
        tokio::fs::create_dir_all(self.root_for(&ds.uuid).0).await?;
        self.datasets.push(DatasetEntry {
            ds: ds.clone(),
            myself_id: None,
            users: Vec::new(),
            chats: Vec::new(),
        });
        Ok(ds)
    }

    async fn insert_user(&mut self, user: User, is_myself: bool) -> Result<User> {
        let entry = self.dataset_entry_mut(&user.ds_uuid)?;
        if is_myself {
            entry.myself_id = Some(user.id);
        }
        entry.users.push(user.clone());
        Ok(user)
    }

    async fn insert_chat(&mut self, chat: Chat, src_root: &DatasetRoot) -> Result<Chat> {
        let dst_root = self.root_for(&chat.ds_uuid);
        if let Some(img_path) = &chat.img_path {
            copy_file(img_path, src_root, &dst_root).await?;
        }
        let entry = self.dataset_entry_mut(&chat.ds_uuid)?;
        entry.chats.push(ChatEntry {
            chat: chat.clone(),
            messages: Vec::new(),
        });
        Ok(chat)
    }

    async fn insert_messages(
        &mut self,
        mut msgs: Vec<Message>,
        chat: &Chat,
        src_root: &DatasetRoot,
    ) -> Result<()> {
        // Source ids are dataset-stable and must stay unique within a chat.
        let mut seen: HashSet<i64> = self
            .chat_entry(chat)?
            .messages
            .iter()
            .filter_map(|m| m.source_id)
            .map(|s| s.0)
            .collect();
        for msg in &msgs {
            if let Some(source_id) = msg.source_id {
                if !seen.insert(source_id.0) {
                    return Err(Error::DataIntegrity {
                        context: chat.qualified_name(),
                        details: format!("duplicate source id {}", source_id.0),
                    });
                }
            }
        }

        let dst_root = self.root_for(&chat.ds_uuid);
        copy_referenced_files(&msgs, src_root, &dst_root).await?;

        for msg in &mut msgs {
            msg.internal_id = MessageInternalId(self.next_internal_id);
            self.next_internal_id += 1;
        }
        let entry = self
            .dataset_entry_mut(&chat.ds_uuid)?
            .chats
            .iter_mut()
            .find(|e| e.chat.id == chat.id)
            .ok_or_else(|| Error::NotFound(format!("chat {}", chat.qualified_name())))?;
        entry.messages.append(&mut msgs);
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
