//! Merge executor: writes a consolidated dataset into a target DAO.
//!
//! Inputs are per-user and per-chat options resolved by the caller (a UI or
//! a CLI applying defaults). The executor owns the target DAO exclusively
//! for the duration of the merge; the pre-merge backup is the recovery
//! mechanism on partial failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use uuid::Uuid;

use crate::dao::{ChatHistoryDao, MutableChatHistoryDao};
use crate::diff::MessagesMergeDiff;
use crate::error::{Error, Result};
use crate::models::{
    make_searchable_string, Chat, ChatType, Dataset, DatasetRoot, MasterInternalId, Message,
    MessageInternalId, MessageTyped, SlaveInternalId, User, UserId, NO_INTERNAL_ID,
};
use crate::stream::{MessagesStream, DEFAULT_BATCH_SIZE};

/// How a single user is carried into the merged dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum UserMergeOption {
    /// Master user kept as-is.
    Keep(User),
    /// Slave-only user added.
    Add(User),
    /// Master user's naming replaced with the slave's.
    Replace { master: User, slave: User },
}

impl UserMergeOption {
    fn covers(&self, id: UserId) -> bool {
        match self {
            UserMergeOption::Keep(u) | UserMergeOption::Add(u) => u.id == id,
            UserMergeOption::Replace { master, slave } => master.id == id || slave.id == id,
        }
    }

    fn final_user(&self) -> &User {
        match self {
            UserMergeOption::Keep(u) | UserMergeOption::Add(u) => u,
            UserMergeOption::Replace { slave, .. } => slave,
        }
    }
}

/// A chat pair submitted for analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMergeRequest {
    Keep { master_chat: Chat },
    Add { slave_chat: Chat },
    Combine { master_chat: Chat, slave_chat: Chat },
}

/// An analyzed chat pair: Combine carries the diff sections.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMergeOption {
    Keep {
        master_chat: Chat,
    },
    Add {
        slave_chat: Chat,
    },
    Combine {
        master_chat: Chat,
        slave_chat: Chat,
        sections: Vec<MessagesMergeDiff>,
    },
}

impl ChatMergeOption {
    /// Applies the default resolution to every section: Replace keeps the
    /// slave side, everything else is carried over unchanged.
    pub fn into_default_decision(self) -> ChatMergeDecision {
        match self {
            ChatMergeOption::Keep { master_chat } => ChatMergeDecision::Keep { master_chat },
            ChatMergeOption::Add { slave_chat } => ChatMergeDecision::Add { slave_chat },
            ChatMergeOption::Combine { master_chat, slave_chat, sections } => {
                ChatMergeDecision::Combine {
                    master_chat,
                    slave_chat,
                    resolutions: sections.into_iter().map(MessagesMergeDecision::from).collect(),
                }
            }
        }
    }
}

/// A diff section after user resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagesMergeDecision {
    Match {
        first_master_id: MasterInternalId,
        last_master_id: MasterInternalId,
        first_slave_id: SlaveInternalId,
        last_slave_id: SlaveInternalId,
    },
    Retain {
        first_master_id: MasterInternalId,
        last_master_id: MasterInternalId,
    },
    Add {
        first_slave_id: SlaveInternalId,
        last_slave_id: SlaveInternalId,
    },
    /// Slave wins. The default: preserves new content.
    Replace {
        first_master_id: MasterInternalId,
        last_master_id: MasterInternalId,
        first_slave_id: SlaveInternalId,
        last_slave_id: SlaveInternalId,
    },
    /// User override: master wins.
    DontReplace {
        first_master_id: MasterInternalId,
        last_master_id: MasterInternalId,
        first_slave_id: SlaveInternalId,
        last_slave_id: SlaveInternalId,
    },
}

impl From<MessagesMergeDiff> for MessagesMergeDecision {
    fn from(diff: MessagesMergeDiff) -> Self {
        match diff {
            MessagesMergeDiff::Match {
                first_master_id,
                last_master_id,
                first_slave_id,
                last_slave_id,
            } => MessagesMergeDecision::Match {
                first_master_id,
                last_master_id,
                first_slave_id,
                last_slave_id,
            },
            MessagesMergeDiff::Retain { first_master_id, last_master_id } => {
                MessagesMergeDecision::Retain { first_master_id, last_master_id }
            }
            MessagesMergeDiff::Add { first_slave_id, last_slave_id } => {
                MessagesMergeDecision::Add { first_slave_id, last_slave_id }
            }
            MessagesMergeDiff::Replace {
                first_master_id,
                last_master_id,
                first_slave_id,
                last_slave_id,
            } => MessagesMergeDecision::Replace {
                first_master_id,
                last_master_id,
                first_slave_id,
                last_slave_id,
            },
        }
    }
}

/// A chat pair with fully resolved message decisions.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMergeDecision {
    Keep {
        master_chat: Chat,
    },
    Add {
        slave_chat: Chat,
    },
    Combine {
        master_chat: Chat,
        slave_chat: Chat,
        resolutions: Vec<MessagesMergeDecision>,
    },
}

/// Merges the two datasets into a fresh one inside the target DAO and
/// returns it.
///
/// If the target already holds data, a backup is taken first; automatic
/// backups are disabled for the duration and re-enabled on every exit path.
pub async fn merge_datasets(
    master_dao: &dyn ChatHistoryDao,
    master_ds: &Dataset,
    slave_dao: &dyn ChatHistoryDao,
    slave_ds: &Dataset,
    user_options: Vec<UserMergeOption>,
    chat_decisions: Vec<ChatMergeDecision>,
    target_dao: &mut dyn MutableChatHistoryDao,
    cancel: &AtomicBool,
) -> Result<Dataset> {
    if !target_dao.datasets().await?.is_empty() {
        target_dao.backup().await?;
    }
    target_dao.disable_backups().await?;
    let result = merge_datasets_inner(
        master_dao,
        master_ds,
        slave_dao,
        slave_ds,
        user_options,
        chat_decisions,
        target_dao,
        cancel,
    )
    .await;
    let reenabled = target_dao.enable_backups().await;
    let new_ds = result?;
    reenabled?;
    Ok(new_ds)
}

#[allow(clippy::too_many_arguments)]
async fn merge_datasets_inner(
    master_dao: &dyn ChatHistoryDao,
    master_ds: &Dataset,
    slave_dao: &dyn ChatHistoryDao,
    slave_ds: &Dataset,
    user_options: Vec<UserMergeOption>,
    chat_decisions: Vec<ChatMergeDecision>,
    target_dao: &mut dyn MutableChatHistoryDao,
    cancel: &AtomicBool,
) -> Result<Dataset> {
    let master_users = master_dao.users(&master_ds.uuid).await?;
    let master_myself = master_dao.myself(&master_ds.uuid).await?;
    let slave_users = slave_dao.users(&slave_ds.uuid).await?;
    let master_root = master_dao.dataset_root(&master_ds.uuid).await?;
    let slave_root = slave_dao.dataset_root(&slave_ds.uuid).await?;

    // Every master user not mentioned explicitly is kept, so the target
    // receives the full user list.
    let mut options = user_options;
    for user in &master_users {
        if !options.iter().any(|o| o.covers(user.id)) {
            options.push(UserMergeOption::Keep(user.clone()));
        }
    }

    let new_ds = Dataset {
        uuid: Uuid::new_v4(),
        alias: format!("{} (merged)", master_ds.alias),
        source_type: master_ds.source_type.clone(),
    };

    // Final user list, ids preserved, plus the old-to-new pretty name
    // mapping used to rewrite plaintext member lists.
    let mut final_users: Vec<User> = Vec::with_capacity(options.len());
    let mut rename_map: HashMap<String, String> = HashMap::new();
    for option in &options {
        if let UserMergeOption::Replace { master, slave } = option {
            if master.id != slave.id {
                return Err(Error::DataIntegrity {
                    context: "user merge".to_owned(),
                    details: format!(
                        "cannot replace user {} with user {}: ids differ",
                        master.id.0, slave.id.0
                    ),
                });
            }
        }
        let mut user = option.final_user().clone();
        user.ds_uuid = new_ds.uuid;
        let new_name = user.pretty_name();
        for old in master_users.iter().chain(slave_users.iter()).filter(|u| u.id == user.id) {
            let old_name = old.pretty_name();
            if old_name != new_name {
                rename_map.insert(old_name, new_name.clone());
            }
        }
        final_users.push(user);
    }

    let myself_id = master_myself.id;
    let self_count = final_users.iter().filter(|u| u.id == myself_id).count();
    if self_count != 1 {
        return Err(Error::DataIntegrity {
            context: "user merge".to_owned(),
            details: format!(
                "expected exactly one user with self id {}, found {}",
                myself_id.0, self_count
            ),
        });
    }

    let new_ds = target_dao.insert_dataset(new_ds).await?;
    for user in &final_users {
        target_dao.insert_user(user.clone(), user.id == myself_id).await?;
    }

    let ctx = MergeContext {
        master_dao,
        slave_dao,
        master_root,
        slave_root,
        new_ds: new_ds.clone(),
        myself_id,
        final_users,
        rename_map,
        batch_size: DEFAULT_BATCH_SIZE,
    };

    for decision in chat_decisions {
        if cancel.load(AtomicOrdering::Relaxed) {
            return Err(Error::Cancelled);
        }
        match decision {
            ChatMergeDecision::Keep { master_chat } => {
                tracing::debug!(chat = %master_chat.qualified_name(), "keeping master chat");
                let target_chat = ctx.prepare_chat(&master_chat, None);
                let target_chat = target_dao.insert_chat(target_chat, &ctx.master_root).await?;
                copy_all_messages(
                    &ctx,
                    ctx.master_dao,
                    &master_chat,
                    &ctx.master_root,
                    target_dao,
                    &target_chat,
                    cancel,
                )
                .await?;
            }
            ChatMergeDecision::Add { slave_chat } => {
                tracing::debug!(chat = %slave_chat.qualified_name(), "adding slave chat");
                let target_chat = ctx.prepare_chat(&slave_chat, None);
                let target_chat = target_dao.insert_chat(target_chat, &ctx.slave_root).await?;
                copy_all_messages(
                    &ctx,
                    ctx.slave_dao,
                    &slave_chat,
                    &ctx.slave_root,
                    target_dao,
                    &target_chat,
                    cancel,
                )
                .await?;
            }
            ChatMergeDecision::Combine { master_chat, slave_chat, resolutions } => {
                tracing::debug!(chat = %master_chat.qualified_name(), "combining chat pair");
                let target_chat = ctx.prepare_chat(&master_chat, Some(&slave_chat));
                let target_chat = target_dao.insert_chat(target_chat, &ctx.master_root).await?;
                for resolution in resolutions {
                    match resolution {
                        MessagesMergeDecision::Retain { first_master_id, last_master_id }
                        | MessagesMergeDecision::DontReplace {
                            first_master_id, last_master_id, ..
                        } => {
                            copy_range(
                                &ctx,
                                ctx.master_dao,
                                &master_chat,
                                &ctx.master_root,
                                target_dao,
                                &target_chat,
                                first_master_id.generalize(),
                                last_master_id.generalize(),
                                cancel,
                            )
                            .await?;
                        }
                        MessagesMergeDecision::Add { first_slave_id, last_slave_id }
                        | MessagesMergeDecision::Replace {
                            first_slave_id, last_slave_id, ..
                        } => {
                            copy_range(
                                &ctx,
                                ctx.slave_dao,
                                &slave_chat,
                                &ctx.slave_root,
                                target_dao,
                                &target_chat,
                                first_slave_id.generalize(),
                                last_slave_id.generalize(),
                                cancel,
                            )
                            .await?;
                        }
                        MessagesMergeDecision::Match {
                            first_master_id,
                            last_master_id,
                            first_slave_id,
                            last_slave_id,
                        } => {
                            copy_match_range(
                                &ctx,
                                &master_chat,
                                &slave_chat,
                                target_dao,
                                &target_chat,
                                first_master_id,
                                last_master_id,
                                first_slave_id,
                                last_slave_id,
                                cancel,
                            )
                            .await?;
                        }
                    }
                }
            }
        }
    }

    Ok(new_ds)
}

struct MergeContext<'a> {
    master_dao: &'a dyn ChatHistoryDao,
    slave_dao: &'a dyn ChatHistoryDao,
    master_root: DatasetRoot,
    slave_root: DatasetRoot,
    new_ds: Dataset,
    myself_id: UserId,
    final_users: Vec<User>,
    rename_map: HashMap<String, String>,
    batch_size: usize,
}

impl MergeContext<'_> {
    /// Clones a chat for insertion under the new dataset: members are the
    /// union of both sides restricted to the final user list, personal chats
    /// take the post-merge name of their non-self member, and the message
    /// count is left for the backend to derive.
    fn prepare_chat(&self, base: &Chat, slave: Option<&Chat>) -> Chat {
        let mut chat = base.clone();
        chat.ds_uuid = self.new_ds.uuid;
        chat.msg_count = 0;
        if let Some(slave) = slave {
            for id in &slave.member_ids {
                if !chat.member_ids.contains(id) {
                    chat.member_ids.push(*id);
                }
            }
        }
        chat.member_ids.retain(|id| self.final_users.iter().any(|u| u.id == *id));
        if chat.tpe == ChatType::Personal {
            let renamed = chat
                .member_ids
                .iter()
                .filter(|id| **id != self.myself_id)
                .find_map(|id| self.final_users.iter().find(|u| u.id == *id));
            if let Some(member) = renamed {
                chat.name = Some(member.pretty_name());
            }
        }
        chat
    }

    /// Strips the source-local internal id and rewrites plaintext member
    /// names that resolve to merged users; unresolved names stay verbatim.
    fn prepare_message(&self, mut msg: Message) -> Message {
        msg.internal_id = NO_INTERNAL_ID;
        let mut renamed = false;
        if let MessageTyped::Service(service) = &mut msg.typed {
            if let Some(members) = service.members_mut() {
                for member in members.iter_mut() {
                    if let Some(new_name) = self.rename_map.get(member) {
                        *member = new_name.clone();
                        renamed = true;
                    }
                }
            }
        }
        if renamed {
            msg.searchable_string = make_searchable_string(&msg.text, &msg.typed);
        }
        msg
    }
}

/// Copies the whole chat from one side in stream batches.
async fn copy_all_messages(
    ctx: &MergeContext<'_>,
    src_dao: &dyn ChatHistoryDao,
    src_chat: &Chat,
    src_root: &DatasetRoot,
    target_dao: &mut dyn MutableChatHistoryDao,
    target_chat: &Chat,
    cancel: &AtomicBool,
) -> Result<()> {
    let mut stream = MessagesStream::from_beginning(src_dao, src_chat, ctx.batch_size);
    loop {
        if cancel.load(AtomicOrdering::Relaxed) {
            return Err(Error::Cancelled);
        }
        let batch = stream.next_batch().await?;
        if batch.is_empty() {
            return Ok(());
        }
        let batch = batch.into_iter().map(|m| ctx.prepare_message(m)).collect();
        target_dao.insert_messages(batch, target_chat, src_root).await?;
    }
}

/// Copies the inclusive internal-id range from one side in stream batches.
#[allow(clippy::too_many_arguments)]
async fn copy_range(
    ctx: &MergeContext<'_>,
    src_dao: &dyn ChatHistoryDao,
    src_chat: &Chat,
    src_root: &DatasetRoot,
    target_dao: &mut dyn MutableChatHistoryDao,
    target_chat: &Chat,
    first_id: MessageInternalId,
    last_id: MessageInternalId,
    cancel: &AtomicBool,
) -> Result<()> {
    let first = src_dao
        .message_option_by_internal_id(src_chat, first_id)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "message with internal id {} in chat {}",
                first_id.0,
                src_chat.qualified_name()
            ))
        })?;

    let mut stream = MessagesStream::starting_at(src_dao, src_chat, first, ctx.batch_size);
    let mut reached_last = false;
    while !reached_last {
        if cancel.load(AtomicOrdering::Relaxed) {
            return Err(Error::Cancelled);
        }
        let mut batch = Vec::with_capacity(ctx.batch_size);
        while batch.len() < ctx.batch_size {
            match stream.next().await? {
                Some(msg) => {
                    let is_last = msg.internal_id == last_id;
                    batch.push(ctx.prepare_message(msg));
                    if is_last {
                        reached_last = true;
                        break;
                    }
                }
                None => {
                    return Err(Error::DataIntegrity {
                        context: src_chat.qualified_name(),
                        details: format!(
                            "range end with internal id {} was never reached",
                            last_id.0
                        ),
                    });
                }
            }
        }
        if !batch.is_empty() {
            target_dao.insert_messages(batch, target_chat, src_root).await?;
        }
    }
    Ok(())
}

/// Walks a Match section pairwise, picking per message the side whose
/// referenced files all exist (master preferred), and inserts maximal
/// same-side runs so files are bulk-copied from one root at a time.
#[allow(clippy::too_many_arguments)]
async fn copy_match_range(
    ctx: &MergeContext<'_>,
    master_chat: &Chat,
    slave_chat: &Chat,
    target_dao: &mut dyn MutableChatHistoryDao,
    target_chat: &Chat,
    first_master_id: MasterInternalId,
    last_master_id: MasterInternalId,
    first_slave_id: SlaveInternalId,
    last_slave_id: SlaveInternalId,
    cancel: &AtomicBool,
) -> Result<()> {
    let first_master = ctx
        .master_dao
        .message_option_by_internal_id(master_chat, first_master_id.generalize())
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "message with internal id {} in chat {}",
                first_master_id.0,
                master_chat.qualified_name()
            ))
        })?;
    let first_slave = ctx
        .slave_dao
        .message_option_by_internal_id(slave_chat, first_slave_id.generalize())
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "message with internal id {} in chat {}",
                first_slave_id.0,
                slave_chat.qualified_name()
            ))
        })?;

    let mut master_stream =
        MessagesStream::starting_at(ctx.master_dao, master_chat, first_master, ctx.batch_size);
    let mut slave_stream =
        MessagesStream::starting_at(ctx.slave_dao, slave_chat, first_slave, ctx.batch_size);

    let mut run: Vec<Message> = Vec::new();
    let mut run_is_master = true;
    loop {
        if cancel.load(AtomicOrdering::Relaxed) {
            return Err(Error::Cancelled);
        }
        let (master_msg, slave_msg) = match (master_stream.next().await?, slave_stream.next().await?) {
            (Some(m), Some(s)) => (m, s),
            _ => {
                return Err(Error::DataIntegrity {
                    context: master_chat.qualified_name(),
                    details: "matched ranges have different lengths".to_owned(),
                });
            }
        };
        let is_last = master_msg.internal_id == last_master_id.generalize();
        if is_last && slave_msg.internal_id != last_slave_id.generalize() {
            return Err(Error::DataIntegrity {
                context: master_chat.qualified_name(),
                details: "matched ranges have different lengths".to_owned(),
            });
        }

        let use_master = master_msg.files(&ctx.master_root).iter().all(|p| p.exists());
        let chosen = if use_master { master_msg } else { slave_msg };

        if !run.is_empty() && (use_master != run_is_master || run.len() >= ctx.batch_size) {
            let root = if run_is_master { &ctx.master_root } else { &ctx.slave_root };
            target_dao.insert_messages(std::mem::take(&mut run), target_chat, root).await?;
        }
        run_is_master = use_master;
        run.push(ctx.prepare_message(chosen));

        if is_last {
            break;
        }
    }
    if !run.is_empty() {
        let root = if run_is_master { &ctx.master_root } else { &ctx.slave_root };
        target_dao.insert_messages(run, target_chat, root).await?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "merge_tests.rs"]
mod tests;
