//! SQLite storage backend.
//!
//! One database file holds any number of datasets; each dataset's media
//! files live in a sibling directory named by the dataset UUID.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::dao::{copy_file, copy_referenced_files, ChatHistoryDao, MutableChatHistoryDao};
use crate::error::{Error, Result};
use crate::models::{
    Chat, ChatId, ChatType, ChatWithDetails, Dataset, DatasetRoot, Message, MessageInternalId,
    MessageSourceId, Timestamp, User, UserId,
};
use crate::schema::SCHEMA;

/// How many backup files to keep by default.
pub const DEFAULT_BACKUP_KEEP: usize = 3;

/// SQLite-backed DAO.
pub struct SqliteDao {
    name: String,
    db_file: PathBuf,
    pool: SqlitePool,
    /// Configuration-level policy: when false, no backup is ever taken.
    backups_allowed: bool,
    /// Runtime toggle used by the merge executor around a merge.
    backups_enabled: bool,
    backup_keep: usize,
}

impl SqliteDao {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        let parent = path.parent().unwrap_or(Path::new("."));
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        let name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            name,
            db_file: path.to_owned(),
            pool,
            backups_allowed: true,
            backups_enabled: true,
            backup_keep: DEFAULT_BACKUP_KEEP,
        })
    }

    /// Close the database.
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Override the backup retention count.
    pub fn with_backup_keep(mut self, keep: usize) -> Self {
        self.backup_keep = keep;
        self
    }

    /// Turn backups off entirely, regardless of the runtime toggle.
    pub fn with_backups_allowed(mut self, allowed: bool) -> Self {
        self.backups_allowed = allowed;
        self
    }

    fn data_dir(&self) -> &Path {
        self.db_file.parent().unwrap_or(Path::new("."))
    }

    fn root_for(&self, ds_uuid: &Uuid) -> DatasetRoot {
        DatasetRoot(self.data_dir().join(ds_uuid.to_string()))
    }

    async fn chat_details(&self, row: &SqliteRow, users: &[User]) -> Result<ChatWithDetails> {
        let ds_uuid_str: String = row.get("ds_uuid");
        let chat_id: i64 = row.get("id");

        let member_rows = sqlx::query(
            "SELECT user_id FROM chat_members WHERE ds_uuid = ? AND chat_id = ? ORDER BY ord",
        )
        .bind(&ds_uuid_str)
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        let member_ids: Vec<UserId> =
            member_rows.iter().map(|r| UserId(r.get::<i64, _>("user_id"))).collect();

        let msg_count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE ds_uuid = ? AND chat_id = ?",
        )
        .bind(&ds_uuid_str)
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await?;

        let chat = chat_from_row(row, member_ids, msg_count.0)?;

        let last_row = sqlx::query(
            "SELECT * FROM messages WHERE ds_uuid = ? AND chat_id = ? \
             ORDER BY internal_id DESC LIMIT 1",
        )
        .bind(&ds_uuid_str)
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        let last_msg = last_row.map(|r| message_from_row(&r)).transpose()?;

        // Members follow the user list ordering contract: self first.
        let mut members = Vec::with_capacity(chat.member_ids.len());
        if let Some(myself) = users.first() {
            members.push(myself.clone());
        }
        for member_id in &chat.member_ids {
            if users.first().is_some_and(|u| u.id == *member_id) {
                continue;
            }
            let user = users.iter().find(|u| u.id == *member_id).ok_or_else(|| {
                Error::DataIntegrity {
                    context: chat.qualified_name(),
                    details: format!("member id {} references an unknown user", member_id.0),
                }
            })?;
            members.push(user.clone());
        }

        Ok(ChatWithDetails { chat, last_msg, members })
    }

    async fn ensure_anchor(&self, chat: &Chat, msg: &Message) -> Result<()> {
        let found: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages \
             WHERE ds_uuid = ? AND chat_id = ? AND internal_id = ?",
        )
        .bind(chat.ds_uuid.to_string())
        .bind(chat.id.0)
        .bind(msg.internal_id.0)
        .fetch_one(&self.pool)
        .await?;
        if found.0 == 0 {
            return Err(Error::NotFound(format!(
                "message with internal id {} in chat {}",
                msg.internal_id.0,
                chat.qualified_name()
            )));
        }
        Ok(())
    }

    fn backups_dir(&self) -> PathBuf {
        self.data_dir().join("backups")
    }

    async fn prune_backups(&self) -> Result<()> {
        let mut backups: Vec<PathBuf> = std::fs::read_dir(self.backups_dir())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "db"))
            .collect();
        backups.sort();
        while backups.len() > self.backup_keep {
            let oldest = backups.remove(0);
            tracing::debug!(path = %oldest.display(), "pruning old backup");
            std::fs::remove_file(oldest)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ChatHistoryDao for SqliteDao {
    fn name(&self) -> &str {
        &self.name
    }

    async fn datasets(&self) -> Result<Vec<Dataset>> {
        let rows = sqlx::query("SELECT * FROM datasets ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(dataset_from_row).collect()
    }

    async fn dataset_root(&self, ds_uuid: &Uuid) -> Result<DatasetRoot> {
        Ok(self.root_for(ds_uuid))
    }

    async fn myself(&self, ds_uuid: &Uuid) -> Result<User> {
        let row = sqlx::query("SELECT * FROM users WHERE ds_uuid = ? AND is_myself = 1")
            .bind(ds_uuid.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("self user in dataset {ds_uuid}")))?;
        user_from_row(&row)
    }

    async fn users(&self, ds_uuid: &Uuid) -> Result<Vec<User>> {
        let rows = sqlx::query(
            "SELECT * FROM users WHERE ds_uuid = ? ORDER BY is_myself DESC, id ASC",
        )
        .bind(ds_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn chats(&self, ds_uuid: &Uuid) -> Result<Vec<ChatWithDetails>> {
        let users = self.users(ds_uuid).await?;
        let rows = sqlx::query("SELECT * FROM chats WHERE ds_uuid = ? ORDER BY id")
            .bind(ds_uuid.to_string())
            .fetch_all(&self.pool)
            .await?;
        let mut chats = Vec::with_capacity(rows.len());
        for row in &rows {
            chats.push(self.chat_details(row, &users).await?);
        }
        Ok(chats)
    }

    async fn chat_option(&self, ds_uuid: &Uuid, id: ChatId) -> Result<Option<ChatWithDetails>> {
        let users = self.users(ds_uuid).await?;
        let row = sqlx::query("SELECT * FROM chats WHERE ds_uuid = ? AND id = ?")
            .bind(ds_uuid.to_string())
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.chat_details(&row, &users).await?)),
            None => Ok(None),
        }
    }

    async fn scroll_messages(
        &self,
        chat: &Chat,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE ds_uuid = ? AND chat_id = ? \
             ORDER BY internal_id ASC LIMIT ? OFFSET ?",
        )
        .bind(chat.ds_uuid.to_string())
        .bind(chat.id.0)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn last_messages(&self, chat: &Chat, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE ds_uuid = ? AND chat_id = ? \
             ORDER BY internal_id DESC LIMIT ?",
        )
        .bind(chat.ds_uuid.to_string())
        .bind(chat.id.0)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut msgs: Vec<Message> = rows.iter().map(message_from_row).collect::<Result<_>>()?;
        msgs.reverse();
        Ok(msgs)
    }

    async fn messages_before(&self, chat: &Chat, msg: &Message, limit: usize)
        -> Result<Vec<Message>> {
        self.ensure_anchor(chat, msg).await?;
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE ds_uuid = ? AND chat_id = ? AND internal_id <= ? \
             ORDER BY internal_id DESC LIMIT ?",
        )
        .bind(chat.ds_uuid.to_string())
        .bind(chat.id.0)
        .bind(msg.internal_id.0)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut msgs: Vec<Message> = rows.iter().map(message_from_row).collect::<Result<_>>()?;
        msgs.reverse();
        Ok(msgs)
    }

    async fn messages_after(&self, chat: &Chat, msg: &Message, limit: usize)
        -> Result<Vec<Message>> {
        self.ensure_anchor(chat, msg).await?;
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE ds_uuid = ? AND chat_id = ? AND internal_id >= ? \
             ORDER BY internal_id ASC LIMIT ?",
        )
        .bind(chat.ds_uuid.to_string())
        .bind(chat.id.0)
        .bind(msg.internal_id.0)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn messages_between(&self, chat: &Chat, first: &Message, last: &Message)
        -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE ds_uuid = ? AND chat_id = ? \
             AND internal_id >= ? AND internal_id <= ? ORDER BY internal_id ASC",
        )
        .bind(chat.ds_uuid.to_string())
        .bind(chat.id.0)
        .bind(first.internal_id.0)
        .bind(last.internal_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn count_messages_between(&self, chat: &Chat, first: &Message, last: &Message)
        -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE ds_uuid = ? AND chat_id = ? \
             AND internal_id > ? AND internal_id < ?",
        )
        .bind(chat.ds_uuid.to_string())
        .bind(chat.id.0)
        .bind(first.internal_id.0)
        .bind(last.internal_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as usize)
    }

    async fn message_option(&self, chat: &Chat, source_id: MessageSourceId)
        -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE ds_uuid = ? AND chat_id = ? AND source_id = ? LIMIT 1",
        )
        .bind(chat.ds_uuid.to_string())
        .bind(chat.id.0)
        .bind(source_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    async fn message_option_by_internal_id(
        &self,
        chat: &Chat,
        internal_id: MessageInternalId,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE ds_uuid = ? AND chat_id = ? AND internal_id = ?",
        )
        .bind(chat.ds_uuid.to_string())
        .bind(chat.id.0)
        .bind(internal_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| message_from_row(&r)).transpose()
    }
}

#[async_trait]
impl MutableChatHistoryDao for SqliteDao {
    async fn backup(&mut self) -> Result<()> {
        if !self.backups_allowed {
            tracing::debug!("backups are turned off by configuration, skipping");
            return Ok(());
        }
        if !self.backups_enabled {
            tracing::debug!("backups are disabled, skipping");
            return Ok(());
        }
        let backups_dir = self.backups_dir();
        std::fs::create_dir_all(&backups_dir)?;

        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let mut backup_file = backups_dir.join(format!("chatmerge-backup-{stamp}.db"));
        let mut counter = 1;
        while backup_file.exists() {
            backup_file = backups_dir.join(format!("chatmerge-backup-{stamp}-{counter}.db"));
            counter += 1;
        }

        let path_str = backup_file.display().to_string().replace('\'', "''");
        sqlx::query(&format!("VACUUM INTO '{path_str}'"))
            .execute(&self.pool)
            .await?;
        tracing::info!(path = %backup_file.display(), "backup taken");

        self.prune_backups().await
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
        sqlx::query("INSERT INTO datasets (uuid, alias, source_type) VALUES (?, ?, ?)")
            .bind(ds.uuid.to_string())
            .bind(&ds.alias)
            .bind(&ds.source_type)
            .execute(&self.pool)
            .await?;
        tokio::fs::create_dir_all(self.root_for(&ds.uuid).0).await?;
        Ok(ds)
    }

    async fn insert_user(&mut self, user: User, is_myself: bool) -> Result<User> {
        sqlx::query(
            "INSERT INTO users (ds_uuid, id, first_name, last_name, username, phone_number, is_myself) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.ds_uuid.to_string())
        .bind(user.id.0)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.username)
        .bind(&user.phone_number)
        .bind(is_myself as i64)
        .execute(&self.pool)
        .await?;
        Ok(user)
    }

    async fn insert_chat(&mut self, chat: Chat, src_root: &DatasetRoot) -> Result<Chat> {
        let dst_root = self.root_for(&chat.ds_uuid);
        if let Some(img_path) = &chat.img_path {
            copy_file(img_path, src_root, &dst_root).await?;
        }

        sqlx::query("INSERT INTO chats (ds_uuid, id, name, type, img_path) VALUES (?, ?, ?, ?, ?)")
            .bind(chat.ds_uuid.to_string())
            .bind(chat.id.0)
            .bind(&chat.name)
            .bind(chat.tpe.as_str())
            .bind(&chat.img_path)
            .execute(&self.pool)
            .await?;

        for (ord, member_id) in chat.member_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO chat_members (ds_uuid, chat_id, user_id, ord) VALUES (?, ?, ?, ?)",
            )
            .bind(chat.ds_uuid.to_string())
            .bind(chat.id.0)
            .bind(member_id.0)
            .bind(ord as i64)
            .execute(&self.pool)
            .await?;
        }
        Ok(chat)
    }

    async fn insert_messages(
        &mut self,
        msgs: Vec<Message>,
        chat: &Chat,
        src_root: &DatasetRoot,
    ) -> Result<()> {
        let dst_root = self.root_for(&chat.ds_uuid);
        copy_referenced_files(&msgs, src_root, &dst_root).await?;

        for msg in &msgs {
            let inserted = sqlx::query(
                "INSERT INTO messages \
                 (ds_uuid, chat_id, source_id, timestamp, from_id, text_json, searchable_string, typed_json) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(chat.ds_uuid.to_string())
            .bind(chat.id.0)
            .bind(msg.source_id.map(|s| s.0))
            .bind(msg.timestamp.0)
            .bind(msg.from_id.0)
            .bind(serde_json::to_string(&msg.text)?)
            .bind(&msg.searchable_string)
            .bind(serde_json::to_string(&msg.typed)?)
            .execute(&self.pool)
            .await;
            if let Err(err) = inserted {
                return Err(map_message_insert_error(err, chat, msg.source_id));
            }
        }
        Ok(())
    }
}

/// The unique source-id index turns duplicates into a database error; report
/// those as the data-integrity violation they are.
fn map_message_insert_error(
    err: sqlx::Error,
    chat: &Chat,
    source_id: Option<MessageSourceId>,
) -> Error {
    match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => Error::DataIntegrity {
            context: chat.qualified_name(),
            details: format!(
                "duplicate source id {}",
                source_id.map_or_else(|| "<none>".to_owned(), |s| s.0.to_string())
            ),
        },
        other => Error::Database(other),
    }
}

fn dataset_from_row(row: &SqliteRow) -> Result<Dataset> {
    let uuid_str: String = row.get("uuid");
    Ok(Dataset {
        uuid: Uuid::parse_str(&uuid_str)
            .map_err(|e| Error::Other(format!("invalid dataset uuid {uuid_str}: {e}")))?,
        alias: row.get("alias"),
        source_type: row.get("source_type"),
    })
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let uuid_str: String = row.get("ds_uuid");
    Ok(User {
        ds_uuid: Uuid::parse_str(&uuid_str)
            .map_err(|e| Error::Other(format!("invalid dataset uuid {uuid_str}: {e}")))?,
        id: UserId(row.get("id")),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        username: row.get("username"),
        phone_number: row.get("phone_number"),
    })
}

fn chat_from_row(row: &SqliteRow, member_ids: Vec<UserId>, msg_count: i64) -> Result<Chat> {
    let uuid_str: String = row.get("ds_uuid");
    let type_str: String = row.get("type");
    Ok(Chat {
        ds_uuid: Uuid::parse_str(&uuid_str)
            .map_err(|e| Error::Other(format!("invalid dataset uuid {uuid_str}: {e}")))?,
        id: ChatId(row.get("id")),
        name: row.get("name"),
        tpe: ChatType::parse(&type_str)
            .ok_or_else(|| Error::Other(format!("unknown chat type {type_str}")))?,
        img_path: row.get("img_path"),
        member_ids,
        msg_count,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let text_json: String = row.get("text_json");
    let typed_json: String = row.get("typed_json");
    Ok(Message {
        internal_id: MessageInternalId(row.get("internal_id")),
        source_id: row.get::<Option<i64>, _>("source_id").map(MessageSourceId),
        timestamp: Timestamp(row.get("timestamp")),
        from_id: UserId(row.get("from_id")),
        text: serde_json::from_str(&text_json)?,
        searchable_string: row.get("searchable_string"),
        typed: serde_json::from_str(&typed_json)?,
    })
}
