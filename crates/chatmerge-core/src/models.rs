//! Domain models for normalized chat history entities.
//!
//! Every export format is normalized into the same shape: a [`Dataset`]
//! owning [`User`]s and [`Chat`]s, chats owning [`Message`]s, messages
//! owning their rich text and [`Content`]. Files referenced by content are
//! stored under the dataset root and addressed by forward-slash relative
//! paths.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Name shown for users that have no name at all.
pub const UNNAMED: &str = "[unnamed]";

/// Placeholder some exports emit instead of a path when the media file was
/// not downloaded. Parsers decode it to an absent path, so the core only
/// ever sees real paths or nothing.
pub const FILE_NOT_INCLUDED_SENTINEL: &str =
    "(File not included. Change data exporting settings to download.)";

/// Internal id of a message that has not been saved to any storage yet.
pub const NO_INTERNAL_ID: MessageInternalId = MessageInternalId(-1);

// =============================================================================
// Ids and handles
// =============================================================================

/// Dataset-unique numeric user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

/// Dataset-unique numeric chat id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// Dataset-stable message identifier assigned by the originating export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageSourceId(pub i64);

/// Opaque storage-assigned handle, monotonically increasing within a chat.
///
/// Not stable across DAOs, which is why it deliberately has no `Ord`:
/// ordering decisions belong to the storage backend that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageInternalId(pub i64);

/// Number of epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

/// Filesystem directory holding a dataset's media files.
///
/// Every path inside a message resolves relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRoot(pub PathBuf);

impl DatasetRoot {
    /// Resolve a root-relative path to an absolute one.
    pub fn to_absolute(&self, path_str: &str) -> PathBuf {
        let path = Path::new(path_str);
        debug_assert!(!path.is_absolute(), "path {path_str} must be relative");
        self.0.join(path)
    }

    /// Turn an absolute path under this root back into the stored relative form.
    pub fn to_relative(&self, path: &Path) -> Result<String> {
        let stripped = path.strip_prefix(&self.0).map_err(|_| {
            Error::Other(format!(
                "Path {} is not under dataset root {}",
                path.display(),
                self.0.display()
            ))
        })?;
        Ok(stripped.to_string_lossy().replace('\\', "/"))
    }
}

// =============================================================================
// Dataset, User, Chat
// =============================================================================

/// A collection of users, chats and messages imported from one source.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub uuid: Uuid,
    pub alias: String,
    /// Tag of the source the dataset was imported from, e.g. "telegram".
    pub source_type: String,
}

// Datasets are equal iff their UUIDs are.
impl PartialEq for Dataset {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl std::hash::Hash for Dataset {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

/// A chat participant. Belongs to exactly one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub ds_uuid: Uuid,
    pub id: UserId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone_number: Option<String>,
}

impl User {
    /// Best available human-readable name, if the user has any.
    pub fn pretty_name_option(&self) -> Option<String> {
        match (
            self.first_name.as_ref(),
            self.last_name.as_ref(),
            self.phone_number.as_ref(),
            self.username.as_ref(),
        ) {
            (Some(first), Some(last), _, _) => Some(format!("{first} {last}")),
            (Some(first), None, _, _) => Some(first.clone()),
            (None, Some(last), _, _) => Some(last.clone()),
            (None, None, Some(phone), _) => Some(phone.clone()),
            (None, None, None, Some(username)) => Some(username.clone()),
            (None, None, None, None) => None,
        }
    }

    /// Human-readable name, falling back to the `[unnamed]` sentinel.
    pub fn pretty_name(&self) -> String {
        self.pretty_name_option().unwrap_or_else(|| UNNAMED.to_owned())
    }
}

/// Chat kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Personal,
    PrivateGroup,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Personal => "personal",
            ChatType::PrivateGroup => "private_group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "personal" => Some(ChatType::Personal),
            "private_group" => Some(ChatType::PrivateGroup),
            _ => None,
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversation. Belongs to exactly one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub ds_uuid: Uuid,
    pub id: ChatId,
    pub name: Option<String>,
    pub tpe: ChatType,
    /// Root-relative path of the chat avatar, if any.
    pub img_path: Option<String>,
    /// Ids of the chat members. Every id must reference a known user.
    pub member_ids: Vec<UserId>,
    pub msg_count: i64,
}

impl Chat {
    /// Name used in logs and error reports.
    pub fn qualified_name(&self) -> String {
        format!("'{}' (#{})", name_or_unnamed(self.name.as_deref()), self.id.0)
    }
}

/// A chat paired with its last message and member users.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatWithDetails {
    pub chat: Chat,
    pub last_msg: Option<Message>,
    /// First element is always myself, the rest are in stable order.
    pub members: Vec<User>,
}

impl ChatWithDetails {
    /// Resolves a plaintext member name against the member list.
    pub fn resolve_member(&self, member_name: &str) -> Option<&User> {
        self.members.iter().find(|m| m.pretty_name() == member_name)
    }
}

pub fn name_or_unnamed(name: Option<&str>) -> String {
    name.unwrap_or(UNNAMED).to_owned()
}

// =============================================================================
// Rich text
// =============================================================================

/// A single span of styled message text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "val", rename_all = "snake_case")]
pub enum RichTextElement {
    Plain { text: String },
    Bold { text: String },
    Italic { text: String },
    Underline { text: String },
    Strikethrough { text: String },
    Spoiler { text: String },
    Blockquote { text: String },
    Link {
        text: Option<String>,
        href: String,
        hidden: bool,
    },
    PrefmtInline { text: String },
    PrefmtBlock {
        text: String,
        language: Option<String>,
    },
}

impl RichTextElement {
    /// Text this element contributes to the searchable string.
    ///
    /// For links that is the visible text plus the href.
    pub fn searchable_text(&self) -> String {
        use RichTextElement::*;
        match self {
            Plain { text }
            | Bold { text }
            | Italic { text }
            | Underline { text }
            | Strikethrough { text }
            | Spoiler { text }
            | Blockquote { text }
            | PrefmtInline { text }
            | PrefmtBlock { text, .. } => text.clone(),
            Link { text, href, .. } => match text.as_deref() {
                Some(t) if t == href => href.clone(),
                Some(t) => format!("{t} {href}").trim().to_owned(),
                None => href.clone(),
            },
        }
    }
}

// =============================================================================
// Content
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSticker {
    pub path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub emoji: Option<String>,
    pub width: i32,
    pub height: i32,
}

/// Also used by service messages that carry a photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPhoto {
    pub path: Option<String>,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentVoiceMsg {
    pub path: Option<String>,
    pub mime_type: Option<String>,
    pub duration_sec: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentAudio {
    pub path: Option<String>,
    pub title: Option<String>,
    pub performer: Option<String>,
    pub mime_type: Option<String>,
    pub duration_sec: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentVideoMsg {
    pub path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub width: i32,
    pub height: i32,
    pub duration_sec: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentVideo {
    pub path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub title: Option<String>,
    pub performer: Option<String>,
    pub width: i32,
    pub height: i32,
    pub duration_sec: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentAnimation {
    pub path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub width: i32,
    pub height: i32,
    pub duration_sec: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentFile {
    pub path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentLocation {
    pub title: Option<String>,
    pub address: Option<String>,
    pub lat_str: String,
    pub lon_str: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPoll {
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSharedContact {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone_number: Option<String>,
    pub vcard_path: Option<String>,
}

/// Payload of a regular message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "val", rename_all = "snake_case")]
pub enum Content {
    Sticker(ContentSticker),
    Photo(ContentPhoto),
    VoiceMsg(ContentVoiceMsg),
    Audio(ContentAudio),
    VideoMsg(ContentVideoMsg),
    Video(ContentVideo),
    Animation(ContentAnimation),
    File(ContentFile),
    Location(ContentLocation),
    Poll(ContentPoll),
    SharedContact(ContentSharedContact),
}

impl Content {
    /// Whether this variant carries a primary path field at all,
    /// regardless of it being set.
    pub fn has_path_field(&self) -> bool {
        !matches!(self, Content::Location(_) | Content::Poll(_))
    }

    /// Value of the primary path field, if the variant has one and it is set.
    pub fn path(&self) -> Option<&str> {
        use Content::*;
        match self {
            Sticker(c) => c.path.as_deref(),
            Photo(c) => c.path.as_deref(),
            VoiceMsg(c) => c.path.as_deref(),
            Audio(c) => c.path.as_deref(),
            VideoMsg(c) => c.path.as_deref(),
            Video(c) => c.path.as_deref(),
            Animation(c) => c.path.as_deref(),
            File(c) => c.path.as_deref(),
            SharedContact(c) => c.vcard_path.as_deref(),
            Location(_) | Poll(_) => None,
        }
    }

    /// Value of the thumbnail path field, if the variant has one and it is set.
    pub fn thumbnail_path(&self) -> Option<&str> {
        use Content::*;
        match self {
            Sticker(c) => c.thumbnail_path.as_deref(),
            VideoMsg(c) => c.thumbnail_path.as_deref(),
            Video(c) => c.thumbnail_path.as_deref(),
            Animation(c) => c.thumbnail_path.as_deref(),
            File(c) => c.thumbnail_path.as_deref(),
            _ => None,
        }
    }

    /// Copy of this content with every path field unset.
    pub fn with_paths_blanked(&self) -> Content {
        use Content::*;
        let mut copy = self.clone();
        match &mut copy {
            Sticker(c) => {
                c.path = None;
                c.thumbnail_path = None;
            }
            Photo(c) => c.path = None,
            VoiceMsg(c) => c.path = None,
            Audio(c) => c.path = None,
            VideoMsg(c) => {
                c.path = None;
                c.thumbnail_path = None;
            }
            Video(c) => {
                c.path = None;
                c.thumbnail_path = None;
            }
            Animation(c) => {
                c.path = None;
                c.thumbnail_path = None;
            }
            File(c) => {
                c.path = None;
                c.thumbnail_path = None;
            }
            SharedContact(c) => c.vcard_path = None,
            Location(_) | Poll(_) => {}
        }
        copy
    }

    /// Every root-relative file path this content references.
    pub fn files_relative(&self) -> Vec<&str> {
        [self.path(), self.thumbnail_path()].into_iter().flatten().collect()
    }

    fn searchable_components(&self) -> Vec<String> {
        use Content::*;
        let opts: Vec<Option<&String>> = match self {
            Sticker(c) => vec![c.emoji.as_ref()],
            Audio(c) => vec![c.title.as_ref(), c.performer.as_ref()],
            Video(c) => vec![c.title.as_ref(), c.performer.as_ref()],
            File(c) => vec![c.file_name.as_ref()],
            Location(c) => {
                return [c.title.as_deref(), c.address.as_deref()]
                    .into_iter()
                    .flatten()
                    .map(str::to_owned)
                    .chain([c.lat_str.clone(), c.lon_str.clone()])
                    .collect();
            }
            Poll(c) => return vec![c.question.clone()],
            SharedContact(c) => {
                vec![c.first_name.as_ref(), c.last_name.as_ref(), c.phone_number.as_ref()]
            }
            Photo(_) | VoiceMsg(_) | VideoMsg(_) | Animation(_) => vec![],
        };
        opts.into_iter().flatten().cloned().collect()
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Payload of a regular (user-authored) message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRegular {
    pub edit_timestamp: Option<Timestamp>,
    pub forward_from_name: Option<String>,
    pub reply_to_source_id: Option<MessageSourceId>,
    pub content: Option<Content>,
}

/// System-generated message variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "val", rename_all = "snake_case")]
pub enum MessageService {
    PhoneCall {
        duration_sec: Option<i32>,
        discard_reason: Option<String>,
        members: Vec<String>,
    },
    SuggestProfilePhoto {
        photo: ContentPhoto,
    },
    PinMessage {
        message_source_id: MessageSourceId,
    },
    ClearHistory,
    BlockUser {
        is_blocked: bool,
    },
    StatusTextChanged,
    Notice,
    GroupCreate {
        title: String,
        members: Vec<String>,
    },
    GroupEditTitle {
        title: String,
    },
    GroupEditPhoto {
        photo: ContentPhoto,
    },
    GroupDeletePhoto,
    GroupInviteMembers {
        members: Vec<String>,
    },
    GroupRemoveMembers {
        members: Vec<String>,
    },
    GroupMigrateFrom {
        title: String,
    },
    GroupMigrateTo,
    GroupCall {
        members: Vec<String>,
    },
}

impl MessageService {
    /// Plaintext member names carried by this variant, if any.
    pub fn members(&self) -> Option<&[String]> {
        use MessageService::*;
        match self {
            PhoneCall { members, .. }
            | GroupCreate { members, .. }
            | GroupInviteMembers { members }
            | GroupRemoveMembers { members }
            | GroupCall { members } => Some(members.as_slice()),
            _ => None,
        }
    }

    pub fn members_mut(&mut self) -> Option<&mut Vec<String>> {
        use MessageService::*;
        match self {
            PhoneCall { members, .. }
            | GroupCreate { members, .. }
            | GroupInviteMembers { members }
            | GroupRemoveMembers { members }
            | GroupCall { members } => Some(members),
            _ => None,
        }
    }

    /// Photo carried by this variant, if any.
    pub fn photo(&self) -> Option<&ContentPhoto> {
        match self {
            MessageService::SuggestProfilePhoto { photo } | MessageService::GroupEditPhoto { photo } => {
                Some(photo)
            }
            _ => None,
        }
    }

    fn searchable_components(&self) -> Vec<String> {
        use MessageService::*;
        match self {
            PhoneCall { members, .. } => members.clone(),
            GroupCreate { title, members } => {
                std::iter::once(title.clone()).chain(members.iter().cloned()).collect()
            }
            GroupInviteMembers { members } | GroupRemoveMembers { members } | GroupCall { members } => {
                members.clone()
            }
            GroupMigrateFrom { title } => vec![title.clone()],
            _ => vec![],
        }
    }
}

/// Tagged message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "val", rename_all = "snake_case")]
pub enum MessageTyped {
    Regular(MessageRegular),
    Service(MessageService),
}

/// A single message within a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Storage-assigned, see [`MessageInternalId`]. `NO_INTERNAL_ID` until saved.
    pub internal_id: MessageInternalId,
    pub source_id: Option<MessageSourceId>,
    pub timestamp: Timestamp,
    /// Author id. May reference a user outside the chat member set if the
    /// author left the chat.
    pub from_id: UserId,
    pub text: Vec<RichTextElement>,
    pub searchable_string: String,
    pub typed: MessageTyped,
}

impl Message {
    /// Creates a message, deriving its searchable string.
    pub fn new(
        internal_id: MessageInternalId,
        source_id: Option<MessageSourceId>,
        timestamp: Timestamp,
        from_id: UserId,
        text: Vec<RichTextElement>,
        typed: MessageTyped,
    ) -> Self {
        let searchable_string = make_searchable_string(&text, &typed);
        Message {
            internal_id,
            source_id,
            timestamp,
            from_id,
            text,
            searchable_string,
            typed,
        }
    }

    /// Every root-relative file path referenced by this message.
    /// Does not check file existence.
    pub fn files_relative(&self) -> Vec<&str> {
        match &self.typed {
            MessageTyped::Regular(r) => {
                r.content.as_ref().map(|c| c.files_relative()).unwrap_or_default()
            }
            MessageTyped::Service(s) => {
                s.photo().and_then(|p| p.path.as_deref()).into_iter().collect()
            }
        }
    }

    /// Absolute paths of every referenced file under the given root.
    pub fn files(&self, ds_root: &DatasetRoot) -> Vec<PathBuf> {
        self.files_relative().iter().map(|p| ds_root.to_absolute(p)).collect()
    }
}

// =============================================================================
// Master/slave tagging
// =============================================================================
//
// The merge engine walks two snapshots of the same conversation. Wrapping
// each side in its own type keeps a master handle from ever being looked up
// in the slave DAO or vice versa.

/// Internal id of a message in the master snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterInternalId(pub i64);

impl MasterInternalId {
    pub fn generalize(self) -> MessageInternalId {
        MessageInternalId(self.0)
    }
}

/// Internal id of a message in the slave snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlaveInternalId(pub i64);

impl SlaveInternalId {
    pub fn generalize(self) -> MessageInternalId {
        MessageInternalId(self.0)
    }
}

/// A message known to come from the master snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterMessage(pub Message);

impl MasterMessage {
    pub fn typed_id(&self) -> MasterInternalId {
        MasterInternalId(self.0.internal_id.0)
    }
}

/// A message known to come from the slave snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlaveMessage(pub Message);

impl SlaveMessage {
    pub fn typed_id(&self) -> SlaveInternalId {
        SlaveInternalId(self.0.internal_id.0)
    }
}

// =============================================================================
// Searchable string derivation
// =============================================================================

/// Collapses separators, invisible formatting characters and newlines into
/// single spaces and trims the result.
pub fn normalize_searchable_string(s: &str) -> String {
    static NORMALIZE_REGEX: OnceLock<Regex> = OnceLock::new();
    let re = NORMALIZE_REGEX
        .get_or_init(|| Regex::new(r"[\p{Z}\p{Cf}\n]+").expect("valid normalization regex"));
    re.replace_all(s, " ").trim().to_owned()
}

/// Derives the searchable string: all rich text (links contributing their
/// href), then content- or service-specific text such as member lists,
/// titles, file names and coordinates.
pub fn make_searchable_string(text: &[RichTextElement], typed: &MessageTyped) -> String {
    let mut components: Vec<String> = text
        .iter()
        .map(RichTextElement::searchable_text)
        .filter(|s| !s.is_empty())
        .collect();

    match typed {
        MessageTyped::Regular(r) => {
            if let Some(content) = &r.content {
                components.extend(content.searchable_components());
            }
        }
        MessageTyped::Service(s) => components.extend(s.searchable_components()),
    }

    normalize_searchable_string(&components.join(" "))
}

#[cfg(test)]
#[path = "models_tests.rs"]
mod tests;
