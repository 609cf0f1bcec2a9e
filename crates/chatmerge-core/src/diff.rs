//! Two-stream diff analysis over a chat pair.
//!
//! Given a master chat and a slave chat that are snapshots of the same
//! conversation, the analyzer walks both message streams in lockstep and
//! partitions them into labeled sections. Concatenating the master halves
//! of the sections reproduces the master stream, likewise for the slave.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use crate::dao::ChatHistoryDao;
use crate::equality::PracticalEqCtx;
use crate::error::{Error, Result, TimeShiftError};
use crate::merge::{ChatMergeOption, ChatMergeRequest};
use crate::models::{
    Chat, Dataset, MasterInternalId, MasterMessage, Message, MessageService, MessageTyped,
    SlaveInternalId, SlaveMessage,
};
use crate::stream::{MessagesStream, DEFAULT_BATCH_SIZE};

/// Telegram widened user ids from 32 to 64 bits in late 2020; ids above this
/// threshold only appear in newer exports.
const USER_ID_WIDENING_THRESHOLD: i64 = 1 << 32;

/// A labeled range covering parts of both the master and the slave stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagesMergeDiff {
    /// Ranges align message-for-message under content-aware equality.
    Match {
        first_master_id: MasterInternalId,
        last_master_id: MasterInternalId,
        first_slave_id: SlaveInternalId,
        last_slave_id: SlaveInternalId,
    },
    /// Present only in master.
    Retain {
        first_master_id: MasterInternalId,
        last_master_id: MasterInternalId,
    },
    /// Present only in slave.
    Add {
        first_slave_id: SlaveInternalId,
        last_slave_id: SlaveInternalId,
    },
    /// Aligned by source id, but the contents differ.
    Replace {
        first_master_id: MasterInternalId,
        last_master_id: MasterInternalId,
        first_slave_id: SlaveInternalId,
        last_slave_id: SlaveInternalId,
    },
}

/// Analyzes chat pairs between a master and a slave dataset.
///
/// Holds the file digest cache for the whole run, so media shared between
/// chats is hashed once.
pub struct DatasetDiffAnalyzer<'a> {
    master_dao: &'a dyn ChatHistoryDao,
    slave_dao: &'a dyn ChatHistoryDao,
    eq: PracticalEqCtx,
    batch_size: usize,
}

impl<'a> DatasetDiffAnalyzer<'a> {
    pub async fn new(
        master_dao: &'a dyn ChatHistoryDao,
        master_ds: &Dataset,
        slave_dao: &'a dyn ChatHistoryDao,
        slave_ds: &Dataset,
    ) -> Result<DatasetDiffAnalyzer<'a>> {
        let master_root = master_dao.dataset_root(&master_ds.uuid).await?;
        let slave_root = slave_dao.dataset_root(&slave_ds.uuid).await?;
        Ok(DatasetDiffAnalyzer {
            master_dao,
            slave_dao,
            eq: PracticalEqCtx::new(master_root, slave_root),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Resolves every merge request, running [`Self::analyze`] for each
    /// Combine pair.
    pub async fn analyze_chats(
        &mut self,
        requests: Vec<ChatMergeRequest>,
        cancel: &AtomicBool,
    ) -> Result<Vec<ChatMergeOption>> {
        let mut options = Vec::with_capacity(requests.len());
        for request in requests {
            options.push(match request {
                ChatMergeRequest::Keep { master_chat } => ChatMergeOption::Keep { master_chat },
                ChatMergeRequest::Add { slave_chat } => ChatMergeOption::Add { slave_chat },
                ChatMergeRequest::Combine { master_chat, slave_chat } => {
                    let title = master_chat.qualified_name();
                    let sections = self.analyze(&master_chat, &slave_chat, &title, cancel).await?;
                    ChatMergeOption::Combine { master_chat, slave_chat, sections }
                }
            });
        }
        Ok(options)
    }

    /// Walks both streams in lockstep and emits the ordered section list.
    ///
    /// Fatal outcomes: a data-integrity violation (two messages that are
    /// indistinguishable under the ordering relation yet not equal), a
    /// detected cross-dataset time shift, or cancellation.
    pub async fn analyze(
        &mut self,
        master_chat: &Chat,
        slave_chat: &Chat,
        title: &str,
        cancel: &AtomicBool,
    ) -> Result<Vec<MessagesMergeDiff>> {
        tracing::debug!(chat = title, "analyzing chat pair");

        let mut master_stream =
            MessagesStream::from_beginning(self.master_dao, master_chat, self.batch_size);
        let mut slave_stream =
            MessagesStream::from_beginning(self.slave_dao, slave_chat, self.batch_size);

        let mut sections: Vec<MessagesMergeDiff> = Vec::new();
        let mut state = AnalysisState::NoState;

        loop {
            if cancel.load(AtomicOrdering::Relaxed) {
                return Err(Error::Cancelled);
            }

            let master_head = master_stream.peek().await?.cloned().map(MasterMessage);
            let slave_head = slave_stream.peek().await?.cloned().map(SlaveMessage);

            // An open conflict keeps absorbing head pairs while both streams
            // have one and the pair is not practically equal. Ordering is not
            // consulted: pairs inside a conflict run need not be orderable
            // against each other.
            if let AnalysisState::Conflict { last_master, last_slave, .. } = &mut state {
                if let (Some(mm), Some(sm)) = (&master_head, &slave_head) {
                    if !self.eq.messages_equal(&mm.0, &sm.0)? {
                        *last_master = mm.typed_id();
                        *last_slave = sm.typed_id();
                        master_stream.next().await?;
                        slave_stream.next().await?;
                        continue;
                    }
                }
            }

            let decision =
                self.decide(master_head.as_ref(), slave_head.as_ref(), title)?;

            // Other in-progress sections keep extending while the step
            // decision matches their kind.
            let continued = match (&mut state, &decision) {
                (AnalysisState::Match { last_master, last_slave, .. }, StepDecision::Match) => {
                    *last_master = head_master_id(&master_head);
                    *last_slave = head_slave_id(&slave_head);
                    master_stream.next().await?;
                    slave_stream.next().await?;
                    true
                }
                (AnalysisState::Retention { last_master, .. }, StepDecision::Retain) => {
                    *last_master = head_master_id(&master_head);
                    master_stream.next().await?;
                    true
                }
                (AnalysisState::Addition { last_slave, .. }, StepDecision::Add) => {
                    *last_slave = head_slave_id(&slave_head);
                    slave_stream.next().await?;
                    true
                }
                _ => false,
            };
            if continued {
                continue;
            }

            // Any other transition out of an in-progress state closes the
            // open section; the same heads are then re-dispatched.
            if !matches!(state, AnalysisState::NoState) {
                let closed = std::mem::replace(&mut state, AnalysisState::NoState);
                sections.push(closed.into_section());
                continue;
            }

            match decision {
                StepDecision::Finished => break,
                StepDecision::Match => {
                    let first_master = head_master_id(&master_head);
                    let first_slave = head_slave_id(&slave_head);
                    state = AnalysisState::Match {
                        first_master,
                        last_master: first_master,
                        first_slave,
                        last_slave: first_slave,
                    };
                    master_stream.next().await?;
                    slave_stream.next().await?;
                }
                StepDecision::ReplaceSingle => {
                    let master_id = head_master_id(&master_head);
                    let slave_id = head_slave_id(&slave_head);
                    sections.push(MessagesMergeDiff::Replace {
                        first_master_id: master_id,
                        last_master_id: master_id,
                        first_slave_id: slave_id,
                        last_slave_id: slave_id,
                    });
                    master_stream.next().await?;
                    slave_stream.next().await?;
                }
                StepDecision::Conflict => {
                    let first_master = head_master_id(&master_head);
                    let first_slave = head_slave_id(&slave_head);
                    state = AnalysisState::Conflict {
                        first_master,
                        last_master: first_master,
                        first_slave,
                        last_slave: first_slave,
                    };
                    master_stream.next().await?;
                    slave_stream.next().await?;
                }
                StepDecision::Retain => {
                    let first_master = head_master_id(&master_head);
                    state = AnalysisState::Retention {
                        first_master,
                        last_master: first_master,
                    };
                    master_stream.next().await?;
                }
                StepDecision::Add => {
                    let first_slave = head_slave_id(&slave_head);
                    state = AnalysisState::Addition {
                        first_slave,
                        last_slave: first_slave,
                    };
                    slave_stream.next().await?;
                }
            }
        }

        tracing::debug!(chat = title, sections = sections.len(), "analysis finished");
        Ok(sections)
    }

    /// The NoState decision for the current pair of heads. Match, Retention
    /// and Addition stay open exactly as long as this decision keeps
    /// matching their kind; an open conflict instead continues on bare
    /// practical inequality and is handled before this is consulted.
    fn decide(
        &mut self,
        master_head: Option<&MasterMessage>,
        slave_head: Option<&SlaveMessage>,
        title: &str,
    ) -> Result<StepDecision> {
        let (mm, sm) = match (master_head, slave_head) {
            (None, None) => return Ok(StepDecision::Finished),
            (Some(_), None) => return Ok(StepDecision::Retain),
            (None, Some(_)) => return Ok(StepDecision::Add),
            (Some(mm), Some(sm)) => (mm, sm),
        };

        if self.matches_content_aware(mm, sm)? {
            return Ok(StepDecision::Match);
        }
        if self.is_migrate_from_id_widening(mm, sm)? {
            return Ok(StepDecision::ReplaceSingle);
        }

        if let (Some(m_src), Some(s_src)) = (mm.0.source_id, sm.0.source_id) {
            if m_src == s_src {
                if let Some(shift_secs) = self.detect_time_shift(mm, sm)? {
                    return Err(Error::TimeShift(TimeShiftError {
                        chat: title.to_owned(),
                        shift_secs,
                    }));
                }
                return Ok(StepDecision::Conflict);
            }
        }

        match cmp_messages(&mm.0, &sm.0, title)? {
            // Slave head is earlier: it is missing from master.
            Ordering::Greater => Ok(StepDecision::Add),
            Ordering::Less => Ok(StepDecision::Retain),
            Ordering::Equal => Err(Error::DataIntegrity {
                context: title.to_owned(),
                details: format!(
                    "messages with internal ids {} (master) and {} (slave) are ordered equal \
                     but are not practically equal",
                    mm.0.internal_id.0, sm.0.internal_id.0
                ),
            }),
        }
    }

    /// Match equality: practical equality disregarding content, except that
    /// content existing only on the slave side must produce a Replace so
    /// the merge can pick up the new file.
    fn matches_content_aware(&mut self, mm: &MasterMessage, sm: &SlaveMessage) -> Result<bool> {
        if self.has_new_content(mm, sm) {
            return Ok(false);
        }
        self.eq.messages_equal_disregarding_content(&mm.0, &sm.0)
    }

    /// True when both sides carry path-bearing content, the master file is
    /// absent under the master root and the slave file exists under the
    /// slave root. Applied uniformly to every path-bearing content variant
    /// and to service-message photos.
    fn has_new_content(&self, mm: &MasterMessage, sm: &SlaveMessage) -> bool {
        let (master_path, slave_path) = match (&mm.0.typed, &sm.0.typed) {
            (MessageTyped::Regular(mr), MessageTyped::Regular(sr)) => {
                match (&mr.content, &sr.content) {
                    (Some(mc), Some(sc)) if mc.has_path_field() && sc.has_path_field() => {
                        (mc.path(), sc.path())
                    }
                    _ => return false,
                }
            }
            (MessageTyped::Service(ms), MessageTyped::Service(ss)) => {
                match (ms.photo(), ss.photo()) {
                    (Some(mp), Some(sp)) => (mp.path.as_deref(), sp.path.as_deref()),
                    _ => return false,
                }
            }
            _ => return false,
        };
        let master_absent =
            master_path.map_or(true, |p| !self.eq.master_root.to_absolute(p).exists());
        let slave_present =
            slave_path.is_some_and(|p| self.eq.slave_root.to_absolute(p).exists());
        master_absent && slave_present
    }

    /// Telegram's 2020-10 user-id widening: the same GroupMigrateFrom
    /// message reappears with a widened author id. Replacing the single
    /// message keeps the newer id.
    fn is_migrate_from_id_widening(
        &mut self,
        mm: &MasterMessage,
        sm: &SlaveMessage,
    ) -> Result<bool> {
        match (&mm.0.typed, &sm.0.typed) {
            (
                MessageTyped::Service(MessageService::GroupMigrateFrom { .. }),
                MessageTyped::Service(MessageService::GroupMigrateFrom { .. }),
            ) => {}
            _ => return Ok(false),
        }
        if mm.0.source_id.is_none() || mm.0.source_id != sm.0.source_id {
            return Ok(false);
        }
        if mm.0.from_id.0 >= USER_ID_WIDENING_THRESHOLD
            || sm.0.from_id.0 < USER_ID_WIDENING_THRESHOLD
        {
            return Ok(false);
        }
        let mut patched = mm.0.clone();
        patched.from_id = sm.0.from_id;
        self.eq.messages_equal(&patched, &sm.0)
    }

    /// If substituting the slave timestamp into the master message makes the
    /// two practically equal, the datasets disagree by a clock offset.
    fn detect_time_shift(&mut self, mm: &MasterMessage, sm: &SlaveMessage) -> Result<Option<i64>> {
        if mm.0.timestamp == sm.0.timestamp {
            return Ok(None);
        }
        let mut patched = mm.0.clone();
        patched.timestamp = sm.0.timestamp;
        if self.eq.messages_equal(&patched, &sm.0)? {
            Ok(Some(sm.0.timestamp.0 - mm.0.timestamp.0))
        } else {
            Ok(None)
        }
    }
}

/// Analyzes every requested chat pair in one go. See
/// [`DatasetDiffAnalyzer::analyze_chats`].
pub async fn analyze(
    master_dao: &dyn ChatHistoryDao,
    master_ds: &Dataset,
    slave_dao: &dyn ChatHistoryDao,
    slave_ds: &Dataset,
    requests: Vec<ChatMergeRequest>,
    cancel: &AtomicBool,
) -> Result<Vec<ChatMergeOption>> {
    DatasetDiffAnalyzer::new(master_dao, master_ds, slave_dao, slave_ds)
        .await?
        .analyze_chats(requests, cancel)
        .await
}

/// Message ordering across DAOs: timestamp, then source id where both are
/// present, with identical searchable strings breaking the remaining tie as
/// equal. Anything else is a data error.
fn cmp_messages(master: &Message, slave: &Message, title: &str) -> Result<Ordering> {
    match master.timestamp.cmp(&slave.timestamp) {
        Ordering::Equal => {}
        unequal => return Ok(unequal),
    }
    if let (Some(m_src), Some(s_src)) = (master.source_id, slave.source_id) {
        match m_src.cmp(&s_src) {
            Ordering::Equal => {}
            unequal => return Ok(unequal),
        }
    }
    if master.searchable_string == slave.searchable_string {
        Ok(Ordering::Equal)
    } else {
        Err(Error::DataIntegrity {
            context: title.to_owned(),
            details: format!(
                "messages with internal ids {} (master) and {} (slave) share a timestamp \
                 but cannot be ordered",
                master.internal_id.0, slave.internal_id.0
            ),
        })
    }
}

#[derive(Debug)]
enum StepDecision {
    Finished,
    Match,
    /// Single-step Replace, see the GroupMigrateFrom id-widening rule.
    ReplaceSingle,
    Conflict,
    Retain,
    Add,
}

/// State of the lockstep walk. In-progress variants track the ids that
/// opened the section and the last ids seen on each side.
#[derive(Debug)]
enum AnalysisState {
    NoState,
    Match {
        first_master: MasterInternalId,
        last_master: MasterInternalId,
        first_slave: SlaveInternalId,
        last_slave: SlaveInternalId,
    },
    Retention {
        first_master: MasterInternalId,
        last_master: MasterInternalId,
    },
    Addition {
        first_slave: SlaveInternalId,
        last_slave: SlaveInternalId,
    },
    Conflict {
        first_master: MasterInternalId,
        last_master: MasterInternalId,
        first_slave: SlaveInternalId,
        last_slave: SlaveInternalId,
    },
}

impl AnalysisState {
    fn into_section(self) -> MessagesMergeDiff {
        match self {
            AnalysisState::NoState => unreachable!("NoState holds no section"),
            AnalysisState::Match { first_master, last_master, first_slave, last_slave } => {
                MessagesMergeDiff::Match {
                    first_master_id: first_master,
                    last_master_id: last_master,
                    first_slave_id: first_slave,
                    last_slave_id: last_slave,
                }
            }
            AnalysisState::Retention { first_master, last_master } => MessagesMergeDiff::Retain {
                first_master_id: first_master,
                last_master_id: last_master,
            },
            AnalysisState::Addition { first_slave, last_slave } => MessagesMergeDiff::Add {
                first_slave_id: first_slave,
                last_slave_id: last_slave,
            },
            AnalysisState::Conflict { first_master, last_master, first_slave, last_slave } => {
                MessagesMergeDiff::Replace {
                    first_master_id: first_master,
                    last_master_id: last_master,
                    first_slave_id: first_slave,
                    last_slave_id: last_slave,
                }
            }
        }
    }
}

fn head_master_id(head: &Option<MasterMessage>) -> MasterInternalId {
    match head {
        Some(msg) => msg.typed_id(),
        None => unreachable!("decision requiring a master head implies one exists"),
    }
}

fn head_slave_id(head: &Option<SlaveMessage>) -> SlaveInternalId {
    match head {
        Some(msg) => msg.typed_id(),
        None => unreachable!("decision requiring a slave head implies one exists"),
    }
}

#[cfg(test)]
#[path = "diff_tests.rs"]
mod tests;
