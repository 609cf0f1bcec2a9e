//! Lazy, batched message streams over a DAO.
//!
//! The diff engine and the merge executor walk chats that may hold millions
//! of messages; streams fetch them in fixed-size batches and never
//! materialize a whole chat.

use std::collections::VecDeque;

use crate::dao::ChatHistoryDao;
use crate::error::Result;
use crate::models::{Chat, Message};

/// Default number of messages fetched per DAO round trip.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// A forward stream of a chat's messages, restartable from any anchor.
pub struct MessagesStream<'a> {
    dao: &'a dyn ChatHistoryDao,
    chat: &'a Chat,
    batch_size: usize,
    buffer: VecDeque<Message>,
    /// Last message pulled from the DAO; anchor of the next fetch.
    last_fetched: Option<Message>,
    started: bool,
    exhausted: bool,
}

impl<'a> MessagesStream<'a> {
    /// Stream starting at the first message of the chat.
    pub fn from_beginning(dao: &'a dyn ChatHistoryDao, chat: &'a Chat, batch_size: usize) -> Self {
        Self {
            dao,
            chat,
            batch_size,
            buffer: VecDeque::new(),
            last_fetched: None,
            started: false,
            exhausted: false,
        }
    }

    /// Stream starting immediately after the given anchor message.
    pub fn after(dao: &'a dyn ChatHistoryDao, chat: &'a Chat, anchor: Message, batch_size: usize) -> Self {
        Self {
            dao,
            chat,
            batch_size,
            buffer: VecDeque::new(),
            last_fetched: Some(anchor),
            started: true,
            exhausted: false,
        }
    }

    /// Stream starting at the given anchor message, inclusive.
    pub fn starting_at(
        dao: &'a dyn ChatHistoryDao,
        chat: &'a Chat,
        anchor: Message,
        batch_size: usize,
    ) -> Self {
        let mut buffer = VecDeque::new();
        buffer.push_back(anchor.clone());
        Self {
            dao,
            chat,
            batch_size,
            buffer,
            last_fetched: Some(anchor),
            started: true,
            exhausted: false,
        }
    }

    /// Next message without consuming it.
    pub async fn peek(&mut self) -> Result<Option<&Message>> {
        if self.buffer.is_empty() {
            self.refill().await?;
        }
        Ok(self.buffer.front())
    }

    /// Next message, consuming it.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        if self.buffer.is_empty() {
            self.refill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Everything currently buffered, refilling first if empty. Returns an
    /// empty vector once the stream is exhausted. Intended for bulk copy
    /// loops that insert whole batches at a time.
    pub async fn next_batch(&mut self) -> Result<Vec<Message>> {
        if self.buffer.is_empty() {
            self.refill().await?;
        }
        Ok(self.buffer.drain(..).collect())
    }

    async fn refill(&mut self) -> Result<()> {
        if self.exhausted {
            return Ok(());
        }
        let fetched = match &self.last_fetched {
            None if !self.started => {
                self.started = true;
                self.dao.first_messages(self.chat, self.batch_size).await?
            }
            None => return Ok(()),
            Some(anchor) => {
                // The anchor itself is included by the DAO; drop it.
                let mut batch = self.dao.messages_after(self.chat, anchor, self.batch_size + 1).await?;
                if !batch.is_empty() {
                    batch.remove(0);
                }
                batch
            }
        };
        if fetched.len() < self.batch_size {
            self.exhausted = true;
        }
        if let Some(last) = fetched.last() {
            self.last_fetched = Some(last.clone());
        }
        self.buffer.extend(fetched);
        Ok(())
    }
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
