//! Practical equality: the comparison the merge engine uses across DAOs.
//!
//! Two messages from different snapshots are "practically equal" when they
//! are structurally equal after ignoring storage-assigned fields
//! (`internal_id`, `forward_from_name`) and comparing referenced files by
//! their bytes rather than by their paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::models::{
    Content, ContentPhoto, DatasetRoot, Message, MessageService, MessageTyped,
};

/// Per-run cache of file content digests, keyed by absolute path.
///
/// Merge analysis compares the same media files over and over; hashing each
/// one once per run keeps large datasets tractable. `None` records that
/// nothing exists at the path.
#[derive(Debug, Default)]
pub struct FileDigests {
    cache: HashMap<PathBuf, Option<[u8; 32]>>,
}

impl FileDigests {
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(&mut self, abs_path: &Path) -> Result<Option<[u8; 32]>> {
        if let Some(cached) = self.cache.get(abs_path) {
            return Ok(*cached);
        }
        let value = if abs_path.is_file() {
            let bytes = std::fs::read(abs_path)?;
            Some(Sha256::digest(&bytes).into())
        } else {
            None
        };
        self.cache.insert(abs_path.to_owned(), value);
        Ok(value)
    }
}

/// Comparison context for one analysis or merge run: the two dataset roots
/// plus the shared digest cache.
pub struct PracticalEqCtx {
    pub master_root: DatasetRoot,
    pub slave_root: DatasetRoot,
    digests: FileDigests,
}

impl PracticalEqCtx {
    pub fn new(master_root: DatasetRoot, slave_root: DatasetRoot) -> Self {
        Self {
            master_root,
            slave_root,
            digests: FileDigests::new(),
        }
    }

    /// Two file references are equal iff both resolve to existing files with
    /// identical bytes, or both resolve to nothing (unset path and missing
    /// file are the same thing here).
    pub fn files_equal(
        &mut self,
        master_rel: Option<&str>,
        slave_rel: Option<&str>,
    ) -> Result<bool> {
        let master_digest = match master_rel {
            Some(rel) => self.digests.digest(&self.master_root.to_absolute(rel))?,
            None => None,
        };
        let slave_digest = match slave_rel {
            Some(rel) => self.digests.digest(&self.slave_root.to_absolute(rel))?,
            None => None,
        };
        Ok(master_digest == slave_digest)
    }

    /// Content equality: same variant, field-equal after blanking the path
    /// fields, byte-equal files at path and thumbnail.
    pub fn contents_equal(&mut self, master: &Content, slave: &Content) -> Result<bool> {
        if master.with_paths_blanked() != slave.with_paths_blanked() {
            return Ok(false);
        }
        Ok(self.files_equal(master.path(), slave.path())?
            && self.files_equal(master.thumbnail_path(), slave.thumbnail_path())?)
    }

    /// Photo equality, for service messages that carry one.
    pub fn photos_equal(&mut self, master: &ContentPhoto, slave: &ContentPhoto) -> Result<bool> {
        if (master.width, master.height) != (slave.width, slave.height) {
            return Ok(false);
        }
        self.files_equal(master.path.as_deref(), slave.path.as_deref())
    }

    /// Full practical equality of two messages.
    pub fn messages_equal(&mut self, master: &Message, slave: &Message) -> Result<bool> {
        self.messages_equal_inner(master, slave, false)
    }

    /// Practical equality with regular-message content ignored entirely and
    /// service photos compared by their non-path fields only.
    ///
    /// This is the base relation for Match detection; the new-content rule
    /// on top of it lives in the diff engine.
    pub fn messages_equal_disregarding_content(
        &mut self,
        master: &Message,
        slave: &Message,
    ) -> Result<bool> {
        self.messages_equal_inner(master, slave, true)
    }

    fn messages_equal_inner(
        &mut self,
        master: &Message,
        slave: &Message,
        disregard_content: bool,
    ) -> Result<bool> {
        if master.source_id != slave.source_id
            || master.timestamp != slave.timestamp
            || master.from_id != slave.from_id
            || master.text != slave.text
            || master.searchable_string != slave.searchable_string
        {
            return Ok(false);
        }
        match (&master.typed, &slave.typed) {
            (MessageTyped::Regular(mr), MessageTyped::Regular(sr)) => {
                // forward_from_name is ignored by design.
                if mr.edit_timestamp != sr.edit_timestamp
                    || mr.reply_to_source_id != sr.reply_to_source_id
                {
                    return Ok(false);
                }
                if disregard_content {
                    return Ok(true);
                }
                match (&mr.content, &sr.content) {
                    (None, None) => Ok(true),
                    (Some(mc), Some(sc)) => self.contents_equal(mc, sc),
                    _ => Ok(false),
                }
            }
            (MessageTyped::Service(ms), MessageTyped::Service(ss)) => {
                self.services_equal(ms, ss, disregard_content)
            }
            _ => Ok(false),
        }
    }

    fn services_equal(
        &mut self,
        master: &MessageService,
        slave: &MessageService,
        disregard_content: bool,
    ) -> Result<bool> {
        use MessageService::*;
        match (master, slave) {
            (GroupEditPhoto { photo: mp }, GroupEditPhoto { photo: sp })
            | (SuggestProfilePhoto { photo: mp }, SuggestProfilePhoto { photo: sp }) => {
                if disregard_content {
                    Ok((mp.width, mp.height) == (sp.width, sp.height))
                } else {
                    self.photos_equal(mp, sp)
                }
            }
            _ => Ok(master == slave),
        }
    }
}

#[cfg(test)]
#[path = "equality_tests.rs"]
mod tests;
