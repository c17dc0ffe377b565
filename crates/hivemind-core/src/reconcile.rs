//! Reconciliation of incoming snapshots against local documents
//!
//! Precedence is decided by modification time alone:
//!
//! | local            | outcome                               |
//! |------------------|---------------------------------------|
//! | missing          | `Create(remote)`                      |
//! | older than remote| `Replace(remote)`                     |
//! | newer than remote| line merge, `KeepLocal` if unchanged  |
//! | same timestamp   | `KeepLocal`                           |
//!
//! The line merge diffs local against remote with an LCS line diff. Lines
//! the two sides agree on are kept, lines only the local copy has are
//! kept, lines only the remote copy has are inserted at their position,
//! and where both sides rewrote the same region the local lines win.

use similar::{Algorithm, DiffTag, TextDiff};
use tracing::debug;

use crate::crypto::CipherBox;
use crate::error::SyncResult;
use crate::types::{DocumentSnapshot, LocalDocument};

/// What to do with an incoming snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// No local copy; create it with this text
    Create(String),
    /// Local copy is older; overwrite it with this text
    Replace(String),
    /// Local copy is newer; write the merged text
    Merge(String),
    /// Local copy stays as it is
    KeepLocal,
}

/// Tag of an [`Action`] without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Replace,
    Merge,
    KeepLocal,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Create(_) => ActionKind::Create,
            Action::Replace(_) => ActionKind::Replace,
            Action::Merge(_) => ActionKind::Merge,
            Action::KeepLocal => ActionKind::KeepLocal,
        }
    }

    /// Text to write, if any
    pub fn text(&self) -> Option<&str> {
        match self {
            Action::Create(text) | Action::Replace(text) | Action::Merge(text) => Some(text),
            Action::KeepLocal => None,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Create => write!(f, "create"),
            ActionKind::Replace => write!(f, "replace"),
            ActionKind::Merge => write!(f, "merge"),
            ActionKind::KeepLocal => write!(f, "keep-local"),
        }
    }
}

/// Decides how an incoming snapshot lands on the local copy
#[derive(Debug, Clone)]
pub struct Reconciler {
    cipher: CipherBox,
}

impl Reconciler {
    pub fn new(cipher: CipherBox) -> Self {
        Self { cipher }
    }

    /// The cipher used for snapshot bodies
    pub fn cipher(&self) -> &CipherBox {
        &self.cipher
    }

    /// Reconcile `remote` against the local document, if one exists.
    ///
    /// The remote body is decrypted before anything else; a body that does
    /// not decrypt fails with `DecryptionFailed` and nothing is decided.
    pub fn reconcile(
        &self,
        remote: &DocumentSnapshot,
        local: Option<&LocalDocument>,
    ) -> SyncResult<Action> {
        let remote_text = self.cipher.decrypt(&remote.content)?;

        let action = match local {
            None => Action::Create(remote_text),
            Some(local) if local.mtime < remote.last_modified => Action::Replace(remote_text),
            Some(local) if local.mtime > remote.last_modified => {
                let merged = merge_lines(&local.content, &remote_text);
                if merged == local.content {
                    Action::KeepLocal
                } else {
                    Action::Merge(merged)
                }
            }
            Some(_) => Action::KeepLocal,
        };

        debug!(
            path = %remote.path,
            remote_mtime = remote.last_modified,
            local_mtime = local.map(|l| l.mtime),
            action = %action.kind(),
            "Reconciled snapshot"
        );
        Ok(action)
    }
}

/// Merge `remote` into the newer `local` text line by line.
///
/// Lines are compared without their terminators, so a last line missing
/// its newline still matches. The result ends in a newline only if the
/// local text does, or if the local text is empty and the remote one does.
pub fn merge_lines(local: &str, remote: &str) -> String {
    let (old, local_newline) = split_lines(local);
    let (new, remote_newline) = split_lines(remote);

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Lcs)
        .diff_slices(old.as_slice(), new.as_slice());

    let mut lines: Vec<&str> = Vec::with_capacity(old.len().max(new.len()));
    for op in diff.ops() {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        match tag {
            DiffTag::Insert => lines.extend_from_slice(&new[new_range]),
            DiffTag::Equal | DiffTag::Delete | DiffTag::Replace => {
                lines.extend_from_slice(&old[old_range])
            }
        }
    }

    let mut merged = lines.join("\n");
    let trailing_newline = if old.is_empty() {
        remote_newline
    } else {
        local_newline
    };
    if trailing_newline && !lines.is_empty() {
        merged.push('\n');
    }
    merged
}

/// Lines split on `\n` only, so `\r` stays with its line
fn split_lines(text: &str) -> (Vec<&str>, bool) {
    if text.is_empty() {
        return (Vec::new(), false);
    }
    let trailing_newline = text.ends_with('\n');
    let body = text.strip_suffix('\n').unwrap_or(text);
    (body.split('\n').collect(), trailing_newline)
}
