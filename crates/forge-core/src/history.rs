//! File version history.
//!
//! Each file carries an append-only ledger of `VersionDiff`s. Merging a batch of
//! `FileUpdate`s extends the ledger and never rewrites past entries.

use crate::types::{FileHistory, FileUpdate, VersionDiff};
use similar::{ChangeTag, TextDiff};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error(
        "version mismatch for {file_name}: history is at v{current}, update goes v{from} -> v{to}"
    )]
    VersionMismatch {
        file_name: String,
        current: u32,
        from: u32,
        to: u32,
    },
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// Line diff reporting only added and removed lines, prefixed `+` / `-`.
///
/// This is an audit trail, not a patch: context lines are dropped.
///
/// # Example
/// ```
/// use forge_core::history::generate_diff;
///
/// assert_eq!(generate_diff("", "x"), "+x");
/// assert_eq!(generate_diff("a\nb\n", "a\nc\n"), "-b\n+c");
/// ```
pub fn generate_diff(old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    diff.iter_all_changes()
        .filter_map(|change| {
            let prefix = match change.tag() {
                ChangeTag::Insert => '+',
                ChangeTag::Delete => '-',
                ChangeTag::Equal => return None,
            };
            let line = change.value().trim_end_matches(['\n', '\r']);
            Some(format!("{prefix}{line}"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Merge a batch of updates into the current history.
///
/// Files not touched by `changes` pass through unchanged; files seen for the
/// first time are appended in the order of their first update. An update whose
/// `from_version` does not match the recorded `current_version`, or that does not
/// advance it by exactly one, is rejected.
pub fn merge(current: Vec<FileHistory>, changes: &[FileUpdate]) -> Result<Vec<FileHistory>> {
    let mut merged = current;

    for change in changes {
        let position = merged.iter().position(|h| h.file_name == change.file_name);
        let current_version = position.map_or(0, |i| merged[i].current_version);

        if change.from_version != current_version || change.new_version != change.from_version + 1
        {
            return Err(HistoryError::VersionMismatch {
                file_name: change.file_name.clone(),
                current: current_version,
                from: change.from_version,
                to: change.new_version,
            });
        }

        let diff = VersionDiff {
            from_version: change.from_version,
            to_version: change.new_version,
            diff: change.diff.clone(),
            comment: change.comment.clone(),
        };

        match position {
            Some(i) => {
                let history = &mut merged[i];
                history.version_diffs.push(diff);
                history.current_version = change.new_version;
            }
            None => merged.push(FileHistory {
                file_name: change.file_name.clone(),
                current_version: change.new_version,
                version_diffs: vec![diff],
            }),
        }
    }

    debug_assert!(merged.iter().all(FileHistory::is_consistent));
    Ok(merged)
}
