//! Parsing of `git status --porcelain -z` output into [`StepChanges`].
//!
//! Workspaces stage everything (`git add --all`) before asking for status, so
//! only the index column (first character) carries information. With `-z`
//! entries are NUL-terminated and paths are never quoted.

use anyhow::{Result, anyhow};

use crate::core::types::StepChanges;

/// Minimum width of an entry: two status columns, a space, one path byte.
const MIN_ENTRY_WIDTH: usize = 4;

/// Parse staged porcelain status. Empty entries are skipped; anything else
/// that does not look like a porcelain entry is an error.
pub fn parse_git_status(output: &str) -> Result<StepChanges> {
    let mut changes = StepChanges::default();
    let mut entries = output.split('\0');
    while let Some(entry) = entries.next() {
        if entry.is_empty() {
            continue;
        }
        if entry.len() < MIN_ENTRY_WIDTH || !entry.is_char_boundary(3) {
            return Err(anyhow!("git status entry has unrecognized format: '{entry}'"));
        }
        let path = entry[3..].to_string();
        match entry.as_bytes()[0] {
            b'M' | b'T' => changes.modified.push(path),
            b'A' => changes.added.push(path),
            b'D' => changes.deleted.push(path),
            // Destination first; the source path follows as its own entry.
            code @ (b'R' | b'C') => {
                if entries.next().is_none_or(str::is_empty) {
                    return Err(anyhow!("git status entry is missing its source path: '{entry}'"));
                }
                if code == b'R' {
                    changes.renamed.push(path);
                } else {
                    changes.added.push(path);
                }
            }
            _ => {
                return Err(anyhow!(
                    "git status entry has unrecognized status code: '{entry}'"
                ));
            }
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_change_kinds() {
        let changes = parse_git_status("M  a.go\0A  b.go\0D  c.go\0R  new\0old\0C  copy\0orig\0")
            .expect("parse");
        assert_eq!(
            changes,
            StepChanges {
                modified: vec!["a.go".to_string()],
                added: vec!["b.go".to_string(), "copy".to_string()],
                deleted: vec!["c.go".to_string()],
                renamed: vec!["new".to_string()],
            }
        );
    }

    #[test]
    fn empty_output_has_no_changes() {
        let changes = parse_git_status("").expect("parse");
        assert!(changes.is_empty());
    }

    #[test]
    fn short_entry_is_an_error() {
        let err = parse_git_status("M  a.go\0M \0").unwrap_err();
        assert!(err.to_string().contains("unrecognized format"));
    }

    #[test]
    fn unstaged_entry_is_an_error() {
        let err = parse_git_status("?? untracked.txt\0").unwrap_err();
        assert!(err.to_string().contains("unrecognized status code"));
    }

    #[test]
    fn rename_without_source_is_an_error() {
        let err = parse_git_status("R  new\0").unwrap_err();
        assert!(err.to_string().contains("missing its source path"));
    }

    #[test]
    fn keeps_unusual_paths_verbatim() {
        let changes =
            parse_git_status("M  docs/read me.md\0A  café.go\0R  c -> d\0a b\0").expect("parse");
        assert_eq!(changes.modified, vec!["docs/read me.md"]);
        assert_eq!(changes.added, vec!["café.go"]);
        assert_eq!(changes.renamed, vec!["c -> d"]);
    }
}
