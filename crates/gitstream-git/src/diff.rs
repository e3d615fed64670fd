//! Parser reconstructing structured file changes from raw `git diff` text.
//!
//! The output must be structurally identical to what the remote API reports
//! for the same commit, so either source is interchangeable downstream.

use gitstream_core::types::{ChangeType, FileChange};

use crate::error::GitError;

/// Patches over this many bytes are dropped and flagged instead of emitted.
pub const LARGE_PATCH_THRESHOLD: usize = 1024 * 1024;

/// Fixed text of a `diff --git` header once both filenames are removed.
const HEADER_FIXED: &str = "diff --git a/ b/";

enum State {
    Header,
    InPatch,
}

/// Parses full `git diff` output into ordered per-file changes.
///
/// Any line that cannot be classified is a hard error rather than a silently
/// dropped record.
pub fn parse_diff(text: &str) -> Result<Vec<FileChange>, GitError> {
    let mut done: Vec<(FileChange, Vec<&str>)> = Vec::new();
    let mut current: Option<(FileChange, Vec<&str>)> = None;
    let mut state = State::Header;

    for line in text.split('\n') {
        if line.is_empty() {
            // Only happens at the end; blank lines inside a patch carry at
            // least their leading marker character.
            if let Some(cur) = current.take() {
                done.push(cur);
            }
            continue;
        }

        if line.starts_with("diff --git ") {
            if let Some(cur) = current.take() {
                if is_significant(&cur) {
                    done.push(cur);
                }
            }
            current = Some((FileChange::new(header_filename(line)?), Vec::new()));
            state = State::Header;
            continue;
        }

        let Some((change, patch)) = current.as_mut() else {
            return Err(GitError::DiffParse(line.to_string()));
        };

        match state {
            State::InPatch => {
                match line.as_bytes()[0] {
                    b'-' => change.deletions += 1,
                    b'+' => change.additions += 1,
                    // Hunk headers, context lines and the no-newline marker
                    // are carried verbatim.
                    _ => {},
                }
                patch.push(line);
            },
            State::Header => match line.as_bytes()[0] {
                // index, similarity index, old mode
                b'i' | b's' | b'o' => {},
                b'n' => {
                    // A bare mode change is an edit; "new file" is an add.
                    change.change_type = if line.starts_with("new mode") {
                        ChangeType::Edit
                    } else {
                        ChangeType::Add
                    };
                },
                b'd' if line.starts_with("deleted file") => {
                    change.change_type = ChangeType::Delete;
                },
                b'B' => {
                    // Binary files ... differ
                    change.is_binary = true;
                },
                b'r' => {
                    if let Some(from) = line.strip_prefix("rename from ") {
                        change.previous_filename = Some(from.to_string());
                    } else if let Some(to) = line.strip_prefix("rename to ") {
                        change.filename = to.to_string();
                    }
                },
                // The "--- a/..." line repeats what the header already told us.
                b'-' => {},
                // "+++ b/..." ends the header; hunks follow.
                b'+' => state = State::InPatch,
                _ => return Err(GitError::DiffParse(line.to_string())),
            },
        }
    }

    if let Some(cur) = current.take() {
        done.push(cur);
    }

    Ok(done.into_iter().map(finalize).collect())
}

/// Extracts the filename from a `diff --git a/... b/...` header.
///
/// A filename may itself contain ` b/`, so a separator search is unreliable;
/// instead both names are assumed equal and their shared length is computed
/// from the header length. Rename headers get corrected afterwards by the
/// explicit `rename from`/`rename to` lines.
fn header_filename(line: &str) -> Result<String, GitError> {
    if line.len() < HEADER_FIXED.len() {
        return Err(GitError::DiffParse(line.to_string()));
    }
    let name_len = (line.len() - HEADER_FIXED.len()) / 2;
    match line.get(line.len() - name_len..) {
        Some(name) => Ok(name.to_string()),
        // Asymmetric rename header; the rename lines below will fix it up.
        None => Ok(String::new()),
    }
}

fn is_significant((change, patch): &(FileChange, Vec<&str>)) -> bool {
    change.change_type != ChangeType::None
        || !patch.is_empty()
        || change.is_binary
        || change.previous_filename.is_some()
}

fn finalize((mut change, patch): (FileChange, Vec<&str>)) -> FileChange {
    if !patch.is_empty() {
        let joined = patch.join("\n");
        if joined.len() > LARGE_PATCH_THRESHOLD {
            change.is_large_patch = true;
        } else {
            change.patch = Some(joined);
        }
    }

    if (change.is_binary || change.is_large_patch || change.patch.is_some())
        && change.change_type == ChangeType::None
    {
        change.change_type = ChangeType::Edit;
    }

    change
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_edit() {
        let text = "diff --git a/src/lib.rs b/src/lib.rs\n\
                    index 1111111..2222222 100644\n\
                    --- a/src/lib.rs\n\
                    +++ b/src/lib.rs\n\
                    @@ -1,3 +1,4 @@ fn main\n \
                    fn main() {\n\
                    -    old();\n\
                    +    new();\n\
                    +    extra();\n \
                    }\n";

        let changes = parse_diff(text).unwrap();
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.filename, "src/lib.rs");
        assert_eq!(change.additions, 2);
        assert_eq!(change.deletions, 1);
        assert_eq!(change.change_type, ChangeType::Edit);
        let patch = change.patch.as_deref().unwrap();
        assert!(patch.starts_with("@@ -1,3 +1,4 @@ fn main"));
        assert!(patch.contains("-    old();"));
        assert!(!change.is_binary);
        assert!(!change.is_large_patch);
    }

    #[test]
    fn test_new_and_deleted_file() {
        let text = "diff --git a/new.txt b/new.txt\n\
                    new file mode 100644\n\
                    index 0000000..e69de29\n\
                    --- /dev/null\n\
                    +++ b/new.txt\n\
                    @@ -0,0 +1 @@\n\
                    +hello\n\
                    diff --git a/gone.txt b/gone.txt\n\
                    deleted file mode 100644\n\
                    index e69de29..0000000\n\
                    --- a/gone.txt\n\
                    +++ /dev/null\n\
                    @@ -1 +0,0 @@\n\
                    -bye\n";

        let changes = parse_diff(text).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].filename, "new.txt");
        assert_eq!(changes[0].change_type, ChangeType::Add);
        assert_eq!(changes[0].additions, 1);
        assert_eq!(changes[1].filename, "gone.txt");
        assert_eq!(changes[1].change_type, ChangeType::Delete);
        assert_eq!(changes[1].deletions, 1);
    }

    #[test]
    fn test_pure_rename_keeps_none() {
        let text = "diff --git a/old/name.rs b/new/name.rs\n\
                    similarity index 100%\n\
                    rename from old/name.rs\n\
                    rename to new/name.rs\n";

        let changes = parse_diff(text).unwrap();
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.filename, "new/name.rs");
        assert_eq!(change.previous_filename.as_deref(), Some("old/name.rs"));
        assert_eq!(change.change_type, ChangeType::None);
        assert!(change.patch.is_none());
    }

    #[test]
    fn test_rename_with_content_change_is_edit() {
        let text = "diff --git a/old.rs b/renamed.rs\n\
                    similarity index 90%\n\
                    rename from old.rs\n\
                    rename to renamed.rs\n\
                    index 1111111..2222222 100644\n\
                    --- a/old.rs\n\
                    +++ b/renamed.rs\n\
                    @@ -1 +1 @@\n\
                    -fn a() {}\n\
                    +fn b() {}\n";

        let changes = parse_diff(text).unwrap();
        let change = &changes[0];
        assert_eq!(change.change_type, ChangeType::Edit);
        assert_eq!(change.filename, "renamed.rs");
        assert_eq!(change.previous_filename.as_deref(), Some("old.rs"));
        assert_eq!(change.additions, 1);
        assert_eq!(change.deletions, 1);
    }

    #[test]
    fn test_binary_file() {
        let text = "diff --git a/logo.png b/logo.png\n\
                    index 1111111..2222222 100644\n\
                    Binary files a/logo.png and b/logo.png differ\n";

        let changes = parse_diff(text).unwrap();
        let change = &changes[0];
        assert!(change.is_binary);
        assert_eq!(change.change_type, ChangeType::Edit);
        assert!(change.patch.is_none());
    }

    #[test]
    fn test_mode_change_is_edit() {
        let text = "diff --git a/run.sh b/run.sh\n\
                    old mode 100644\n\
                    new mode 100755\n";

        let changes = parse_diff(text).unwrap();
        assert_eq!(changes[0].change_type, ChangeType::Edit);
        assert!(changes[0].patch.is_none());
    }

    #[test]
    fn test_filename_containing_separator_text() {
        // The filename is literally "weird b/name" in both positions, so a
        // naive search for " b/" would split in the wrong place.
        let text = "diff --git a/weird b/name b/weird b/name\n\
                    index 1111111..2222222 100644\n\
                    --- a/weird b/name\n\
                    +++ b/weird b/name\n\
                    @@ -1 +1 @@\n\
                    -x\n\
                    +y\n";

        let changes = parse_diff(text).unwrap();
        assert_eq!(changes[0].filename, "weird b/name");
    }

    #[test]
    fn test_large_patch_elided() {
        let big = "a".repeat(LARGE_PATCH_THRESHOLD + 16);
        let text = format!(
            "diff --git a/big.txt b/big.txt\n\
             index 1111111..2222222 100644\n\
             --- a/big.txt\n\
             +++ b/big.txt\n\
             @@ -0,0 +1 @@\n\
             +{big}\n"
        );

        let changes = parse_diff(&text).unwrap();
        let change = &changes[0];
        assert!(change.is_large_patch);
        assert!(change.patch.is_none());
        assert_eq!(change.change_type, ChangeType::Edit);
        assert_eq!(change.additions, 1);
    }

    #[test]
    fn test_no_newline_marker_kept_in_patch() {
        let text = "diff --git a/f.txt b/f.txt\n\
                    index 1111111..2222222 100644\n\
                    --- a/f.txt\n\
                    +++ b/f.txt\n\
                    @@ -1 +1 @@\n\
                    -x\n\
                    +y\n\
                    \\ No newline at end of file\n";

        let changes = parse_diff(text).unwrap();
        let patch = changes[0].patch.as_deref().unwrap();
        assert!(patch.ends_with("\\ No newline at end of file"));
    }

    #[test]
    fn test_unclassifiable_line_is_loud() {
        let text = "diff --git a/f.txt b/f.txt\n\
                    what is this line\n";
        let err = parse_diff(text).unwrap_err();
        assert!(matches!(err, GitError::DiffParse(_)));

        // Content before any header is just as loud.
        let err = parse_diff("index 1111111..2222222\n").unwrap_err();
        assert!(matches!(err, GitError::DiffParse(_)));
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_diff("").unwrap().is_empty());
    }
}
