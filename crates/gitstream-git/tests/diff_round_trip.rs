//! Render file changes back to diff text and re-parse them, proving the
//! parser reproduces type, counts, filenames and flags.

use gitstream_core::types::{ChangeType, FileChange};
use gitstream_git::parse_diff;

fn render(changes: &[FileChange]) -> String {
    let mut out = String::new();
    for change in changes {
        let a_name = change
            .previous_filename
            .as_deref()
            .unwrap_or(&change.filename);
        let b_name = &change.filename;
        out.push_str(&format!("diff --git a/{a_name} b/{b_name}\n"));

        match change.change_type {
            ChangeType::Add => out.push_str("new file mode 100644\n"),
            ChangeType::Delete => out.push_str("deleted file mode 100644\n"),
            _ => {},
        }
        if change.previous_filename.is_some() {
            out.push_str("similarity index 90%\n");
            out.push_str(&format!("rename from {a_name}\n"));
            out.push_str(&format!("rename to {b_name}\n"));
        }

        if change.is_binary {
            out.push_str("index 1111111..2222222 100644\n");
            out.push_str(&format!("Binary files a/{a_name} and b/{b_name} differ\n"));
        } else if let Some(patch) = &change.patch {
            out.push_str("index 1111111..2222222 100644\n");
            match change.change_type {
                ChangeType::Add => out.push_str(&format!("--- /dev/null\n+++ b/{b_name}\n")),
                ChangeType::Delete => out.push_str(&format!("--- a/{a_name}\n+++ /dev/null\n")),
                _ => out.push_str(&format!("--- a/{a_name}\n+++ b/{b_name}\n")),
            }
            out.push_str(patch);
            out.push('\n');
        }
    }
    out
}

fn change(filename: &str, change_type: ChangeType) -> FileChange {
    FileChange {
        change_type,
        ..FileChange::new(filename)
    }
}

#[test]
fn round_trip_reproduces_structure() {
    let mut added = change("docs/intro.md", ChangeType::Add);
    added.patch = Some("@@ -0,0 +1,2 @@\n+# Intro\n+Welcome.".to_string());
    added.additions = 2;

    let mut deleted = change("legacy.cfg", ChangeType::Delete);
    deleted.patch = Some("@@ -1 +0,0 @@\n-obsolete=true".to_string());
    deleted.deletions = 1;

    let mut edited = change("src/lib.rs", ChangeType::Edit);
    edited.patch = Some("@@ -1,2 +1,2 @@\n-fn a() {}\n+fn b() {}\n fn keep() {}".to_string());
    edited.additions = 1;
    edited.deletions = 1;

    let mut renamed_edit = change("src/new_name.rs", ChangeType::Edit);
    renamed_edit.previous_filename = Some("src/old_name.rs".to_string());
    renamed_edit.patch = Some("@@ -3 +3 @@\n-let x = 1;\n+let x = 2;".to_string());
    renamed_edit.additions = 1;
    renamed_edit.deletions = 1;

    let mut pure_rename = change("assets/moved.txt", ChangeType::None);
    pure_rename.previous_filename = Some("assets/original.txt".to_string());

    let mut binary = change("logo.png", ChangeType::Edit);
    binary.is_binary = true;

    let input = vec![added, deleted, edited, renamed_edit, pure_rename, binary];
    let text = render(&input);
    let parsed = parse_diff(&text).expect("rendered diff parses");

    assert_eq!(parsed.len(), input.len());
    for (expected, actual) in input.iter().zip(&parsed) {
        assert_eq!(actual.filename, expected.filename, "filename");
        assert_eq!(
            actual.previous_filename, expected.previous_filename,
            "previous_filename for {}",
            expected.filename
        );
        assert_eq!(
            actual.change_type, expected.change_type,
            "change type for {}",
            expected.filename
        );
        assert_eq!(actual.additions, expected.additions, "additions for {}", expected.filename);
        assert_eq!(actual.deletions, expected.deletions, "deletions for {}", expected.filename);
        assert_eq!(actual.is_binary, expected.is_binary, "binary flag for {}", expected.filename);
        assert_eq!(actual.patch, expected.patch, "patch for {}", expected.filename);
        assert!(!actual.is_large_patch);
    }
}

#[test]
fn round_trip_a_second_parse_is_stable() {
    let mut edited = change("src/main.rs", ChangeType::Edit);
    edited.patch = Some("@@ -1 +1 @@\n-old\n+new".to_string());
    edited.additions = 1;
    edited.deletions = 1;

    let first = parse_diff(&render(&[edited])).unwrap();
    let second = parse_diff(&render(&first)).unwrap();
    assert_eq!(first, second);
}
