use chbuild::diff::{content_digest, DiffError, FileDiff, LineChange};
use std::fs;

#[test]
fn identical_content_yields_an_empty_diff() {
    let diff = FileDiff::compute("a.ts", "one\ntwo\n", "one\ntwo\n");
    assert!(diff.is_empty());
    assert_eq!(diff.render(), "--- a/a.ts\n+++ b/a.ts\n");
}

#[test]
fn compute_is_deterministic() {
    let original = "a\nb\nc\nd\n";
    let proposed = "a\nB\nc\nd\ne\n";

    let first = FileDiff::compute("f.sql", original, proposed);
    let second = FileDiff::compute("f.sql", original, proposed);

    assert_eq!(first, second);
    assert_eq!(first.render(), second.render());
}

#[test]
fn changed_line_is_surrounded_by_context() {
    let original = "l1\nl2\nl3\nl4\nl5\nl6\nl7\n";
    let proposed = "l1\nl2\nl3\nchanged\nl5\nl6\nl7\n";

    let diff = FileDiff::compute("f.ts", original, proposed);

    assert_eq!(diff.hunks.len(), 1);
    let hunk = &diff.hunks[0];
    assert_eq!(hunk.original_start, 1);
    assert_eq!(hunk.original_len, 7);
    let changes: Vec<LineChange> = hunk.lines.iter().map(|line| line.change).collect();
    assert_eq!(
        changes,
        vec![
            LineChange::Context,
            LineChange::Context,
            LineChange::Context,
            LineChange::Removed,
            LineChange::Added,
            LineChange::Context,
            LineChange::Context,
            LineChange::Context,
        ]
    );
}

#[test]
fn distant_changes_become_separate_hunks() {
    let original: String = (1..=30).map(|i| format!("line{i}\n")).collect();
    let proposed = original
        .replace("line2\n", "LINE2\n")
        .replace("line25\n", "LINE25\n");

    let diff = FileDiff::compute("f.ts", &original, &proposed);

    assert_eq!(diff.hunks.len(), 2);
}

#[test]
fn new_file_diff_renders_against_an_empty_base() {
    let diff = FileDiff::compute("new.ts", "", "hello\nworld\n");

    assert_eq!(diff.hunks.len(), 1);
    let hunk = &diff.hunks[0];
    assert_eq!(hunk.original_start, 0);
    assert_eq!(hunk.original_len, 0);
    assert_eq!(hunk.proposed_start, 1);
    assert_eq!(hunk.proposed_len, 2);
    assert!(diff.render().contains("+hello\n"));
}

#[test]
fn apply_writes_proposed_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("query.sql");
    fs::write(&target, "select 1;\n").expect("seed");

    let diff = FileDiff::compute("query.sql", "select 1;\n", "select 2;\n");
    diff.apply(&target).expect("apply");

    assert_eq!(fs::read_to_string(&target).expect("read"), "select 2;\n");
}

#[test]
fn apply_creates_a_missing_file_when_base_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("fresh.ts");

    let diff = FileDiff::compute("fresh.ts", "", "content\n");
    diff.apply(&target).expect("apply");

    assert_eq!(fs::read_to_string(&target).expect("read"), "content\n");
}

#[test]
fn apply_refuses_a_stale_base() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("query.sql");
    fs::write(&target, "select 1;\n").expect("seed");

    let diff = FileDiff::compute("query.sql", "select 1;\n", "select 2;\n");
    // Someone else edits the file between diff computation and apply.
    fs::write(&target, "select 99;\n").expect("concurrent edit");

    match diff.apply(&target) {
        Err(DiffError::StaleBase { path }) => assert!(path.ends_with("query.sql")),
        other => panic!("expected stale base, got {other:?}"),
    }
    assert_eq!(fs::read_to_string(&target).expect("read"), "select 99;\n");
}

#[test]
fn digest_is_stable_and_content_sensitive() {
    assert_eq!(content_digest("abc"), content_digest("abc"));
    assert_ne!(content_digest("abc"), content_digest("abd"));
}
