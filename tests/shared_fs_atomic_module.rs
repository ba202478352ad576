use chbuild::shared::fs_atomic::{atomic_write_file, canonicalize_existing};
use std::fs;

#[test]
fn atomic_write_creates_file_with_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("state.json");

    atomic_write_file(&target, b"{\"ok\":true}").expect("write");

    let content = fs::read_to_string(&target).expect("read back");
    assert_eq!(content, "{\"ok\":true}");
}

#[test]
fn atomic_write_replaces_existing_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("state.json");
    fs::write(&target, "old").expect("seed");

    atomic_write_file(&target, b"new").expect("write");

    assert_eq!(fs::read_to_string(&target).expect("read back"), "new");
}

#[test]
fn atomic_write_creates_missing_parent_directories() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("runs").join("run-1").join("run.json");

    atomic_write_file(&target, b"{}").expect("write");

    assert!(target.is_file());
}

#[test]
fn atomic_write_leaves_no_temp_files_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("state.json");

    atomic_write_file(&target, b"content").expect("write");

    let names: Vec<String> = fs::read_dir(dir.path())
        .expect("read dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["state.json".to_string()]);
}

#[test]
fn canonicalize_existing_fails_for_missing_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("does-not-exist");

    assert!(canonicalize_existing(&missing).is_err());
}
