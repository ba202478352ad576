use chbuild::scan::{sites_from_answer, QuerySite, ScanArtifact, ScanStore};
use chbuild::shared::ids::RunId;

fn run_id() -> RunId {
    RunId::parse("run-1").expect("run id")
}

fn site() -> QuerySite {
    QuerySite {
        file_path: "src/reports.ts".to_string(),
        line_start: 10,
        line_end: 18,
        query_kind: "aggregation".to_string(),
        raw_text: "SELECT day, sum(amount) FROM orders GROUP BY day".to_string(),
    }
}

#[test]
fn record_then_load_round_trips_the_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ScanStore::new(dir.path());
    let artifact = ScanArtifact::new(&run_id(), "/workspace", "one site found", vec![site()]);

    let path = store.record(&artifact).expect("record");
    assert!(path.ends_with("runs/run-1/scan.json"));

    let loaded = store.load(&run_id()).expect("load");
    assert_eq!(loaded, artifact);
    assert_eq!(loaded.sites.len(), 1);
    assert_eq!(loaded.sites[0].query_kind, "aggregation");
}

#[test]
fn second_record_for_the_same_run_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ScanStore::new(dir.path());
    let artifact = ScanArtifact::new(&run_id(), "/workspace", "summary", vec![]);

    store.record(&artifact).expect("first record");
    let err = store.record(&artifact).expect_err("second record must fail");

    assert!(err.to_string().contains("already recorded"));
    assert!(store.exists(&run_id()));
}

#[test]
fn load_of_a_missing_artifact_reports_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ScanStore::new(dir.path());

    let err = store.load(&run_id()).expect_err("must fail");
    assert!(err.to_string().contains("not found"));
    assert!(!store.exists(&run_id()));
}

#[test]
fn sites_parse_from_a_json_answer() {
    let answer = r#"[{"filePath": "a.ts", "lineStart": 1, "lineEnd": 3,
                     "queryKind": "window", "rawText": "..."}]"#;
    let sites = sites_from_answer(answer);
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].query_kind, "window");
}

#[test]
fn non_json_answer_yields_no_sites() {
    assert!(sites_from_answer("nothing to migrate").is_empty());
}
