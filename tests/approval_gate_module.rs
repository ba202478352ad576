use chbuild::approval::{parse_decision_text, ApprovalGate, ApprovalKind, Decision};
use chbuild::events::{EventPayload, EventStream};
use chbuild::shared::ids::{RunId, StepId};
use std::fs;
use std::thread;
use std::time::Duration;

fn run_id() -> RunId {
    RunId::parse("run-1").expect("run id")
}

fn step_id() -> StepId {
    StepId::parse("migrate").expect("step id")
}

fn wait_for_pending(gate: &ApprovalGate) -> u64 {
    for _ in 0..200 {
        if let Some(request) = gate.pending_requests().into_iter().next() {
            return request.request_id;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("no pending request appeared");
}

#[test]
fn decision_tokens_parse_case_insensitively() {
    for token in ["y", "YES", " Approve ", "ok", "apply"] {
        assert_eq!(parse_decision_text(token), Some(Decision::Approved));
    }
    for token in ["n", "No", "reject", "SKIP", "cancel"] {
        assert_eq!(parse_decision_text(token), Some(Decision::Rejected));
    }
    assert_eq!(parse_decision_text("ALL"), Some(Decision::ApprovedAll));
    assert_eq!(parse_decision_text("maybe"), None);
    assert_eq!(parse_decision_text(""), None);
}

#[test]
fn approve_decision_resolves_a_suspended_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let events = EventStream::new();
    let gate = ApprovalGate::new(events.clone(), dir.path(), run_id());

    let worker = {
        let gate = gate.clone();
        thread::spawn(move || {
            gate.request(&step_id(), ApprovalKind::FileWrite, "a.ts", "diff")
                .expect("request")
        })
    };

    let request_id = wait_for_pending(&gate);
    let decision = gate.submit_decision(request_id, "y").expect("submit");
    assert_eq!(decision, Some(Decision::Approved));

    let outcome = worker.join().expect("join");
    assert!(outcome.approved());
    assert!(!outcome.auto);
    assert!(!outcome.timed_out);
    assert_eq!(gate.pending_count(), 0);
}

#[test]
fn reject_decision_resolves_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gate = ApprovalGate::new(EventStream::new(), dir.path(), run_id());

    let worker = {
        let gate = gate.clone();
        thread::spawn(move || {
            gate.request(&step_id(), ApprovalKind::CommandExecution, "npm test", "detail")
                .expect("request")
        })
    };

    let request_id = wait_for_pending(&gate);
    gate.submit_decision(request_id, "n").expect("submit");

    let outcome = worker.join().expect("join");
    assert_eq!(outcome.decision, Decision::Rejected);
    assert!(!outcome.timed_out);
}

#[test]
fn unrecognized_token_leaves_request_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gate = ApprovalGate::new(EventStream::new(), dir.path(), run_id());

    let worker = {
        let gate = gate.clone();
        thread::spawn(move || {
            gate.request(&step_id(), ApprovalKind::FileWrite, "a.ts", "diff")
                .expect("request")
        })
    };

    let request_id = wait_for_pending(&gate);
    assert_eq!(gate.submit_decision(request_id, "maybe").expect("submit"), None);
    assert_eq!(gate.pending_count(), 1);

    gate.submit_decision(request_id, "yes").expect("submit");
    assert!(worker.join().expect("join").approved());
}

#[test]
fn approve_all_switches_the_gate_to_blanket_mode() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gate = ApprovalGate::new(EventStream::new(), dir.path(), run_id());

    let worker = {
        let gate = gate.clone();
        thread::spawn(move || {
            gate.request(&step_id(), ApprovalKind::FileWrite, "first.ts", "diff")
                .expect("request")
        })
    };
    let request_id = wait_for_pending(&gate);
    gate.submit_decision(request_id, "all").expect("submit");

    let first = worker.join().expect("join");
    assert_eq!(first.decision, Decision::ApprovedAll);
    assert!(gate.blanket_mode());

    // Subsequent requests resolve without suspending.
    let second = gate
        .request(&step_id(), ApprovalKind::FileWrite, "second.ts", "diff")
        .expect("request");
    assert!(second.approved());
    assert!(second.auto);
}

#[test]
fn approve_all_also_resolves_requests_already_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gate = ApprovalGate::new(EventStream::new(), dir.path(), run_id());

    let first = {
        let gate = gate.clone();
        thread::spawn(move || {
            gate.request(&step_id(), ApprovalKind::FileWrite, "a.ts", "diff")
                .expect("request")
        })
    };
    let second = {
        let gate = gate.clone();
        thread::spawn(move || {
            gate.request(&step_id(), ApprovalKind::FileWrite, "b.ts", "diff")
                .expect("request")
        })
    };
    for _ in 0..200 {
        if gate.pending_count() == 2 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(gate.pending_count(), 2);

    let target = gate.pending_requests()[0].request_id;
    gate.submit_decision(target, "all").expect("submit");

    let outcomes = [first.join().expect("join"), second.join().expect("join")];
    assert!(outcomes.iter().all(|outcome| outcome.approved()));
    let blanket_covered = outcomes
        .iter()
        .find(|outcome| outcome.request_id != target)
        .expect("other outcome");
    assert_eq!(blanket_covered.decision, Decision::Approved);
    assert!(blanket_covered.auto);
    assert_eq!(gate.pending_count(), 0);
}

#[test]
fn unattended_gate_auto_approves_without_pending_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let events = EventStream::new();
    let mut cursor = events.subscribe();
    let gate = ApprovalGate::new(events.clone(), dir.path(), run_id()).with_unattended(true);

    let outcome = gate
        .request(&step_id(), ApprovalKind::CommandExecution, "npm test", "detail")
        .expect("request");

    assert!(outcome.approved());
    assert!(outcome.auto);
    assert_eq!(gate.pending_count(), 0);

    let kinds: Vec<&str> = cursor
        .poll()
        .iter()
        .map(|event| match &event.payload {
            EventPayload::ApprovalRequested { .. } => "requested",
            EventPayload::ApprovalResolved { .. } => "resolved",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["requested", "resolved"]);
}

#[test]
fn timeout_resolves_rejected_with_flag() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gate = ApprovalGate::new(EventStream::new(), dir.path(), run_id())
        .with_timeout(Duration::from_millis(50));

    let outcome = gate
        .request(&step_id(), ApprovalKind::FileWrite, "a.ts", "diff")
        .expect("request");

    assert_eq!(outcome.decision, Decision::Rejected);
    assert!(outcome.timed_out);
    assert_eq!(gate.pending_count(), 0);
}

#[test]
fn reject_outstanding_resolves_every_pending_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gate = ApprovalGate::new(EventStream::new(), dir.path(), run_id());

    let worker = {
        let gate = gate.clone();
        thread::spawn(move || {
            gate.request(&step_id(), ApprovalKind::FileWrite, "a.ts", "diff")
                .expect("request")
        })
    };
    wait_for_pending(&gate);
    gate.reject_outstanding();

    let outcome = worker.join().expect("join");
    assert_eq!(outcome.decision, Decision::Rejected);
}

#[test]
fn every_approval_leaves_a_requested_and_resolved_audit_pair() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gate = ApprovalGate::new(EventStream::new(), dir.path(), run_id()).with_unattended(true);

    gate.request(&step_id(), ApprovalKind::FileWrite, "a.ts", "diff")
        .expect("request");
    gate.request(&step_id(), ApprovalKind::CommandExecution, "npm test", "detail")
        .expect("request");

    let audit_path = dir.path().join("runs").join("run-1").join("audit.jsonl");
    let raw = fs::read_to_string(&audit_path).expect("audit log");
    let records: Vec<serde_json::Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).expect("audit record"))
        .collect();

    assert_eq!(records.len(), 4);
    let kinds: Vec<&str> = records
        .iter()
        .map(|record| record["kind"].as_str().expect("kind"))
        .collect();
    assert_eq!(
        kinds,
        vec![
            "approval_requested",
            "approval_resolved",
            "approval_requested",
            "approval_resolved",
        ]
    );
    assert_eq!(records[0]["requestId"], records[1]["requestId"]);
}

#[test]
fn unknown_request_id_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gate = ApprovalGate::new(EventStream::new(), dir.path(), run_id());

    assert!(gate.submit_decision(42, "y").is_err());
}
