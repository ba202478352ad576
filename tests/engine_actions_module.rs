use chbuild::engine::{parse_engine_action, EngineAction, EngineError};

#[test]
fn tool_call_envelope_parses() {
    let action = parse_engine_action(
        r#"{"action": "tool_call", "capability": "read", "args": {"file_path": "a.ts"}}"#,
    )
    .expect("parse");

    match action {
        EngineAction::ToolCall { capability, args } => {
            assert_eq!(capability, "read");
            assert_eq!(args["file_path"], "a.ts");
        }
        other => panic!("expected tool call, got {other:?}"),
    }
}

#[test]
fn tool_call_args_default_to_empty() {
    let action =
        parse_engine_action(r#"{"action": "tool_call", "capability": "glob"}"#).expect("parse");
    match action {
        EngineAction::ToolCall { args, .. } => assert!(args.is_empty()),
        other => panic!("expected tool call, got {other:?}"),
    }
}

#[test]
fn final_answer_envelope_parses() {
    let action =
        parse_engine_action(r#"  {"action": "final_answer", "text": "done"}  "#).expect("parse");
    assert_eq!(
        action,
        EngineAction::FinalAnswer {
            text: "done".to_string()
        }
    );
}

#[test]
fn empty_payload_is_malformed() {
    match parse_engine_action("  \n ") {
        Err(EngineError::MalformedAction { .. }) => {}
        other => panic!("expected malformed action, got {other:?}"),
    }
}

#[test]
fn unknown_action_tag_is_malformed() {
    assert!(parse_engine_action(r#"{"action": "daydream"}"#).is_err());
}

#[test]
fn extra_fields_are_rejected() {
    assert!(parse_engine_action(
        r#"{"action": "final_answer", "text": "done", "confidence": 0.9}"#
    )
    .is_err());
}

#[test]
fn prose_around_the_envelope_is_rejected() {
    assert!(parse_engine_action(r#"Sure! {"action": "final_answer", "text": "done"}"#).is_err());
}
