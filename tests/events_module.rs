use chbuild::events::{EventPayload, EventStream};
use chbuild::shared::ids::StepId;

fn message(text: &str) -> EventPayload {
    EventPayload::Message {
        text: text.to_string(),
    }
}

#[test]
fn publish_assigns_monotonic_sequence_numbers() {
    let stream = EventStream::new();

    let first = stream.publish(None, message("a"));
    let second = stream.publish(None, message("b"));

    assert_eq!(first.sequence, 0);
    assert_eq!(second.sequence, 1);
    assert_eq!(stream.published_count(), 2);
}

#[test]
fn cursor_sees_only_events_published_after_subscribe() {
    let stream = EventStream::new();
    stream.publish(None, message("before"));

    let mut cursor = stream.subscribe();
    stream.publish(None, message("after"));

    let drained = cursor.poll();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].payload, message("after"));
}

#[test]
fn replay_cursor_sees_full_history() {
    let stream = EventStream::new();
    stream.publish(None, message("first"));
    stream.publish(None, message("second"));

    let mut cursor = stream.subscribe_with_replay();

    assert_eq!(cursor.poll().len(), 2);
}

#[test]
fn poll_drains_in_publish_order_and_is_idempotent_when_empty() {
    let stream = EventStream::new();
    let mut cursor = stream.subscribe();
    stream.publish(None, message("a"));
    stream.publish(None, message("b"));

    let drained = cursor.poll();
    assert_eq!(drained[0].payload, message("a"));
    assert_eq!(drained[1].payload, message("b"));
    assert!(cursor.poll().is_empty());
}

#[test]
fn lagging_cursor_skips_ahead_and_flags_the_gap() {
    let stream = EventStream::new();
    let mut cursor = stream.subscribe_bounded(2);
    for i in 0..5 {
        stream.publish(None, message(&format!("m{i}")));
    }

    let drained = cursor.poll();

    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].payload, message("m3"));
    assert_eq!(drained[1].payload, message("m4"));
    assert!(cursor.take_gap());
    assert!(!cursor.take_gap());
}

#[test]
fn cursor_within_capacity_raises_no_gap() {
    let stream = EventStream::new();
    let mut cursor = stream.subscribe_bounded(10);
    stream.publish(None, message("only"));

    assert_eq!(cursor.poll().len(), 1);
    assert!(!cursor.take_gap());
}

#[test]
fn events_carry_the_emitting_step_id() {
    let stream = EventStream::new();
    let step = StepId::parse("migrate").expect("step id");

    let event = stream.publish(Some(&step), message("hello"));

    assert_eq!(event.step_id.as_deref(), Some("migrate"));
}

#[test]
fn independent_cursors_do_not_affect_each_other() {
    let stream = EventStream::new();
    let mut fast = stream.subscribe();
    let mut slow = stream.subscribe();
    stream.publish(None, message("x"));

    assert_eq!(fast.poll().len(), 1);
    assert_eq!(slow.poll().len(), 1);
}
