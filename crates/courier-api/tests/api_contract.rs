use courier_api::types::{
    ChannelEvent, ChannelState, MessagePart, TransferCounters, TransferEvent, EVENT_ID_KEY,
};
use serde_json::json;

#[test]
fn channel_event_roundtrip() {
    let event = ChannelEvent::RequestFailed {
        name: "Busy".to_string(),
        message: "try later".to_string(),
    };
    let encoded = serde_json::to_string(&event).expect("serialize");
    let decoded: ChannelEvent = serde_json::from_str(&encoded).expect("deserialize roundtrip");
    assert_eq!(decoded, event);

    let event = ChannelEvent::StateChanged {
        state: ChannelState::PendingReady,
    };
    let encoded = serde_json::to_string(&event).expect("serialize");
    let decoded: ChannelEvent = serde_json::from_str(&encoded).expect("deserialize roundtrip");
    assert_eq!(decoded, event);
}

#[test]
fn transfer_counters_reject_unknown_fields() {
    let counters = TransferCounters {
        version: 1,
        bytes_sent: 50,
        bytes_to_send: 200,
        bytes_received: 0,
        bytes_to_receive: 0,
    };
    let mut value = json!(counters);
    value["unexpected"] = json!(true);
    assert!(serde_json::from_value::<TransferCounters>(value).is_err());
}

#[test]
fn message_part_field_access() {
    let header = MessagePart::new().with(EVENT_ID_KEY, json!(42));
    let body = MessagePart::new()
        .with("content-type", json!("text/plain"))
        .with("content", json!("hello"));

    assert_eq!(header.get_i64(EVENT_ID_KEY), Some(42));
    assert_eq!(header.get_i64("missing"), None);
    assert_eq!(body.get_str("content"), Some("hello"));
    assert_eq!(body.get_str("content-type"), Some("text/plain"));

    let encoded = serde_json::to_string(&header).expect("serialize");
    let decoded: MessagePart = serde_json::from_str(&encoded).expect("deserialize roundtrip");
    assert_eq!(decoded.get_i64(EVENT_ID_KEY), Some(42));
}

#[test]
fn transfer_event_progress_payload() {
    let event = TransferEvent::ProgressChanged { progress: 0.25 };
    let encoded = serde_json::to_string(&event).expect("serialize");
    let decoded: TransferEvent = serde_json::from_str(&encoded).expect("deserialize roundtrip");
    match decoded {
        TransferEvent::ProgressChanged { progress } => assert!((progress - 0.25).abs() < 1e-9),
        other => panic!("unexpected event {:?}", other),
    }
}
