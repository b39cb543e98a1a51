//! External tests for the wire types — request serialization, delta frame
//! deserialization, snapshot and channel message shapes.

use streamfan::notifier::ChannelMessage;
use streamfan::protocol::*;
use streamfan::store::{PersistedResultSet, StoredStream};

// -- Completion request ----------------------------------------------------

#[test]
fn test_request_serializes_contents_in_order() {
    let req = CompletionRequest::new(
        vec!["first".to_string(), "second".to_string()],
        800,
        &SamplingParams::default(),
        "pw",
    );
    let json = serde_json::to_string(&req).expect("serialize");
    let v: serde_json::Value = serde_json::from_str(&json).expect("parse");
    assert_eq!(v["contents"][0], "first");
    assert_eq!(v["contents"][1], "second");
    assert_eq!(v["max_tokens"], 800);
}

#[test]
fn test_request_always_streams_and_pads() {
    let req = CompletionRequest::new(vec!["p".to_string()], 1, &SamplingParams::default(), "");
    assert!(req.stream);
    assert!(req.pad_zero);
}

#[test]
fn test_request_carries_sampling_fields_flat() {
    let sampling = SamplingParams {
        temperature: 0.7,
        top_k: 30,
        top_p: 0.5,
        alpha_presence: 0.1,
        alpha_frequency: 0.2,
        alpha_decay: 0.98,
        chunk_size: 64,
    };
    let req = CompletionRequest::new(vec!["p".to_string()], 100, &sampling, "s");
    let v: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&req).expect("serialize")).expect("parse");
    assert_eq!(v["top_k"], 30);
    assert_eq!(v["chunk_size"], 64);
    assert!((v["alpha_decay"].as_f64().expect("decay") - 0.98).abs() < 1e-6);
    assert_eq!(v["password"], "s");
}

// -- Delta frames ------------------------------------------------------------

#[test]
fn test_delta_frame_full_shape() {
    let json = r#"{"object":"text_completion.chunk","choices":[{"index":0,"delta":{"content":"Hello"}},{"index":1,"delta":{"content":" there"}}]}"#;
    let frame: DeltaFrame = serde_json::from_str(json).expect("deser");
    assert_eq!(frame.choices.len(), 2);
    assert_eq!(frame.choices[0].delta.content.as_deref(), Some("Hello"));
    assert_eq!(frame.choices[1].index, 1);
}

#[test]
fn test_delta_frame_tolerates_unknown_fields() {
    let json = r#"{"object":"x","model":"rwkv-7b","created":123,"choices":[{"index":0,"delta":{"content":"a"},"finish_reason":null}]}"#;
    let frame: DeltaFrame = serde_json::from_str(json).expect("deser");
    assert_eq!(frame.choices[0].delta.content.as_deref(), Some("a"));
}

#[test]
fn test_delta_frame_empty_choices_array() {
    let frame: DeltaFrame =
        serde_json::from_str(r#"{"object":"x","choices":[]}"#).expect("deser");
    assert!(frame.choices.is_empty());
}

// -- Persisted snapshot -------------------------------------------------------

#[test]
fn test_snapshot_serializes_as_ordered_array() {
    let set = PersistedResultSet {
        streams: vec![
            StoredStream {
                id: "one".to_string(),
                content: "alpha".to_string(),
                is_loading: true,
            },
            StoredStream {
                id: "two".to_string(),
                content: "beta".to_string(),
                is_loading: false,
            },
        ],
    };
    let json = serde_json::to_string(&set).expect("serialize");
    let v: serde_json::Value = serde_json::from_str(&json).expect("parse");
    let arr = v.as_array().expect("bare array");
    assert_eq!(arr.len(), 2);
    assert_eq!(arr[0]["id"], "one");
    assert_eq!(arr[0]["isLoading"], true);
    assert_eq!(arr[1]["content"], "beta");
}

#[test]
fn test_snapshot_round_trips() {
    let set = PersistedResultSet {
        streams: vec![StoredStream {
            id: "s".to_string(),
            content: "text with \"quotes\" and \n newlines".to_string(),
            is_loading: false,
        }],
    };
    let back: PersistedResultSet =
        serde_json::from_str(&serde_json::to_string(&set).expect("ser")).expect("deser");
    assert_eq!(back, set);
}

// -- Channel messages ---------------------------------------------------------

#[test]
fn test_channel_message_wire_tags() {
    let ready = serde_json::to_value(ChannelMessage::Ready { index: 1 }).expect("ser");
    assert_eq!(ready["type"], "DETAIL_READY");
    assert_eq!(ready["index"], 1);

    let update = serde_json::to_value(ChannelMessage::UpdateContent {
        index: 0,
        content: "x".to_string(),
    })
    .expect("ser");
    assert_eq!(update["type"], "UPDATE_CONTENT");
    assert_eq!(update["content"], "x");

    let complete = serde_json::to_value(ChannelMessage::GenerationComplete).expect("ser");
    assert_eq!(complete["type"], "GENERATION_COMPLETE");

    let error = serde_json::to_value(ChannelMessage::GenerationError).expect("ser");
    assert_eq!(error["type"], "GENERATION_ERROR");
}

#[test]
fn test_channel_message_parses_from_wire_shape() {
    let msg: ChannelMessage =
        serde_json::from_str(r#"{"type":"UPDATE_CONTENT","index":2,"content":"hi"}"#)
            .expect("deser");
    assert_eq!(
        msg,
        ChannelMessage::UpdateContent {
            index: 2,
            content: "hi".to_string()
        }
    );
}

// -- Prompt shaping -----------------------------------------------------------

#[test]
fn test_continuation_seed_matches_persisted_layout() {
    // The seed is exactly what precedes new deltas in the persisted content.
    let seed = continuation_seed("foo");
    assert_eq!(format!("{seed}{}", "more"), "foo\n\nmore");
}

#[test]
fn test_continuation_prompt_is_trimmed_context() {
    assert_eq!(continuation_prompt("story so far\n\n"), "story so far");
}
