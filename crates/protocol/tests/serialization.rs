//! Wire-shape tests for the frame and model types.
//!
//! Plugin authors implement the other side of this protocol from JSON
//! examples, so the exact field names and tags are part of the contract.

use pf_protocol::{methods, Frame, LogChunk, LogStream, StepInvocation, StepResult, StepSpec};
use serde_json::json;
use uuid::Uuid;

#[test]
fn method_call_wire_shape() {
    let frame = Frame::MethodCall {
        id: 1,
        method: methods::DESCRIBE.to_string(),
        body: serde_json::Value::Null,
    };

    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "methodCall",
            "payload": { "id": 1, "method": "describe", "body": null }
        })
    );
}

#[test]
fn method_result_carries_body_or_error() {
    let ok: Frame = serde_json::from_value(json!({
        "type": "methodResult",
        "payload": { "id": 4, "body": { "steps": [] }, "error": null }
    }))
    .unwrap();
    assert!(matches!(ok, Frame::MethodResult { id: 4, body: Some(_), error: None }));

    let err: Frame = serde_json::from_value(json!({
        "type": "methodResult",
        "payload": { "id": 5, "body": null, "error": "boom" }
    }))
    .unwrap();
    assert!(matches!(err, Frame::MethodResult { id: 5, body: None, error: Some(_) }));
}

#[test]
fn stream_chunk_holds_log_chunks() {
    let chunk = LogChunk {
        line: "compiling main".to_string(),
        stream: LogStream::Stdout,
    };
    let frame = Frame::StreamChunk {
        id: 2,
        data: serde_json::to_value(&chunk).unwrap(),
    };

    let round = serde_json::to_value(&frame).unwrap();
    assert_eq!(
        round,
        json!({
            "type": "streamChunk",
            "payload": { "id": 2, "data": { "line": "compiling main", "stream": "stdout" } }
        })
    );
}

#[test]
fn step_spec_accepts_missing_input_schema() {
    let spec: StepSpec = serde_json::from_value(json!({ "name": "build", "index": 0 })).unwrap();
    assert_eq!(spec.name, "build");
    assert_eq!(spec.index, 0);
    assert!(spec.input_schema.is_none());
}

#[test]
fn step_result_optional_error_message_omitted() {
    let result = StepResult {
        step_index: 1,
        exit_status: 0,
        duration_ms: 42,
        error_message: None,
    };
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(
        value,
        json!({ "step_index": 1, "exit_status": 0, "duration_ms": 42 })
    );
}

#[test]
fn step_invocation_round_trip() {
    let invocation = StepInvocation {
        pipeline_id: "build-and-test".to_string(),
        job_id: Uuid::new_v4(),
        step_index: 1,
        step_name: "test".to_string(),
    };

    let value = serde_json::to_value(&invocation).unwrap();
    let back: StepInvocation = serde_json::from_value(value).unwrap();
    assert_eq!(back, invocation);
}
