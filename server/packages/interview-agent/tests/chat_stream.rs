mod common;

use axum::http::{Method, StatusCode};
use serde_json::{json, Value};

use common::*;

#[tokio::test]
async fn echo_turn_streams_normalized_events() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "sess_echo", "cand_1").await;

    let frames = chat(&test_app.app, "sess_echo", json!({ "message": "how do loops work" })).await;
    insta::assert_snapshot!(
        event_names(&frames),
        @"stream_start content content content content content done"
    );

    let message_id = frames[0].data["messageId"].as_str().expect("message id");
    assert!(message_id.starts_with("msg_"));

    let text: String = frames
        .iter()
        .filter(|frame| frame.event == "content")
        .filter_map(|frame| frame.data["delta"].as_str())
        .collect();
    assert_eq!(text, "mock: how do loops work");

    let done = &frames.last().expect("done").data;
    assert_eq!(done["response"], "mock: how do loops work");
    assert_eq!(done["metadata"]["messageId"], message_id);
    assert_eq!(done["metadata"]["backend"], "tool_agent");
    assert_eq!(done["metadata"]["assignmentSource"], "default");
    assert!(done["usage"]["totalTokens"].as_u64().unwrap_or(0) > 0);

    let history = messages(&test_app.app, "sess_echo").await;
    let roles: Vec<&str> = history
        .iter()
        .filter_map(|turn| turn["role"].as_str())
        .collect();
    assert_eq!(roles, vec!["user", "assistant"]);
    assert_eq!(history[1]["content"], "mock: how do loops work");
    assert_eq!(history[1]["backend"], "tool_agent");
    assert!(history[0]["promptQuality"].is_number());

    // A completed turn leaves no snapshot behind.
    assert!(checkpoints(&test_app.app, "sess_echo").await.is_empty());
}

#[tokio::test]
async fn code_context_is_forwarded_with_the_message() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "sess_ctx", "cand_1").await;

    let frames = chat(
        &test_app.app,
        "sess_ctx",
        json!({
            "message": "why is this slow",
            "codeContext": { "fileName": "main.py", "language": "python", "content": "for i in x: pass" },
            "helpfulnessLevel": "pair_programmer",
        }),
    )
    .await;
    let done = &frames.last().expect("done").data;
    // The mock answers the last paragraph, which is the question itself.
    assert_eq!(done["response"], "mock: why is this slow");
    let history = messages(&test_app.app, "sess_ctx").await;
    assert_eq!(history[0]["content"], "why is this slow");
}

#[tokio::test]
async fn tool_round_trip_reports_modified_files() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "sess_tools", "cand_1").await;
    let mut file_events = test_app.state.file_events();

    test_app.tool_agent.push_script(vec![
        json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "id": "toolu_1", "name": "write_file",
             "input": {"path": "solution.py", "content": "print(1)"}}
        ]}}),
        json!({"type": "user", "message": {"content": [
            {"type": "tool_result", "tool_use_id": "toolu_1",
             "content": "{\"success\":true,\"path\":\"solution.py\"}"}
        ]}}),
        json!({"type": "result", "subtype": "success", "result": "Written."}),
    ]);

    let frames = chat(&test_app.app, "sess_tools", json!({ "message": "write a solution" })).await;
    insta::assert_snapshot!(
        event_names(&frames),
        @"stream_start tool_use_start tool_result content done"
    );

    let start = &frames[1].data;
    let result = &frames[2].data;
    assert_eq!(start["toolId"], "toolu_1");
    assert_eq!(start["toolName"], "write_file");
    assert_eq!(result["toolId"], "toolu_1");
    assert_eq!(result["toolName"], "write_file");
    assert_eq!(result["isError"], false);
    assert_eq!(result["output"], json!({ "success": true, "path": "solution.py" }));

    let done = &frames.last().expect("done").data;
    assert_eq!(done["toolsUsed"], json!(["write_file"]));
    assert_eq!(done["filesModified"], json!(["solution.py"]));

    let change = file_events.try_recv().expect("file change");
    assert_eq!(change.session_id, "sess_tools");
    assert_eq!(change.path, "solution.py");
    assert_eq!(
        serde_json::to_value(&change).expect("serialize")["type"],
        "create"
    );

    let (status, files) = send_json(
        &test_app.app,
        Method::GET,
        "/v1/sessions/sess_tools/files",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(files["files"], json!(["solution.py"]));
}

#[tokio::test]
async fn orphan_tool_result_gets_a_synthetic_start() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "sess_orphan", "cand_1").await;
    test_app.tool_agent.push_script(vec![
        json!({"type": "user", "message": {"content": [
            {"type": "tool_result", "tool_use_id": "toolu_lost", "content": "plain text output"}
        ]}}),
        json!({"type": "result", "subtype": "success", "result": "ok"}),
    ]);

    let frames = chat(&test_app.app, "sess_orphan", json!({ "message": "go" })).await;
    insta::assert_snapshot!(
        event_names(&frames),
        @"stream_start tool_use_start tool_result content done"
    );
    assert_eq!(frames[1].data["toolId"], "toolu_lost");
    assert_eq!(frames[1].data["input"], json!({}));
    assert_eq!(frames[2].data["toolId"], "toolu_lost");
    assert_eq!(frames[2].data["output"]["rawContent"], "plain text output");
}

#[tokio::test]
async fn backend_failure_ends_with_error_and_failed_checkpoint() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "sess_fail", "cand_1").await;
    test_app.tool_agent.push_script(vec![
        json!({"type": "stream_event", "event": {"type": "content_block_delta",
            "delta": {"type": "text_delta", "text": "Let me think"}}}),
        json!({"type": "result", "subtype": "error_during_execution", "is_error": true,
            "result": "API Error: 529 Overloaded"}),
    ]);

    let frames = chat(&test_app.app, "sess_fail", json!({ "message": "explain recursion" })).await;
    insta::assert_snapshot!(event_names(&frames), @"stream_start content error");

    let error = &frames.last().expect("error").data;
    assert_eq!(error["error"], "backend_overloaded");
    assert_eq!(error["retryable"], true);
    assert_eq!(error["messageId"], frames[0].data["messageId"]);

    let saved = checkpoints(&test_app.app, "sess_fail").await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0]["status"], "failed");
    assert_eq!(saved[0]["partialResponse"], "Let me think");
    assert_eq!(saved[0]["userMessage"], "explain recursion");
    assert_eq!(saved[0]["questionId"], "q_1");

    // Nothing is appended to the conversation for a failed turn.
    assert!(messages(&test_app.app, "sess_fail").await.is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_streaming() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "sess_bad", "cand_1").await;

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions/sess_bad/chat/stream",
        Some(json!({ "message": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], "urn:interview-agent:error:invalid_request");
    assert_eq!(problem["retryable"], false);

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions/missing/chat/stream",
        Some(json!({ "message": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["sessionId"], "missing");
    assert_eq!(problem["status"], Value::from(404));
}
