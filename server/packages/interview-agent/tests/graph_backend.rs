mod common;

use serde_json::{json, Value};

use common::*;
use interview_agent::assignment::Experiment;
use interview_agent::threads::thread_id_for;

#[tokio::test]
async fn explicit_choice_sticks_for_the_session() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "sess_graph", "cand_1").await;
    test_app.graph.script(vec![
        ("metadata", json!({ "run_id": "run_1" })),
        ("messages", graph_chunk("Start ")),
        ("messages", graph_chunk("small.")),
        ("end", Value::Null),
    ]);
    test_app.graph.script(vec![("messages", graph_chunk("Still here."))]);

    let first = chat(
        &test_app.app,
        "sess_graph",
        json!({ "message": "where do I start", "backend": "graph" }),
    )
    .await;
    insta::assert_snapshot!(event_names(&first), @"stream_start content content done");
    let done = &first.last().expect("done").data;
    assert_eq!(done["response"], "Start small.");
    assert_eq!(done["metadata"]["backend"], "graph");
    assert_eq!(done["metadata"]["assignmentSource"], "explicit");
    assert_eq!(
        done["metadata"]["threadId"],
        thread_id_for("sess_graph", "coding_assistant")
    );

    // A different explicit choice on a later turn is ignored.
    let second = chat(
        &test_app.app,
        "sess_graph",
        json!({ "message": "and then?", "backend": "tool_agent" }),
    )
    .await;
    let done = &second.last().expect("done").data;
    assert_eq!(done["response"], "Still here.");
    assert_eq!(done["metadata"]["backend"], "graph");
    assert_eq!(done["metadata"]["assignmentSource"], "sticky");

    // The thread already holds the history, so only the new message is sent.
    let inputs = test_app.graph.inputs.lock().expect("inputs").clone();
    assert_eq!(inputs[0]["messages"].as_array().map(Vec::len), Some(1));
    assert_eq!(inputs[1]["messages"].as_array().map(Vec::len), Some(1));

    let session = send_json(
        &test_app.app,
        axum::http::Method::GET,
        "/v1/sessions/sess_graph",
        None,
    )
    .await
    .1;
    assert_eq!(session["assignment"]["backend"], "graph");
}

#[tokio::test]
async fn corrupted_thread_is_recreated_once() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "sess_corrupt", "cand_1").await;
    test_app
        .graph
        .script(vec![("error", json!({ "error": "BadRequest", "message": CORRUPTED }))]);
    test_app.graph.script(vec![("messages", graph_chunk("Recovered."))]);

    let frames = chat(
        &test_app.app,
        "sess_corrupt",
        json!({ "message": "continue", "backend": "graph" }),
    )
    .await;
    insta::assert_snapshot!(event_names(&frames), @"stream_start content done");
    assert_eq!(frames.last().expect("done").data["response"], "Recovered.");
    assert_eq!(test_app.graph.deletes(), 1);
    assert_eq!(test_app.graph.runs_started(), 2);
}

#[tokio::test]
async fn persistent_corruption_is_reported_as_final() {
    let test_app = TestApp::new();
    create_session(&test_app.app, "sess_broken", "cand_1").await;
    test_app
        .graph
        .script(vec![("error", json!({ "message": CORRUPTED }))]);
    test_app
        .graph
        .script(vec![("error", json!({ "message": CORRUPTED }))]);

    let frames = chat(
        &test_app.app,
        "sess_broken",
        json!({ "message": "continue", "backend": "graph" }),
    )
    .await;
    insta::assert_snapshot!(event_names(&frames), @"stream_start error");
    let error = &frames.last().expect("error").data;
    assert_eq!(error["error"], "backend_failed");
    assert_eq!(error["retryable"], false);
    assert_eq!(test_app.graph.deletes(), 1);
    assert_eq!(test_app.graph.runs_started(), 2);
}

#[tokio::test]
async fn full_rollout_routes_new_sessions_to_graph() {
    let test_app = TestApp::builder()
        .experiment(Experiment {
            id: "graph-rollout".to_string(),
            enabled: true,
            graph_percentage: 100,
            organizations: Vec::new(),
        })
        .build();
    create_session(&test_app.app, "sess_rollout", "cand_9").await;
    test_app.graph.script(vec![("messages", graph_chunk("Hi."))]);

    let frames = chat(&test_app.app, "sess_rollout", json!({ "message": "hello" })).await;
    let metadata = &frames.last().expect("done").data["metadata"];
    assert_eq!(metadata["backend"], "graph");
    assert_eq!(metadata["assignmentSource"], "experiment");
    assert_eq!(metadata["experimentId"], "graph-rollout");
}

#[tokio::test]
async fn organizations_outside_the_experiment_keep_the_default() {
    let test_app = TestApp::builder()
        .experiment(Experiment {
            id: "graph-rollout".to_string(),
            enabled: true,
            graph_percentage: 100,
            organizations: vec!["org_other".to_string()],
        })
        .build();
    create_session(&test_app.app, "sess_outside", "cand_9").await;

    let frames = chat(&test_app.app, "sess_outside", json!({ "message": "hello" })).await;
    let metadata = &frames.last().expect("done").data["metadata"];
    assert_eq!(metadata["backend"], "tool_agent");
    assert_eq!(metadata["assignmentSource"], "default");
    assert_eq!(test_app.graph.runs_started(), 0);
}
