use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value as Json};

use starbridge_wire::wire::mock::MockDebugServerConfig;
use starbridge_wire::{Frame, Location, PauseReason, PausedThread, RequestPayload, Scope, Value};

use crate::harness::Launched;

const THREAD: i64 = 3;

fn value(label: &str, description: &str, type_name: &str, id: i64) -> Value {
    Value {
        label: label.to_string(),
        description: description.to_string(),
        type_name: type_name.to_string(),
        has_children: id != 0,
        id,
    }
}

fn mock_config() -> MockDebugServerConfig {
    MockDebugServerConfig {
        frames: vec![
            Frame {
                function_name: "cc_library_macro".to_string(),
                scopes: vec![
                    Scope {
                        name: "local".to_string(),
                        bindings: vec![
                            value("name", "\"lib\"", "string", 0),
                            value("srcs", "[\"a.cc\"]", "list", 11),
                        ],
                    },
                    Scope {
                        name: "global".to_string(),
                        bindings: Vec::new(),
                    },
                ],
                location: Some(Location {
                    path: "/nonexistent/pkg/defs.bzl".to_string(),
                    line_number: 4,
                    column_number: 2,
                }),
            },
            Frame {
                function_name: String::new(),
                scopes: Vec::new(),
                location: Some(Location {
                    path: "/nonexistent/pkg/BUILD".to_string(),
                    line_number: 10,
                    column_number: 1,
                }),
            },
            Frame::default(),
        ],
        children: HashMap::from([
            (11, vec![value("[0]", "\"a.cc\"", "string", 0)]),
            (
                42,
                vec![
                    value("label", "//pkg:lib", "Label", 0),
                    value("attr", "<attrs>", "struct", 43),
                ],
            ),
        ]),
        evaluations: HashMap::from([
            ("ctx".to_string(), value("ctx", "<rule context>", "ctx", 42)),
            ("1 + 1".to_string(), value("1 + 1", "2", "int", 0)),
        ]),
        pause_on_start: Some(PausedThread {
            id: THREAD,
            name: "skyframe-evaluator 3".to_string(),
            pause_reason: PauseReason::Initializing,
            ..PausedThread::default()
        }),
        pause_after_step: true,
        ..MockDebugServerConfig::default()
    }
}

async fn paused_session() -> Launched {
    paused_session_with(mock_config()).await
}

async fn paused_session_with(config: MockDebugServerConfig) -> Launched {
    let mut session = Launched::start(config).await;
    session.client.call_ok("configurationDone", json!({})).await;
    let stopped = session.client.wait_for_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "entry");
    assert_eq!(stopped["body"]["threadId"], THREAD);
    session
}

async fn top_frame_id(session: &mut Launched) -> i64 {
    let resp = session
        .client
        .call_ok("stackTrace", json!({ "threadId": THREAD }))
        .await;
    resp["body"]["stackFrames"][0]["id"].as_i64().unwrap()
}

fn is_response(msg: &Json) -> bool {
    msg["type"] == "response"
}

async fn wait_for_request(session: &Launched, name: &str) {
    for _ in 0..200 {
        if session
            .mock
            .requests()
            .iter()
            .any(|request| request.payload.name() == name)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{name} never reached the debug server");
}

fn variables_by_name(resp: &Json) -> HashMap<String, Json> {
    resp["body"]["variables"]
        .as_array()
        .unwrap()
        .iter()
        .map(|var| (var["name"].as_str().unwrap().to_string(), var.clone()))
        .collect()
}

#[tokio::test]
async fn threads_lists_exactly_the_paused_thread() {
    let mut session = paused_session().await;
    let resp = session.client.call_ok("threads", json!({})).await;
    assert_eq!(
        resp["body"]["threads"],
        json!([{ "id": THREAD, "name": "skyframe-evaluator 3" }])
    );
}

#[tokio::test]
async fn stack_trace_renders_frames_and_pages() {
    let mut session = paused_session().await;

    let resp = session
        .client
        .call_ok("stackTrace", json!({ "threadId": THREAD }))
        .await;
    assert_eq!(resp["body"]["totalFrames"], 3);
    let frames = resp["body"]["stackFrames"].as_array().unwrap();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["name"], "cc_library_macro");
    assert_eq!(frames[0]["line"], 4);
    assert_eq!(frames[0]["source"]["path"], "/nonexistent/pkg/defs.bzl");
    assert_eq!(frames[0]["source"]["name"], "defs.bzl");
    assert_eq!(frames[1]["name"], "<global scope>");
    assert_eq!(frames[2]["line"], 0);
    assert!(frames[2].get("source").is_none());

    let ids: Vec<i64> = frames.iter().map(|f| f["id"].as_i64().unwrap()).collect();
    assert!(ids.iter().all(|id| *id > 0));
    assert!(ids.windows(2).all(|pair| pair[0] != pair[1]));

    let page = session
        .client
        .call_ok(
            "stackTrace",
            json!({ "threadId": THREAD, "startFrame": 1, "levels": 1 }),
        )
        .await;
    assert_eq!(page["body"]["totalFrames"], 3);
    let page_frames = page["body"]["stackFrames"].as_array().unwrap();
    assert_eq!(page_frames.len(), 1);
    assert_eq!(page_frames[0]["name"], "<global scope>");
}

#[tokio::test]
async fn scopes_expose_bindings_and_expand_children() {
    let mut session = paused_session().await;
    let frame_id = top_frame_id(&mut session).await;

    let scopes = session
        .client
        .call_ok("scopes", json!({ "frameId": frame_id }))
        .await;
    let scopes = scopes["body"]["scopes"].as_array().unwrap().clone();
    assert_eq!(scopes.len(), 2);
    assert_eq!(scopes[0]["name"], "local");
    let local_ref = scopes[0]["variablesReference"].as_i64().unwrap();
    assert!(local_ref > 0);

    let vars = session
        .client
        .call_ok("variables", json!({ "variablesReference": local_ref }))
        .await;
    let vars = variables_by_name(&vars);
    assert_eq!(vars["name"]["value"], "\"lib\"");
    assert_eq!(vars["name"]["type"], "string");
    assert_eq!(vars["name"]["variablesReference"], 0);
    let srcs_ref = vars["srcs"]["variablesReference"].as_i64().unwrap();
    assert!(srcs_ref > 0);

    let children = session
        .client
        .call_ok("variables", json!({ "variablesReference": srcs_ref }))
        .await;
    assert_eq!(children["body"]["variables"][0]["name"], "[0]");
    assert!(session.mock.requests().iter().any(|request| matches!(
        request.payload,
        RequestPayload::GetChildren { thread_id: THREAD, value_id: 11 }
    )));
}

#[tokio::test]
async fn evaluate_expandable_result_fetches_children_on_owning_thread() {
    let mut session = paused_session().await;
    let frame_id = top_frame_id(&mut session).await;

    let resp = session
        .client
        .call_ok("evaluate", json!({ "expression": "ctx", "frameId": frame_id }))
        .await;
    assert_eq!(resp["body"]["result"], "<rule context>");
    assert_eq!(resp["body"]["type"], "ctx");
    let handle = resp["body"]["variablesReference"].as_i64().unwrap();
    assert_ne!(handle, 0);

    let vars = session
        .client
        .call_ok("variables", json!({ "variablesReference": handle }))
        .await;
    let vars = variables_by_name(&vars);
    assert_eq!(vars["label"]["value"], "//pkg:lib");
    assert_ne!(vars["attr"]["variablesReference"], 0);

    let requests = session.mock.requests();
    assert!(requests.iter().any(|request| matches!(
        &request.payload,
        RequestPayload::Evaluate { thread_id: THREAD, statement } if statement == "ctx"
    )));
    assert!(requests.iter().any(|request| matches!(
        request.payload,
        RequestPayload::GetChildren { thread_id: THREAD, value_id: 42 }
    )));
}

#[tokio::test]
async fn evaluate_leaf_and_failed_expressions() {
    let mut session = paused_session().await;
    let frame_id = top_frame_id(&mut session).await;

    let leaf = session
        .client
        .call_ok("evaluate", json!({ "expression": "1 + 1", "frameId": frame_id }))
        .await;
    assert_eq!(leaf["body"]["result"], "2");
    assert_eq!(leaf["body"]["variablesReference"], 0);

    // Bazel rejects the expression; the session answers with an empty result
    // and stays usable.
    let failed = session
        .client
        .call_ok("evaluate", json!({ "expression": "undefined_name", "frameId": frame_id }))
        .await;
    assert_eq!(failed["body"]["result"], "");
    assert_eq!(failed["body"]["variablesReference"], 0);

    session.client.call_ok("threads", json!({})).await;
}

#[tokio::test]
async fn stepping_invalidates_earlier_handles() {
    let mut session = paused_session().await;
    let frame_id = top_frame_id(&mut session).await;
    let scopes = session
        .client
        .call_ok("scopes", json!({ "frameId": frame_id }))
        .await;
    let scope_ref = scopes["body"]["scopes"][0]["variablesReference"]
        .as_i64()
        .unwrap();

    session
        .client
        .call_ok("next", json!({ "threadId": THREAD }))
        .await;
    let stopped = session.client.wait_for_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "step");

    let stale_scopes = session
        .client
        .call("scopes", json!({ "frameId": frame_id }))
        .await;
    assert_eq!(stale_scopes["success"], false);

    let stale_vars = session
        .client
        .call("variables", json!({ "variablesReference": scope_ref }))
        .await;
    assert_eq!(stale_vars["success"], false);

    let stale_eval = session
        .client
        .call("evaluate", json!({ "expression": "ctx", "frameId": frame_id }))
        .await;
    assert_eq!(stale_eval["success"], false);
    assert!(stale_eval["message"].as_str().unwrap().contains("stale scope"));

    // Fresh handles never alias the invalidated ones.
    let fresh = top_frame_id(&mut session).await;
    assert!(fresh > frame_id);

    assert!(session.mock.requests().iter().any(|request| matches!(
        request.payload,
        RequestPayload::ContinueExecution {
            thread_id: THREAD,
            stepping: starbridge_wire::Stepping::Over,
        }
    )));
}

#[tokio::test]
async fn continue_resumes_and_reports_continued() {
    let mut session = paused_session().await;

    let resp = session
        .client
        .call_ok("continue", json!({ "threadId": THREAD }))
        .await;
    assert_eq!(resp["body"]["allThreadsContinued"], false);

    let continued = session.client.wait_for_event("continued").await;
    assert_eq!(continued["body"]["threadId"], THREAD);

    let threads = session.client.call_ok("threads", json!({})).await;
    assert_eq!(threads["body"]["threads"], json!([]));
}

#[tokio::test]
async fn pause_all_threads_reports_a_pause_stop() {
    let mut session = Launched::start(MockDebugServerConfig::default()).await;
    session.client.call_ok("configurationDone", json!({})).await;

    session.client.call_ok("pause", json!({ "threadId": 0 })).await;
    let stopped = session.client.wait_for_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "pause");
    assert_eq!(stopped["body"]["threadId"], 1);

    assert!(session.mock.requests().iter().any(|request| matches!(
        request.payload,
        RequestPayload::PauseThread { thread_id: 0 }
    )));
}

#[tokio::test]
async fn conditional_breakpoint_errors_stop_as_exceptions() {
    let mut session = Launched::start(MockDebugServerConfig::default()).await;
    session.client.call_ok("configurationDone", json!({})).await;

    session.mock.pause_thread(PausedThread {
        id: 5,
        name: "skyframe-evaluator 5".to_string(),
        pause_reason: PauseReason::ConditionalBreakpointError,
        condition_error: Some("name 'srcs' is not defined".to_string()),
        ..PausedThread::default()
    });
    let stopped = session.client.wait_for_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "exception");
    assert_eq!(stopped["body"]["description"], "name 'srcs' is not defined");
}

#[tokio::test]
async fn threads_is_answered_while_children_are_still_loading() {
    let mut config = mock_config();
    config
        .reply_delays
        .insert("getChildren", Duration::from_millis(500));
    let mut session = paused_session_with(config).await;
    let frame_id = top_frame_id(&mut session).await;
    let scopes = session
        .client
        .call_ok("scopes", json!({ "frameId": frame_id }))
        .await;
    let local_ref = scopes["body"]["scopes"][0]["variablesReference"].clone();
    let locals = session
        .client
        .call_ok("variables", json!({ "variablesReference": local_ref }))
        .await;
    let srcs_ref = variables_by_name(&locals)["srcs"]["variablesReference"].clone();

    let variables_seq = session
        .client
        .send("variables", json!({ "variablesReference": srcs_ref }))
        .await;
    let threads_seq = session.client.send("threads", json!({})).await;

    let first = session.client.wait_for(is_response).await;
    assert_eq!(first["request_seq"], threads_seq, "{first}");
    assert_eq!(first["body"]["threads"][0]["id"], THREAD);

    let second = session.client.wait_for(is_response).await;
    assert_eq!(second["request_seq"], variables_seq);
    assert_eq!(second["success"], true, "{second}");
    assert_eq!(second["body"]["variables"][0]["name"], "[0]");
}

#[tokio::test]
async fn stack_trace_in_flight_across_a_resume_is_stale() {
    let mut config = mock_config();
    config
        .reply_delays
        .insert("listFrames", Duration::from_millis(300));
    let mut session = paused_session_with(config).await;

    let trace_seq = session
        .client
        .send("stackTrace", json!({ "threadId": THREAD }))
        .await;
    wait_for_request(&session, "listFrames").await;
    session
        .client
        .call_ok("continue", json!({ "threadId": THREAD }))
        .await;

    let trace = session
        .client
        .wait_for(|msg| is_response(msg) && msg["request_seq"] == trace_seq)
        .await;
    assert_eq!(trace["success"], false);
    assert!(
        trace["message"].as_str().unwrap().contains("stale scope"),
        "{trace}"
    );

    // Frames listed after the resume get their own, valid handles.
    let resp = session
        .client
        .call_ok("stackTrace", json!({ "threadId": THREAD }))
        .await;
    let frame_id = resp["body"]["stackFrames"][0]["id"].as_i64().unwrap();
    session
        .client
        .call_ok("scopes", json!({ "frameId": frame_id }))
        .await;
}
