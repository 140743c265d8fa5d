use serde_json::json;

use starbridge_wire::wire::mock::MockDebugServerConfig;
use starbridge_wire::{Breakpoint, RequestPayload};

use crate::harness::Launched;

fn last_breakpoints(session: &Launched) -> Vec<Breakpoint> {
    session
        .mock
        .requests()
        .into_iter()
        .rev()
        .find_map(|request| match request.payload {
            RequestPayload::SetBreakpoints { breakpoints } => Some(breakpoints),
            _ => None,
        })
        .expect("no setBreakpoints request reached the debug server")
}

fn locations(breakpoints: &[Breakpoint]) -> Vec<(String, u32)> {
    let mut out: Vec<(String, u32)> = breakpoints
        .iter()
        .filter_map(|bp| bp.location.as_ref())
        .map(|location| (location.path.clone(), location.line_number))
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn breakpoints_are_sent_for_workspace_and_external_paths() {
    let mut session = Launched::start(MockDebugServerConfig::default()).await;
    let file = session.path("pkg/file.bzl");
    let external = session
        .path("output_base/external/my_ws/pkg/file.bzl")
        .to_string_lossy()
        .into_owned();
    let file = file.to_string_lossy().into_owned();

    let resp = session
        .client
        .call_ok(
            "setBreakpoints",
            json!({
                "source": { "path": file },
                "breakpoints": [
                    { "line": 3, "condition": "len(srcs) > 1" },
                    { "line": 7 },
                ],
            }),
        )
        .await;
    assert_eq!(
        resp["body"]["breakpoints"],
        json!([
            { "verified": true, "line": 3 },
            { "verified": true, "line": 7 },
        ])
    );

    let sent = last_breakpoints(&session);
    let mut expected = vec![
        (file.clone(), 3),
        (file.clone(), 7),
        (external.clone(), 3),
        (external, 7),
    ];
    expected.sort();
    assert_eq!(locations(&sent), expected);
    let conditional: Vec<_> = sent
        .iter()
        .filter(|bp| bp.expression.as_deref() == Some("len(srcs) > 1"))
        .collect();
    assert_eq!(conditional.len(), 2);
}

#[tokio::test]
async fn each_request_sends_the_union_across_files() {
    let mut session = Launched::start(MockDebugServerConfig::default()).await;
    let first = session.path("pkg/file.bzl").to_string_lossy().into_owned();
    let second = session.path("BUILD").to_string_lossy().into_owned();

    session
        .client
        .call_ok(
            "setBreakpoints",
            json!({ "source": { "path": first }, "breakpoints": [{ "line": 3 }] }),
        )
        .await;
    session
        .client
        .call_ok(
            "setBreakpoints",
            json!({ "source": { "path": second }, "breakpoints": [{ "line": 1 }] }),
        )
        .await;
    assert_eq!(last_breakpoints(&session).len(), 4);

    // Replacing a file's list drops its old entries under both paths.
    session
        .client
        .call_ok(
            "setBreakpoints",
            json!({ "source": { "path": first }, "breakpoints": [] }),
        )
        .await;
    let remaining = locations(&last_breakpoints(&session));
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|(path, line)| path.ends_with("BUILD") && *line == 1));
}

#[tokio::test]
async fn files_outside_the_workspace_keep_a_single_path() {
    let mut session = Launched::start(MockDebugServerConfig::default()).await;
    session
        .client
        .call_ok(
            "setBreakpoints",
            json!({
                "source": { "path": "/elsewhere/tools/defs.bzl" },
                "breakpoints": [{ "line": 12 }],
            }),
        )
        .await;
    assert_eq!(
        locations(&last_breakpoints(&session)),
        [("/elsewhere/tools/defs.bzl".to_string(), 12)]
    );
}

#[tokio::test]
async fn missing_source_path_is_rejected() {
    let mut session = Launched::start(MockDebugServerConfig::default()).await;
    let resp = session
        .client
        .call("setBreakpoints", json!({ "breakpoints": [{ "line": 1 }] }))
        .await;
    assert_eq!(resp["success"], false);
    assert!(resp["message"].as_str().unwrap().contains("source.path"));
}
