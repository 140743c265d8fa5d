use std::time::Duration;

use serde_json::json;

use starbridge_wire::wire::mock::MockDebugServerConfig;

use crate::harness::{config_for, is_event, DapClient, Launched};

#[cfg(target_os = "linux")]
async fn wait_for_exit(pid: u32) {
    let proc_path = format!("/proc/{pid}");
    for _ in 0..100 {
        if !std::path::Path::new(&proc_path).exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("process {pid} still running");
}

async fn read_pid(path: &std::path::Path) -> u32 {
    for _ in 0..100 {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(pid) = contents.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("pid file {} was never written", path.display());
}

#[tokio::test]
async fn requests_before_launch_are_not_connected() {
    let mut client = DapClient::start(config_for(1));

    let init = client.call_ok("initialize", json!({})).await;
    assert_eq!(init["body"]["supportsConfigurationDoneRequest"], true);
    assert_eq!(init["body"]["supportsConditionalBreakpoints"], true);
    assert_eq!(init["body"]["supportsEvaluateForHovers"], true);

    for (command, args) in [
        ("configurationDone", json!({})),
        ("stackTrace", json!({ "threadId": 1 })),
        ("continue", json!({ "threadId": 1 })),
        ("pause", json!({ "threadId": 0 })),
        (
            "setBreakpoints",
            json!({ "source": { "path": "/ws/BUILD" }, "breakpoints": [] }),
        ),
    ] {
        let resp = client.call(command, args).await;
        assert_eq!(resp["success"], false, "{command}");
        assert_eq!(resp["message"], "not connected", "{command}");
    }

    let threads = client.call_ok("threads", json!({})).await;
    assert_eq!(threads["body"]["threads"], json!([]));
}

#[tokio::test]
async fn unknown_commands_get_an_error_response() {
    let mut client = DapClient::start(config_for(1));
    let resp = client.call("restartFrame", json!({ "frameId": 1 })).await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["command"], "restartFrame");
    assert!(resp["message"].as_str().unwrap().contains("unsupported request"));
}

#[tokio::test]
async fn missing_arguments_are_invalid_requests() {
    let mut session = Launched::start(MockDebugServerConfig::default()).await;
    let resp = session.client.call("stackTrace", json!({})).await;
    assert_eq!(resp["success"], false);
    assert!(resp["message"]
        .as_str()
        .unwrap()
        .contains("stackTrace.threadId is required"));
}

#[tokio::test]
async fn transport_loss_terminates_exactly_once() {
    let mut session = Launched::start(MockDebugServerConfig::default()).await;
    session.client.call_ok("configurationDone", json!({})).await;

    session.mock.disconnect();
    let output = session
        .client
        .wait_for(|msg| {
            is_event(msg, "output") && msg["body"]["category"] == "console"
        })
        .await;
    assert!(output["body"]["output"]
        .as_str()
        .unwrap()
        .contains("closed the connection"));
    session.client.wait_for_event("terminated").await;

    let resp = session.client.call("stackTrace", json!({ "threadId": 1 })).await;
    assert_eq!(resp["message"], "not connected");

    session.client.call_ok("disconnect", json!({})).await;
    let rest = session.client.drain().await;
    assert!(
        !rest.iter().any(|msg| is_event(msg, "terminated")),
        "terminated emitted twice: {rest:?}"
    );
}

#[tokio::test]
async fn disconnect_kills_bazel_and_terminates() {
    let (_dir, ws) = crate::harness::workspace();
    let pid_file = ws.join("bazel.pid");
    let mut session = Launched::start_with_args(
        MockDebugServerConfig::default(),
        vec!["--pid-file".to_string(), pid_file.to_string_lossy().into_owned()],
    )
    .await;
    let pid = read_pid(&pid_file).await;

    session.client.call_ok("disconnect", json!({})).await;
    let rest = session.client.drain().await;
    assert_eq!(
        rest.iter().filter(|msg| is_event(msg, "terminated")).count(),
        1,
        "{rest:?}"
    );

    #[cfg(target_os = "linux")]
    wait_for_exit(pid).await;
    #[cfg(not(target_os = "linux"))]
    let _ = pid;

    let result = tokio::time::timeout(Duration::from_secs(5), &mut session.client.server_task)
        .await
        .expect("server loop should stop after disconnect")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn bazel_exit_terminates_the_session() {
    let mut session = Launched::start_with_args(
        MockDebugServerConfig::default(),
        vec!["--exit-after-ms".to_string(), "200".to_string()],
    )
    .await;

    session
        .client
        .wait_for(|msg| {
            is_event(msg, "output")
                && msg["body"]["output"]
                    .as_str()
                    .is_some_and(|text| text.contains("Bazel exited with code 0"))
        })
        .await;
    session.client.wait_for_event("terminated").await;

    let threads = session.client.call_ok("threads", json!({})).await;
    assert_eq!(threads["body"]["threads"], json!([]));
}

#[tokio::test]
async fn closing_the_client_stream_stops_the_server() {
    let (_dir, ws) = crate::harness::workspace();
    let pid_file = ws.join("bazel.pid");
    let session = Launched::start_with_args(
        MockDebugServerConfig::default(),
        vec!["--pid-file".to_string(), pid_file.to_string_lossy().into_owned()],
    )
    .await;
    let pid = read_pid(&pid_file).await;

    let server_task = session.client.close();
    let result = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server loop should stop at end of input")
        .unwrap();
    assert!(result.is_ok());

    #[cfg(target_os = "linux")]
    wait_for_exit(pid).await;
    #[cfg(not(target_os = "linux"))]
    let _ = pid;
}
