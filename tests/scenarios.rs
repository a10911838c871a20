//! End-to-end scenarios driving `Session` through its public dispatch API.
//! Each test corresponds to one of the concrete scenarios named in
//! SPEC_FULL.md §8. S2 (async step-over landing outside scheduler internals)
//! and S6 (cross-context shutdown failing every pending call exactly once)
//! are exercised at the unit level in `stepper.rs` and `correlation.rs`
//! respectively, since they need direct access to those components' internal
//! state rather than the session's coarser request/response surface.

use dapper_core::config::Configuration;
use dapper_core::dap_types::*;
use dapper_core::engine::EngineEvent;
use dapper_core::session::{Session, SessionState};
use serde_json::json;

fn req(seq: i64, command: &str, args: serde_json::Value) -> Request {
    Request {
        base: ProtocolMessage { seq, type_: "request".into() },
        command: command.into(),
        arguments: args,
    }
}

async fn boot(cfg: Configuration) -> Session {
    let mut session = Session::new(cfg);
    let (resp, _) = session.dispatch(req(1, "initialize", json!({}))).await;
    assert!(resp.success);
    let (resp, _) = session.dispatch(req(2, "launch", json!({}))).await;
    assert!(resp.success, "{resp:?}");
    session
}

/// S1 — launch and hit a line breakpoint: set a breakpoint, configure the
/// session, then fold in the raw `LineReached` trace callback the interpreter
/// would report once the program counter actually reaches that line. The
/// core — not the interpreter — is what decides this warrants a stop.
#[tokio::test]
async fn s1_launch_and_hit_line_breakpoint() {
    let mut cfg = Configuration::default();
    cfg.module = Some("main".into());
    let mut session = boot(cfg).await;

    let (resp, _) = session
        .dispatch(req(
            3,
            "setBreakpoints",
            json!({ "source": { "path": "main.py" }, "breakpoints": [{ "line": 3 }] }),
        ))
        .await;
    assert!(resp.success);
    let bp_id = resp.body["breakpoints"][0]["id"].as_i64().unwrap();

    let (resp, events) = session.dispatch(req(4, "configurationDone", json!({}))).await;
    assert!(resp.success);
    assert_eq!(session.state, SessionState::Running);
    assert!(events.is_empty(), "stopOnEntry was not requested");

    let events = session.apply_engine_event(EngineEvent::LineReached {
        thread_id: 1,
        source_path: "main.py".into(),
        line: 3,
        frame_depth: 0,
        frame_identity: "main".into(),
        qualified_frame_name: "main".into(),
    })
    .await;
    assert_eq!(session.state, SessionState::Stopped);
    assert_eq!(events[0].event, "stopped");
    assert_eq!(events[0].body["hitBreakpointIds"], json!([bp_id]));

    let (resp, _) = session
        .dispatch(req(5, "stackTrace", json!({ "threadId": 1 })))
        .await;
    assert!(resp.success);
    assert!(resp.body["stackFrames"].as_array().unwrap().len() >= 1);
}

/// A line reached inside an async-scheduler-internal frame never surfaces as
/// a stop, regardless of any breakpoint set on that line.
#[tokio::test]
async fn line_reached_inside_async_internal_frame_is_ignored() {
    let mut cfg = Configuration::default();
    cfg.module = Some("main".into());
    cfg.async_internal_frame_prefixes = vec!["asyncio.".into()];
    let mut session = boot(cfg).await;

    session
        .dispatch(req(
            3,
            "setBreakpoints",
            json!({ "source": { "path": "main.py" }, "breakpoints": [{ "line": 3 }] }),
        ))
        .await;
    session.dispatch(req(4, "configurationDone", json!({}))).await;

    let events = session.apply_engine_event(EngineEvent::LineReached {
        thread_id: 1,
        source_path: "main.py".into(),
        line: 3,
        frame_depth: 0,
        frame_identity: "main".into(),
        qualified_frame_name: "asyncio.tasks.Task.__step".into(),
    })
    .await;
    assert!(events.is_empty());
    assert_eq!(session.state, SessionState::Running);
}

/// A breakpoint carrying a log message never stops execution; it emits an
/// output event and lets the program continue.
#[tokio::test]
async fn log_point_emits_output_without_stopping() {
    let mut cfg = Configuration::default();
    cfg.module = Some("main".into());
    let mut session = boot(cfg).await;

    session
        .dispatch(req(
            3,
            "setBreakpoints",
            json!({
                "source": { "path": "main.py" },
                "breakpoints": [{ "line": 5, "logMessage": "reached line 5, x={x}" }],
            }),
        ))
        .await;
    session.dispatch(req(4, "configurationDone", json!({}))).await;

    let events = session
        .apply_engine_event(EngineEvent::LineReached {
            thread_id: 1,
            source_path: "main.py".into(),
            line: 5,
            frame_depth: 0,
            frame_identity: "main".into(),
            qualified_frame_name: "main".into(),
        })
        .await;
    assert_eq!(session.state, SessionState::Running);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "output");
    assert_eq!(
        events[0].body["output"],
        json!("reached line 5, x=<unevaluated: x>"),
        "the {{x}} placeholder is substituted via the engine's evaluator, not forwarded raw"
    );
}

/// A raised exception stops only when the active exception filters say so.
#[tokio::test]
async fn exception_raised_stops_when_raised_filter_active() {
    let mut cfg = Configuration::default();
    cfg.module = Some("main".into());
    let mut session = boot(cfg).await;
    session
        .dispatch(req(3, "setExceptionBreakpoints", json!({ "filters": ["raised"] })))
        .await;
    session.dispatch(req(4, "configurationDone", json!({}))).await;

    let events = session
        .apply_engine_event(EngineEvent::ExceptionRaised {
            thread_id: 1,
            source_path: "main.py".into(),
        })
        .await;
    assert_eq!(session.state, SessionState::Stopped);
    assert_eq!(events[0].event, "stopped");
    assert_eq!(events[0].body["reason"], json!("exception"));
}

/// Without any exception filter active, a raised exception does not stop —
/// only an unwind past user code does.
#[tokio::test]
async fn exception_raised_without_filters_does_not_stop_until_unwind() {
    let mut cfg = Configuration::default();
    cfg.module = Some("main".into());
    let mut session = boot(cfg).await;
    session.dispatch(req(3, "configurationDone", json!({}))).await;

    let events = session
        .apply_engine_event(EngineEvent::ExceptionRaised {
            thread_id: 1,
            source_path: "main.py".into(),
        })
        .await;
    assert!(events.is_empty());
    assert_eq!(session.state, SessionState::Running);

    let events = session
        .apply_engine_event(EngineEvent::ExceptionUnwindPastUserCode { thread_id: 1 })
        .await;
    assert_eq!(session.state, SessionState::Stopped);
    assert_eq!(events[0].body["reason"], json!("exception"));
}

/// A watched data id stopping on change only fires once the observed value
/// actually differs from the last snapshot.
#[tokio::test]
async fn watch_observed_stops_only_on_value_change() {
    let mut cfg = Configuration::default();
    cfg.module = Some("main".into());
    let mut session = boot(cfg).await;
    session
        .dispatch(req(
            3,
            "setDataBreakpoints",
            json!({ "breakpoints": [{ "dataId": "frame:1:name:counter", "accessType": "write" }] }),
        ))
        .await;
    session.dispatch(req(4, "configurationDone", json!({}))).await;

    let events = session
        .apply_engine_event(EngineEvent::WatchObserved {
            thread_id: 1,
            data_id: "frame:1:name:counter".into(),
            value: "0".into(),
        })
        .await;
    assert_eq!(session.state, SessionState::Stopped, "first observation differs from the unset snapshot");
    session.state = SessionState::Running;

    let events = session
        .apply_engine_event(EngineEvent::WatchObserved {
            thread_id: 1,
            data_id: "frame:1:name:counter".into(),
            value: "0".into(),
        })
        .await;
    assert!(events.is_empty(), "repeating the same value does not re-fire");

    let events = session
        .apply_engine_event(EngineEvent::WatchObserved {
            thread_id: 1,
            data_id: "frame:1:name:counter".into(),
            value: "1".into(),
        })
        .await;
    assert_eq!(session.state, SessionState::Stopped);
    assert_eq!(events[0].body["reason"], json!("data breakpoint"));
}

/// S3 — a data breakpoint expression containing a denied token is accepted
/// into the store (so the category reflects the full requested set) but
/// reported back unverified with a policy_denied detail, not rejected
/// wholesale.
#[tokio::test]
async fn s3_strict_policy_denies_dangerous_watch_expression() {
    let mut cfg = Configuration::default();
    cfg.module = Some("main".into());
    cfg.strict_expression_watch_policy = true;
    let mut session = boot(cfg).await;

    let (resp, _) = session
        .dispatch(req(
            3,
            "setDataBreakpoints",
            json!({
                "breakpoints": [{
                    "dataId": "frame:1:expr:open(\"/etc/hosts\")",
                    "accessType": "write",
                }],
            }),
        ))
        .await;
    assert!(resp.success);
    let bp = &resp.body["breakpoints"][0];
    assert_eq!(bp["verified"], json!(false));
    assert_eq!(bp["details"]["errorCode"], json!("policy_denied"));
}

/// S4 — replacing the breakpoint set for a source fully overwrites the prior
/// set, but hit counts for an identity present both before and after survive.
/// A `hitCondition` of exactly 2 proves it: the first real `LineReached`
/// bumps the carried count to 1 without stopping, a replace that keeps the
/// same (source, line, condition) identity must carry that count forward,
/// and the second `LineReached` after the replace has to be the one that
/// finally stops.
#[tokio::test]
async fn s4_replace_preserves_hit_count_for_surviving_identity() {
    let mut cfg = Configuration::default();
    cfg.module = Some("a".into());
    let mut session = boot(cfg).await;

    session
        .dispatch(req(
            3,
            "setBreakpoints",
            json!({
                "source": { "path": "a.py" },
                "breakpoints": [{"line": 1}, {"line": 2, "hitCondition": "2"}, {"line": 3}],
            }),
        ))
        .await;
    session.dispatch(req(4, "configurationDone", json!({}))).await;

    let events = session
        .apply_engine_event(EngineEvent::LineReached {
            thread_id: 1,
            source_path: "a.py".into(),
            line: 2,
            frame_depth: 0,
            frame_identity: "main".into(),
            qualified_frame_name: "main".into(),
        })
        .await;
    assert!(events.is_empty(), "hit count 1 does not yet satisfy hitCondition '2'");
    assert_eq!(session.state, SessionState::Running);

    let (resp, _) = session
        .dispatch(req(
            5,
            "setBreakpoints",
            json!({ "source": { "path": "a.py" }, "breakpoints": [{"line": 2, "hitCondition": "2"}] }),
        ))
        .await;
    assert!(resp.success);
    let breakpoints = resp.body["breakpoints"].as_array().unwrap();
    assert_eq!(breakpoints.len(), 1);
    assert_eq!(breakpoints[0]["line"], json!(2));

    let events = session
        .apply_engine_event(EngineEvent::LineReached {
            thread_id: 1,
            source_path: "a.py".into(),
            line: 2,
            frame_depth: 0,
            frame_identity: "main".into(),
            qualified_frame_name: "main".into(),
        })
        .await;
    assert_eq!(session.state, SessionState::Stopped, "carried hit count 2 now satisfies hitCondition '2'");
    assert_eq!(events[0].event, "stopped");
}

/// S5 — hot reload while stopped reports which module was reloaded and
/// whether the active frame could be rebound.
#[tokio::test]
async fn s5_hot_reload_while_stopped() {
    let mut cfg = Configuration::default();
    cfg.module = Some("m".into());
    let mut session = boot(cfg).await;
    session.dispatch(req(3, "configurationDone", json!({}))).await;
    session
        .apply_engine_event(EngineEvent::Stopped {
            thread_id: 1,
            reason: "breakpoint".into(),
            hit_breakpoint_ids: vec![],
            description: None,
        })
        .await;

    session
        .dispatch(req(
            5,
            "setBreakpoints",
            json!({ "source": { "path": "m.py" }, "breakpoints": [{ "line": 7 }] }),
        ))
        .await;

    let (resp, events) = session
        .dispatch(req(4, "dapper/hot_reload", json!({ "sourcePath": "m.py" })))
        .await;
    assert!(resp.success, "{resp:?}");
    assert_eq!(resp.body["reloadedModule"], json!(true));
    assert!(events.iter().any(|e| e.event == "hot_reload_result"));
    assert!(
        events
            .iter()
            .any(|e| e.event == "loadedSource" && e.body["reason"] == json!("changed")),
        "{events:?}"
    );
}

/// Disconnecting an in-process session resets engine state instead of
/// calling `process::exit`, so the host test process survives to report the
/// assertion below — the in-process analogue of the boundary-behavior
/// requirement that disconnect never silently tears down a shared host.
#[tokio::test]
async fn disconnect_in_process_leaves_host_process_alive() {
    let mut cfg = Configuration::default();
    cfg.module = Some("m".into());
    let mut session = boot(cfg).await;
    let (resp, _) = session.dispatch(req(3, "disconnect", json!({}))).await;
    assert!(resp.success);
    assert_eq!(session.state, SessionState::Terminated);
}
