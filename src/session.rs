//! Session State Machine (C7).
//!
//! The DAP request dispatcher: drives the `Uninitialized -> Initialized ->
//! Configuring -> Running <-> Stopped -> Terminating -> Terminated`
//! transitions and delegates to the breakpoint store, catalog, engine, and
//! step coordinator. Grounded on `db-backend::dap_server::handle_client`'s
//! `match req.command` dispatch loop, generalized from CodeTracer's
//! trace-replay command set to the full surface in SPEC_FULL.md §4.7, and on
//! `backend-manager::backend_manager::dispatch_message` for the
//! request/response/event envelope shape.

use crate::breakpoints::{AccessType, BreakpointStore, HitCondition};
use crate::catalog::VariableCatalog;
use crate::config::Configuration;
use crate::dap_types::*;
use crate::engine::external::ExternalEngine;
use crate::engine::in_process::InProcessEngine;
use crate::engine::{Engine, EngineEvent, Granularity, StepMode};
use crate::error::{AdapterError, Result};
use crate::stepper::{ExceptionTracker, StepContext, StepCoordinator, WatchTracker};
use crate::transport::{Connection, Multiplexer};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Configuring,
    Running,
    Stopped,
    Terminating,
    Terminated,
}

pub struct Session {
    pub state: SessionState,
    pub config: Configuration,
    engine: Option<Box<dyn Engine>>,
    /// Listener and child handle for a spawned external debuggee, kept alive
    /// for as long as the engine backend it fed is attached.
    external_launch: Option<crate::lifecycle::ExternalLaunch>,
    breakpoints: BreakpointStore,
    catalog: VariableCatalog,
    stepper: StepCoordinator,
    exceptions: ExceptionTracker,
    watches: WatchTracker,
    event_seq: AtomicI64,
    pub strict_denylist: Vec<&'static str>,
}

fn capabilities() -> Capabilities {
    Capabilities {
        supports_configuration_done_request: Some(true),
        supports_function_breakpoints: Some(true),
        supports_conditional_breakpoints: Some(true),
        supports_hit_conditional_breakpoints: Some(true),
        supports_log_points: Some(true),
        exception_breakpoint_filters: Some(vec![
            ExceptionBreakpointsFilter {
                filter: "raised".into(),
                label: "Raised Exceptions".into(),
                description: None,
                default: Some(false),
                supports_condition: Some(false),
            },
            ExceptionBreakpointsFilter {
                filter: "uncaught".into(),
                label: "Uncaught Exceptions".into(),
                description: None,
                default: Some(true),
                supports_condition: Some(false),
            },
            ExceptionBreakpointsFilter {
                filter: "userUnhandled".into(),
                label: "User Unhandled Exceptions".into(),
                description: None,
                default: Some(false),
                supports_condition: Some(false),
            },
        ]),
        supports_exception_options: Some(true),
        supports_set_variable: Some(true),
        supports_set_expression: Some(true),
        supports_completions_request: Some(false),
        supports_data_breakpoints: Some(true),
        supports_loaded_sources_request: Some(true),
        supports_modules_request: Some(false),
        supports_stepping_granularity: Some(true),
        supports_exception_info_request: Some(true),
        supports_terminate_request: Some(true),
        supports_restart_request: Some(true),
        supports_instruction_breakpoints: Some(false),
        supports_disassemble_request: Some(false),
        supports_read_memory_request: Some(false),
        supports_hot_reload: Some(true),
        supports_child_process_debugging: Some(true),
    }
}

impl Session {
    pub fn new(config: Configuration) -> Self {
        Self {
            state: SessionState::Uninitialized,
            breakpoints: BreakpointStore::new(),
            catalog: VariableCatalog::new(),
            stepper: StepCoordinator::new(config.async_internal_frame_prefixes.clone()),
            exceptions: ExceptionTracker::new(),
            watches: WatchTracker::new(),
            event_seq: AtomicI64::new(1),
            strict_denylist: vec!["import", "exec", "eval", "__", "os.", "subprocess", "open("],
            config,
            engine: None,
            external_launch: None,
        }
    }

    /// Attaches an `ExternalEngine` driven by an already-established
    /// connection. Split out from `handle_launch` so the wiring can be
    /// exercised directly against an in-memory socket pair without spawning a
    /// real debuggee process.
    fn attach_external_connection(&mut self, conn: Connection) {
        let mux = Multiplexer::new(conn);
        self.engine = Some(Box::new(ExternalEngine::new(mux, self.config.correlation_grace)));
    }

    fn next_seq(&self) -> i64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn event(&self, name: &str, body: Value) -> Event {
        Event {
            base: ProtocolMessage { seq: self.next_seq(), type_: "event".into() },
            event: name.into(),
            body,
        }
    }

    fn ok(&self, request_seq: i64, command: &str, body: Value) -> Response {
        Response {
            base: ProtocolMessage { seq: self.next_seq(), type_: "response".into() },
            request_seq,
            success: true,
            command: command.into(),
            message: None,
            body,
        }
    }

    fn err(&self, request_seq: i64, command: &str, err: &AdapterError) -> Response {
        Response {
            base: ProtocolMessage { seq: self.next_seq(), type_: "response".into() },
            request_seq,
            success: false,
            command: command.into(),
            message: Some(err.to_string()),
            body: json!({ "error": { "id": 1, "format": err.to_string() }, "details": { "errorCode": err.error_code() } }),
        }
    }

    /// Dispatches one DAP request, returning its response and any events to
    /// emit as a side effect. Requests issued in a forbidden state return a
    /// protocol error without mutating state.
    pub async fn dispatch(&mut self, req: Request) -> (Response, Vec<Event>) {
        let mut events = Vec::new();
        let result = self.handle(&req, &mut events).await;
        let response = match result {
            Ok(body) => self.ok(req.base.seq, &req.command, body),
            Err(e) => self.err(req.base.seq, &req.command, &e),
        };
        (response, events)
    }

    async fn handle(&mut self, req: &Request, events: &mut Vec<Event>) -> Result<Value> {
        match req.command.as_str() {
            "initialize" => self.handle_initialize(events),
            "setBreakpoints" => self.handle_set_breakpoints(req).await,
            "setFunctionBreakpoints" => self.handle_set_function_breakpoints(req).await,
            "setExceptionBreakpoints" => self.handle_set_exception_breakpoints(req).await,
            "setDataBreakpoints" => self.handle_set_data_breakpoints(req).await,
            "launch" | "attach" => self.handle_launch(req, events).await,
            "configurationDone" => self.handle_configuration_done(events).await,
            "continue" => self.handle_continue(req).await,
            "next" => self.handle_step(req, StepMode::Over).await,
            "stepIn" => self.handle_step(req, StepMode::In).await,
            "stepOut" => self.handle_step(req, StepMode::Out).await,
            "pause" => self.handle_pause(req).await,
            "goto" => self.handle_goto(req).await,
            "threads" => self.handle_threads().await,
            "stackTrace" => self.handle_stack_trace(req).await,
            "scopes" => self.handle_scopes(req).await,
            "variables" => self.handle_variables(req).await,
            "setVariable" => self.handle_set_variable(req).await,
            "setExpression" => self.handle_set_expression(req).await,
            "evaluate" => self.handle_evaluate(req).await,
            "exceptionInfo" => self.handle_exception_info(req).await,
            "disconnect" => self.handle_disconnect(req).await,
            "terminate" => self.handle_terminate().await,
            "restart" => self.handle_restart(events).await,
            "dapper/hot_reload" => self.handle_hot_reload(req, events).await,
            other => Err(AdapterError::Protocol(format!("unknown command '{other}'"))),
        }
    }

    fn require_state(&self, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(AdapterError::Protocol(format!(
                "command not allowed in state {:?}",
                self.state
            )))
        }
    }

    fn engine(&self) -> Result<&dyn Engine> {
        self.engine
            .as_deref()
            .ok_or_else(|| AdapterError::Protocol("no engine attached".into()))
    }

    fn handle_initialize(&mut self, events: &mut Vec<Event>) -> Result<Value> {
        self.require_state(&[SessionState::Uninitialized])?;
        self.state = SessionState::Initialized;
        events.push(self.event("initialized", Value::Null));
        Ok(serde_json::to_value(capabilities())?)
    }

    async fn handle_set_breakpoints(&mut self, req: &Request) -> Result<Value> {
        let args: SetBreakpointsArguments = serde_json::from_value(req.arguments.clone())?;
        let source_path = args.source.path.clone().unwrap_or_default();
        let specs: Vec<_> = args
            .breakpoints
            .unwrap_or_default()
            .into_iter()
            .map(|b| (b.line, b.condition, b.hit_condition, b.log_message))
            .collect();
        for (_, _, hit_condition, _) in &specs {
            if let Some(hc) = hit_condition {
                HitCondition::parse(hc)?;
            }
        }
        let resolved = self.breakpoints.replace_line_breakpoints(&source_path, &specs);
        if let Some(engine) = &self.engine {
            let engine_specs: Vec<(i64, Option<String>)> =
                specs.iter().map(|(l, c, _, _)| (*l, c.clone())).collect();
            let confirmed = engine.set_line_breakpoints(&source_path, &engine_specs).await?;
            for c in &confirmed {
                if c.verified {
                    if let Some(line) = c.line {
                        if let Some(bp) = resolved.iter().find(|b| b.line == line) {
                            self.breakpoints.mark_resolved(&source_path, bp.id, line);
                        }
                    }
                }
            }
        }
        let out: Vec<Breakpoint> = resolved
            .iter()
            .map(|b| Breakpoint {
                id: Some(b.id),
                verified: b.verified,
                message: None,
                source: Some(args.source.clone()),
                line: Some(b.resolved_line.unwrap_or(b.line)),
                column: None,
            })
            .collect();
        Ok(json!({ "breakpoints": out }))
    }

    async fn handle_set_function_breakpoints(&mut self, req: &Request) -> Result<Value> {
        let args: SetFunctionBreakpointsArguments = serde_json::from_value(req.arguments.clone())?;
        let specs: Vec<_> = args
            .breakpoints
            .into_iter()
            .map(|b| (b.name, b.condition, b.hit_condition))
            .collect();
        let resolved = self.breakpoints.replace_function_breakpoints(&specs);
        if let Some(engine) = &self.engine {
            let engine_specs: Vec<(String, Option<String>)> =
                specs.iter().map(|(n, c, _)| (n.clone(), c.clone())).collect();
            engine.set_function_breakpoints(&engine_specs).await?;
        }
        let out: Vec<Breakpoint> = resolved
            .iter()
            .map(|b| Breakpoint {
                id: Some(b.id),
                verified: true,
                message: None,
                source: None,
                line: None,
                column: None,
            })
            .collect();
        Ok(json!({ "breakpoints": out }))
    }

    async fn handle_set_exception_breakpoints(&mut self, req: &Request) -> Result<Value> {
        let args: SetExceptionBreakpointsArguments = serde_json::from_value(req.arguments.clone())?;
        let filters: Vec<_> = args
            .filters
            .iter()
            .filter_map(|f| match f.as_str() {
                "raised" => Some(crate::breakpoints::ExceptionFilter::Raised),
                "uncaught" => Some(crate::breakpoints::ExceptionFilter::Uncaught),
                "userUnhandled" => Some(crate::breakpoints::ExceptionFilter::UserUnhandled),
                _ => None,
            })
            .collect();
        self.breakpoints.set_exception_filters(filters);
        if let Some(engine) = &self.engine {
            engine.set_exception_filters(&args.filters).await?;
        }
        Ok(json!({}))
    }

    /// A data breakpoint whose `data_id` embeds `expr:<denied-token>` under
    /// `strict_expression_watch_policy` is accepted into the store (so the
    /// category still reflects the full requested set, per the replace
    /// invariant) but reported back unverified with a `policy_denied` detail
    /// instead of failing the whole request.
    async fn handle_set_data_breakpoints(&mut self, req: &Request) -> Result<Value> {
        let args: SetDataBreakpointsArguments = serde_json::from_value(req.arguments.clone())?;
        let read_access_supported = self.engine.as_deref().map(|e| e.supports_read_access_watch()).unwrap_or(false);
        let mut warnings = Vec::new();
        let specs: Vec<_> = args
            .breakpoints
            .into_iter()
            .map(|b| {
                let mut access = match b.access_type.as_deref() {
                    Some("read") => AccessType::Read,
                    Some("readWrite") => AccessType::ReadWrite,
                    _ => AccessType::Write,
                };
                if matches!(access, AccessType::Read | AccessType::ReadWrite) && !read_access_supported {
                    warnings.push(format!("downgrading '{}' to write-only: engine has no read-access support", b.data_id));
                    access = AccessType::Write;
                }
                (b.data_id, access, b.condition, b.hit_condition)
            })
            .collect();

        let mut denials: Vec<Option<(String, String)>> = vec![None; specs.len()];
        if self.config.strict_expression_watch_policy {
            for (i, (data_id, _, _, _)) in specs.iter().enumerate() {
                if let Some(expr) = data_id.split("expr:").nth(1) {
                    if let Some(bad) = self.strict_denylist.iter().find(|tok| expr.contains(*tok)) {
                        denials[i] = Some(("policy_denied".into(), bad.to_string()));
                    }
                }
            }
        }

        let resolved = self.breakpoints.replace_data_breakpoints(&specs);
        for (w, denial) in specs.iter().zip(denials.iter()) {
            if denial.is_none() {
                self.watches.register(w.0.clone());
            }
        }
        let out: Vec<Value> = resolved
            .iter()
            .zip(denials.iter())
            .map(|(b, denial)| match denial {
                None => json!({ "id": b.id, "verified": true }),
                Some((code, cause)) => json!({
                    "id": b.id,
                    "verified": false,
                    "message": code,
                    "details": { "errorCode": code, "cause": cause },
                }),
            })
            .collect();
        Ok(json!({ "breakpoints": out, "warnings": warnings }))
    }

    async fn handle_launch(&mut self, req: &Request, events: &mut Vec<Event>) -> Result<Value> {
        self.require_state(&[SessionState::Initialized])?;
        let args: LaunchRequestArguments = serde_json::from_value(req.arguments.clone())
            .unwrap_or_default();
        self.config.apply_launch_args(&args);
        self.config
            .validate()
            .map_err(AdapterError::Configuration)?;

        self.state = SessionState::Configuring;

        if let Some(launcher) = self.config.debuggee_launcher.clone() {
            let launch_exe = launcher.to_string_lossy().into_owned();
            let (launch, conn) = crate::lifecycle::spawn_external(&self.config, &launch_exe).await?;
            self.external_launch = Some(launch);
            self.attach_external_connection(conn);
        } else {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            self.engine = Some(Box::new(InProcessEngine::new(tx)));
            // Drain any synchronous startup events (there are none yet for the
            // in-process default, but the channel exists for parity with the
            // external backend's event pump).
            while rx.try_recv().is_ok() {}
        }

        events.push(self.event(
            "process",
            serde_json::to_value(ProcessEventBody {
                name: self.config.program.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
                system_process_id: Some(std::process::id() as i64),
                start_method: Some("launch".into()),
            })?,
        ));
        Ok(json!({}))
    }

    async fn handle_configuration_done(&mut self, events: &mut Vec<Event>) -> Result<Value> {
        self.require_state(&[SessionState::Configuring])?;
        if self.config.stop_on_entry {
            self.state = SessionState::Stopped;
            events.push(self.event(
                "stopped",
                serde_json::to_value(StoppedEventBody {
                    reason: "entry".into(),
                    description: None,
                    thread_id: Some(1),
                    hit_breakpoint_ids: None,
                    all_threads_stopped: Some(true),
                })?,
            ));
        } else {
            self.state = SessionState::Running;
        }
        Ok(json!({}))
    }

    async fn handle_continue(&mut self, req: &Request) -> Result<Value> {
        self.require_state(&[SessionState::Stopped])?;
        let thread_id = req.arguments.get("threadId").and_then(Value::as_i64).unwrap_or(1);
        self.engine()?.continue_(Some(thread_id)).await?;
        self.catalog.retire_frame(thread_id);
        self.state = SessionState::Running;
        Ok(json!({ "allThreadsContinued": true }))
    }

    async fn handle_step(&mut self, req: &Request, mode: StepMode) -> Result<Value> {
        self.require_state(&[SessionState::Stopped])?;
        let args: StepArguments = serde_json::from_value(req.arguments.clone())?;
        let granularity = match args.granularity.as_deref() {
            Some("instruction") => Granularity::Instruction,
            Some("line") => Granularity::Line,
            _ => Granularity::Statement,
        };
        let frames = self.engine()?.stack_trace(args.thread_id, 0, 0).await?;
        self.stepper.begin(StepContext {
            thread_id: args.thread_id,
            mode,
            granularity,
            captured_depth: frames.len(),
            captured_identity: frames.first().map(|f| f.name.clone()).unwrap_or_default(),
        });
        self.engine()?.step(args.thread_id, mode, granularity).await?;
        self.state = SessionState::Running;
        Ok(json!({}))
    }

    async fn handle_pause(&mut self, req: &Request) -> Result<Value> {
        self.require_state(&[SessionState::Running])?;
        let thread_id = req.arguments.get("threadId").and_then(Value::as_i64).unwrap_or(1);
        self.engine()?.pause(thread_id).await?;
        Ok(json!({}))
    }

    async fn handle_goto(&mut self, req: &Request) -> Result<Value> {
        self.require_state(&[SessionState::Stopped])?;
        let thread_id = req.arguments.get("threadId").and_then(Value::as_i64).unwrap_or(1);
        let line = req.arguments.get("line").and_then(Value::as_i64).unwrap_or(0);
        self.engine()?.goto(thread_id, line).await?;
        Ok(json!({}))
    }

    async fn handle_threads(&mut self) -> Result<Value> {
        let threads = self.engine()?.threads().await?;
        Ok(json!({ "threads": threads }))
    }

    async fn handle_stack_trace(&mut self, req: &Request) -> Result<Value> {
        self.require_state(&[SessionState::Stopped])?;
        let thread_id = req.arguments.get("threadId").and_then(Value::as_i64).unwrap_or(1);
        let start = req.arguments.get("startFrame").and_then(Value::as_i64).unwrap_or(0);
        let count = req.arguments.get("levels").and_then(Value::as_i64).unwrap_or(0);
        let frames = self.engine()?.stack_trace(thread_id, start, count).await?;
        Ok(json!({ "stackFrames": frames, "totalFrames": frames.len() }))
    }

    async fn handle_scopes(&mut self, req: &Request) -> Result<Value> {
        self.require_state(&[SessionState::Stopped])?;
        let frame_id = req.arguments.get("frameId").and_then(Value::as_i64).unwrap_or(0);
        let scopes = self.engine()?.scopes(frame_id).await?;
        let out: Vec<Scope> = scopes
            .into_iter()
            .map(|s| {
                let named_variables = self.catalog.field_count(s.variables_reference);
                Scope {
                    name: s.name,
                    presentation_hint: None,
                    variables_reference: s.variables_reference,
                    named_variables,
                    indexed_variables: None,
                    expensive: s.expensive,
                }
            })
            .collect();
        Ok(json!({ "scopes": out }))
    }

    async fn handle_variables(&mut self, req: &Request) -> Result<Value> {
        let handle = req.arguments.get("variablesReference").and_then(Value::as_i64).unwrap_or(0);
        if self.catalog.is_valid(handle) {
            return Ok(json!({ "variables": self.catalog.read(handle) }));
        }
        let start = req.arguments.get("start").and_then(Value::as_i64);
        let count = req.arguments.get("count").and_then(Value::as_i64);
        let raw = self.engine()?.variables(handle, start, count).await?;
        Ok(json!({ "variables": raw }))
    }

    async fn handle_set_variable(&mut self, req: &Request) -> Result<Value> {
        let container = req.arguments.get("variablesReference").and_then(Value::as_i64).unwrap_or(0);
        let name = req.arguments.get("name").and_then(Value::as_str).unwrap_or_default();
        let value = req.arguments.get("value").and_then(Value::as_str).unwrap_or_default();
        let updated = self.engine()?.set_variable(container, name, value).await?;
        Ok(json!({ "value": updated }))
    }

    async fn handle_set_expression(&mut self, req: &Request) -> Result<Value> {
        let args: SetExpressionArguments = serde_json::from_value(req.arguments.clone())?;
        let updated = self
            .engine()?
            .set_expression(&args.expression, &args.value, args.frame_id)
            .await?;
        Ok(json!({ "value": updated }))
    }

    async fn handle_evaluate(&mut self, req: &Request) -> Result<Value> {
        let expr = req.arguments.get("expression").and_then(Value::as_str).unwrap_or_default();
        let frame_id = req.arguments.get("frameId").and_then(Value::as_i64);
        let context = req.arguments.get("context").and_then(Value::as_str).unwrap_or("repl");
        if self.config.strict_expression_watch_policy && context == "watch" {
            if let Some(bad) = self.strict_denylist.iter().find(|tok| expr.contains(*tok)) {
                return Err(AdapterError::PolicyDenied(format!(
                    "expression '{expr}' contains denied token '{bad}'"
                )));
            }
        }
        let result = self.engine()?.evaluate(expr, frame_id, context).await?;
        Ok(json!({ "result": result, "variablesReference": 0 }))
    }

    async fn handle_exception_info(&mut self, req: &Request) -> Result<Value> {
        let thread_id = req.arguments.get("threadId").and_then(Value::as_i64).unwrap_or(1);
        let info = self.engine()?.exception_info(thread_id).await?;
        Ok(json!({ "exceptionId": info.id, "description": info.description, "breakMode": "unhandled" }))
    }

    async fn handle_disconnect(&mut self, req: &Request) -> Result<Value> {
        let terminate_debuggee = req
            .arguments
            .get("terminateDebuggee")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if let Some(engine) = &self.engine {
            engine.disconnect(terminate_debuggee).await?;
        }
        if terminate_debuggee {
            if let Some(launch) = &mut self.external_launch {
                let _ = launch.child.kill().await;
            }
        }
        self.state = SessionState::Terminated;
        Ok(json!({}))
    }

    async fn handle_terminate(&mut self) -> Result<Value> {
        if let Some(engine) = &self.engine {
            engine.disconnect(true).await?;
        }
        if let Some(launch) = &mut self.external_launch {
            let _ = launch.child.kill().await;
        }
        self.state = SessionState::Terminated;
        Ok(json!({}))
    }

    async fn handle_restart(&mut self, events: &mut Vec<Event>) -> Result<Value> {
        if let Some(engine) = &self.engine {
            engine.disconnect(true).await?;
        }
        self.state = SessionState::Configuring;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        self.engine = Some(Box::new(InProcessEngine::new(tx)));
        while rx.try_recv().is_ok() {}
        events.push(self.event("process", json!({ "name": "restarted", "startMethod": "launch" })));
        Ok(json!({}))
    }

    async fn handle_hot_reload(&mut self, req: &Request, events: &mut Vec<Event>) -> Result<Value> {
        self.require_state(&[SessionState::Stopped])?;
        let args: HotReloadArguments = serde_json::from_value(req.arguments.clone())?;
        let opts = crate::hot_reload::HotReloadOptions {
            invalidate_bytecode_cache: args.invalidate_bytecode_cache.unwrap_or(true),
            update_frame_code: args.update_frame_code.unwrap_or(false),
        };
        let outcome =
            crate::hot_reload::reload(self.engine()?, &self.breakpoints, &args.source_path, &opts).await?;
        if outcome.source_changed {
            events.push(self.event(
                "loadedSource",
                json!({ "reason": "changed", "source": { "path": args.source_path } }),
            ));
        }
        events.push(self.event("hot_reload_result", serde_json::to_value(&outcome.result)?));
        Ok(serde_json::to_value(outcome.result)?)
    }

    /// Folds an asynchronous engine event into session state, producing the
    /// DAP event(s) to forward to the client. Called by the owning runtime's
    /// event pump whenever the engine posts through the cross-context
    /// channel (SPEC_FULL.md §5).
    pub async fn apply_engine_event(&mut self, evt: EngineEvent) -> Vec<Event> {
        match evt {
            EngineEvent::Stopped { thread_id, reason, hit_breakpoint_ids, description } => {
                self.stop(thread_id, &reason, hit_breakpoint_ids, description)
            }
            EngineEvent::Continued { thread_id } => {
                self.state = SessionState::Running;
                self.catalog.retire_frame(thread_id);
                vec![self.event("continued", json!({ "threadId": thread_id, "allThreadsContinued": true }))]
            }
            EngineEvent::Output { category, text } => {
                vec![self.event("output", json!({ "category": category, "output": text }))]
            }
            EngineEvent::Exited { exit_code } => {
                vec![self.event("exited", json!({ "exitCode": exit_code }))]
            }
            EngineEvent::Thread { started, thread_id, name } => {
                vec![self.event(
                    "thread",
                    json!({ "reason": if started { "started" } else { "exited" }, "threadId": thread_id, "name": name }),
                )]
            }
            EngineEvent::ModuleLoaded { name, path } => {
                vec![self.event("module", json!({ "reason": "new", "module": { "id": name, "path": path } }))]
            }
            EngineEvent::LoadedSource { reason, source } => {
                vec![self.event("loadedSource", json!({ "reason": reason, "source": source }))]
            }
            EngineEvent::Process { name, pid, start_method } => {
                vec![self.event("process", json!({ "name": name, "systemProcessId": pid, "startMethod": start_method }))]
            }
            EngineEvent::ChildProcess { pid, endpoint, parent_pid } => {
                if !self.config.subprocess_auto_attach {
                    return vec![];
                }
                vec![self.event(
                    "dapper/child_process",
                    serde_json::to_value(crate::lifecycle::child_process_event(
                        pid,
                        endpoint,
                        parent_pid,
                        self.config.session_id.clone(),
                    ))
                    .unwrap_or(Value::Null),
                )]
            }
            EngineEvent::LineReached {
                thread_id,
                source_path,
                line,
                frame_depth,
                frame_identity,
                qualified_frame_name,
            } => {
                if self.stepper.is_async_internal(&qualified_frame_name) {
                    return vec![];
                }
                if let Some(bp) = self.breakpoints.lookup_line(&source_path, line) {
                    let id = bp.id;
                    let log_message = bp.log_message.clone();
                    match self.breakpoints.register_line_hit(&source_path, id) {
                        Ok(true) => {
                            return self.stop(thread_id, "breakpoint", vec![id], None);
                        }
                        Ok(false) => {
                            if let Some(template) = log_message {
                                let formatted = self.substitute_log_message(&template).await;
                                return vec![self.event(
                                    "output",
                                    json!({ "category": "console", "output": formatted }),
                                )];
                            }
                            return vec![];
                        }
                        Err(e) => {
                            return vec![self.event(
                                "output",
                                json!({ "category": "stderr", "output": e.to_string() }),
                            )];
                        }
                    }
                }
                if self
                    .stepper
                    .should_stop(thread_id, frame_depth, &frame_identity, &qualified_frame_name)
                {
                    return self.stop(thread_id, "step", vec![], None);
                }
                vec![]
            }
            EngineEvent::ExceptionRaised { thread_id, source_path } => {
                let raised_active = self
                    .breakpoints
                    .exception_filter_active(crate::breakpoints::ExceptionFilter::Raised);
                let uncaught_active = self
                    .breakpoints
                    .exception_filter_active(crate::breakpoints::ExceptionFilter::Uncaught);
                let user_unhandled_active = self
                    .breakpoints
                    .exception_filter_active(crate::breakpoints::ExceptionFilter::UserUnhandled);
                let raised_in_user_code =
                    crate::stepper::is_user_code(&source_path, &self.config.library_install_roots);
                if self.exceptions.on_raise(
                    thread_id,
                    raised_active,
                    uncaught_active,
                    user_unhandled_active,
                    raised_in_user_code,
                ) {
                    return self.stop(thread_id, "exception", vec![], Some("exception raised".into()));
                }
                vec![]
            }
            EngineEvent::ExceptionHandled { thread_id } => {
                self.exceptions.on_handled(thread_id);
                vec![]
            }
            EngineEvent::ExceptionUnwindPastUserCode { thread_id } => {
                if self.exceptions.on_unwind_past_user_code(thread_id) {
                    return self.stop(thread_id, "exception", vec![], Some("uncaught exception".into()));
                }
                vec![]
            }
            EngineEvent::WatchObserved { thread_id, data_id, value } => {
                if self.watches.observe(&data_id, &value) {
                    return self.stop(thread_id, "data breakpoint", vec![], Some(data_id));
                }
                vec![]
            }
        }
    }

    /// Substitutes `{expression}` placeholders in a log-point template by
    /// evaluating each one through the attached engine. A placeholder whose
    /// evaluation fails is left in the output verbatim with an inline error
    /// marker rather than aborting the whole message.
    async fn substitute_log_message(&self, template: &str) -> String {
        let mut out = String::new();
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after_brace = &rest[start + 1..];
            let Some(end) = after_brace.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let expr = &after_brace[..end];
            let evaluated = match self.engine() {
                Ok(engine) => engine.evaluate(expr, None, "repl").await,
                Err(e) => Err(e),
            };
            match evaluated {
                Ok(value) => out.push_str(&value),
                Err(e) => out.push_str(&format!("{{{expr}}} <error: {e}>")),
            }
            rest = &after_brace[end + 1..];
        }
        out.push_str(rest);
        out
    }

    fn stop(
        &mut self,
        thread_id: i64,
        reason: &str,
        hit_breakpoint_ids: Vec<i64>,
        description: Option<String>,
    ) -> Vec<Event> {
        self.state = SessionState::Stopped;
        self.stepper.clear(thread_id);
        vec![self.event(
            "stopped",
            json!({
                "reason": reason,
                "description": description,
                "threadId": thread_id,
                "hitBreakpointIds": hit_breakpoint_ids,
                "allThreadsStopped": true,
            }),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(seq: i64, command: &str, args: Value) -> Request {
        Request {
            base: ProtocolMessage { seq, type_: "request".into() },
            command: command.into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn initialize_then_launch_then_configuration_done_stops_on_entry() {
        let mut cfg = Configuration::default();
        cfg.module = Some("pkg.mod".into());
        let mut session = Session::new(cfg);

        let (resp, events) = session.dispatch(req(1, "initialize", json!({}))).await;
        assert!(resp.success);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "initialized");

        let (resp, _) = session
            .dispatch(req(2, "launch", json!({ "stopOnEntry": true })))
            .await;
        assert!(resp.success, "{resp:?}");
        assert_eq!(session.state, SessionState::Configuring);

        let (resp, events) = session.dispatch(req(3, "configurationDone", json!({}))).await;
        assert!(resp.success);
        assert_eq!(session.state, SessionState::Stopped);
        assert_eq!(events[0].event, "stopped");
    }

    #[tokio::test]
    async fn forbidden_state_returns_protocol_error_without_mutating_state() {
        let mut session = Session::new(Configuration::default());
        let (resp, _) = session.dispatch(req(1, "continue", json!({}))).await;
        assert!(!resp.success);
        assert_eq!(session.state, SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn continue_retires_frame_handles_for_that_thread() {
        let mut cfg = Configuration::default();
        cfg.module = Some("pkg.mod".into());
        let mut session = Session::new(cfg);
        session.dispatch(req(1, "initialize", json!({}))).await;
        session.dispatch(req(2, "launch", json!({}))).await;
        session.dispatch(req(3, "configurationDone", json!({}))).await;
        session.state = SessionState::Stopped;
        let handle = session.catalog.allocate_container(1, Box::new(tests_support::EmptyProvider));
        assert!(session.catalog.is_valid(handle));
        let (resp, _) = session.dispatch(req(4, "continue", json!({ "threadId": 1 }))).await;
        assert!(resp.success);
        assert!(!session.catalog.is_valid(handle));
    }

    #[tokio::test]
    async fn strict_policy_denies_dangerous_watch_expression() {
        let mut cfg = Configuration::default();
        cfg.module = Some("pkg.mod".into());
        cfg.strict_expression_watch_policy = true;
        let mut session = Session::new(cfg);
        session.dispatch(req(1, "initialize", json!({}))).await;
        session.dispatch(req(2, "launch", json!({}))).await;
        session.dispatch(req(3, "configurationDone", json!({}))).await;
        session.state = SessionState::Stopped;
        let (resp, _) = session
            .dispatch(req(4, "evaluate", json!({ "expression": "import os", "context": "watch" })))
            .await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn set_expression_round_trips_through_the_attached_engine() {
        let mut cfg = Configuration::default();
        cfg.module = Some("pkg.mod".into());
        let mut session = Session::new(cfg);
        session.dispatch(req(1, "initialize", json!({}))).await;
        session.dispatch(req(2, "launch", json!({}))).await;
        session.dispatch(req(3, "configurationDone", json!({}))).await;
        session.state = SessionState::Stopped;
        let (resp, _) = session
            .dispatch(req(4, "setExpression", json!({ "expression": "counter", "value": "5" })))
            .await;
        assert!(resp.success, "{resp:?}");
        assert_eq!(resp.body["value"], json!("5"));
    }

    #[tokio::test]
    async fn attach_external_connection_swaps_in_the_external_engine_backend() {
        let mut cfg = Configuration::default();
        cfg.module = Some("pkg.mod".into());
        let mut session = Session::new(cfg);
        assert!(session.engine.is_none());

        let (a, _b) = tokio::net::UnixStream::pair().unwrap();
        session.attach_external_connection(Connection::Unix(a));
        assert!(session.engine.is_some());
    }

    #[tokio::test]
    async fn disconnect_in_process_does_not_panic_and_terminates_state() {
        let mut cfg = Configuration::default();
        cfg.module = Some("pkg.mod".into());
        let mut session = Session::new(cfg);
        session.dispatch(req(1, "initialize", json!({}))).await;
        session.dispatch(req(2, "launch", json!({}))).await;
        let (resp, _) = session.dispatch(req(3, "disconnect", json!({}))).await;
        assert!(resp.success);
        assert_eq!(session.state, SessionState::Terminated);
    }
}

#[cfg(test)]
mod tests_support {
    use crate::catalog::{ContainerProvider, Field};

    pub struct EmptyProvider;
    impl ContainerProvider for EmptyProvider {
        fn fields(&self) -> Vec<Field> {
            vec![]
        }
    }
}
