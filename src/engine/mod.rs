//! Engine Interface & Backends (C6).
//!
//! `Engine` is the abstract contract the core drives; two backends implement
//! it (`ExternalEngine` over C1/C2/C3, `InProcessEngine` over direct calls).
//! Grounded on `db-backend::communication::Comm`'s `?Send` async-trait shape.

pub mod external;
pub mod in_process;

use crate::dap_types::{Source, StackFrame, Thread};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Over,
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Statement,
    Line,
    Instruction,
}

#[derive(Debug, Clone)]
pub struct ResolvedBreakpoint {
    pub id: i64,
    pub verified: bool,
    pub line: Option<i64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScopeInfo {
    pub name: String,
    pub variables_reference: i64,
    pub expensive: bool,
}

#[derive(Debug, Clone)]
pub struct ExceptionDetails {
    pub id: String,
    pub description: String,
    pub stack_trace: Option<String>,
}

/// Events the engine pushes to the core asynchronously, outside the
/// request/response cycle.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Stopped {
        thread_id: i64,
        reason: String,
        hit_breakpoint_ids: Vec<i64>,
        description: Option<String>,
    },
    Continued {
        thread_id: i64,
    },
    Thread {
        started: bool,
        thread_id: i64,
        name: Option<String>,
    },
    Output {
        category: String,
        text: String,
    },
    Exited {
        exit_code: i64,
    },
    ModuleLoaded {
        name: String,
        path: Option<String>,
    },
    LoadedSource {
        reason: String,
        source: Source,
    },
    Process {
        name: String,
        pid: Option<i64>,
        start_method: String,
    },
    ChildProcess {
        pid: i64,
        endpoint: String,
        parent_pid: i64,
    },
    /// Raw per-line trace callback. The core — not the engine — decides
    /// whether this warrants a stop, by consulting the breakpoint store and
    /// step coordinator (SPEC_FULL.md §4.8). `condition` expression
    /// evaluation, if any, has already happened engine-side since it
    /// requires evaluating target-language code.
    LineReached {
        thread_id: i64,
        source_path: String,
        line: i64,
        frame_depth: usize,
        frame_identity: String,
        qualified_frame_name: String,
    },
    ExceptionRaised {
        thread_id: i64,
        /// Source of the frame the exception was raised in, consulted by the
        /// `userUnhandled` filter's "user code" predicate.
        source_path: String,
    },
    ExceptionHandled {
        thread_id: i64,
    },
    ExceptionUnwindPastUserCode {
        thread_id: i64,
    },
    /// A watched data id's current value as observed at this line; the core
    /// compares it against the last snapshot to decide whether to stop.
    WatchObserved {
        thread_id: i64,
        data_id: String,
        value: String,
    },
}

/// Abstract debug-engine contract. All methods are cancel-safe: a future that
/// is dropped before completing must leave the engine in a consistent state.
#[async_trait(?Send)]
pub trait Engine {
    async fn set_line_breakpoints(
        &self,
        source_path: &str,
        specs: &[(i64, Option<String>)],
    ) -> Result<Vec<ResolvedBreakpoint>>;

    async fn set_function_breakpoints(
        &self,
        specs: &[(String, Option<String>)],
    ) -> Result<Vec<ResolvedBreakpoint>>;

    async fn set_exception_filters(&self, filters: &[String]) -> Result<()>;

    async fn continue_(&self, thread_id: Option<i64>) -> Result<()>;

    async fn pause(&self, thread_id: i64) -> Result<()>;

    async fn step(&self, thread_id: i64, mode: StepMode, granularity: Granularity) -> Result<()>;

    async fn goto(&self, thread_id: i64, line: i64) -> Result<()>;

    async fn threads(&self) -> Result<Vec<Thread>>;

    async fn stack_trace(&self, thread_id: i64, start: i64, count: i64) -> Result<Vec<StackFrame>>;

    async fn scopes(&self, frame_id: i64) -> Result<Vec<ScopeInfo>>;

    async fn variables(&self, handle: i64, start: Option<i64>, count: Option<i64>) -> Result<Value>;

    async fn set_variable(&self, container: i64, name: &str, value: &str) -> Result<String>;

    async fn evaluate(&self, expr: &str, frame_id: Option<i64>, context: &str) -> Result<String>;

    /// Assigns `value` to the (possibly compound) expression `expr` in the
    /// given frame, returning the engine's canonical rendering of the new
    /// value. Optional per SPEC_FULL.md §4.6; backends that cannot support it
    /// should also report `false` from `supports_set_expression`.
    async fn set_expression(&self, expr: &str, value: &str, frame_id: Option<i64>) -> Result<String> {
        let _ = (expr, value, frame_id);
        Err(crate::error::AdapterError::Protocol(
            "setExpression not supported by this engine".into(),
        ))
    }

    async fn exception_info(&self, thread_id: i64) -> Result<ExceptionDetails>;

    async fn reload_module(&self, source_path: &str) -> Result<Value>;

    async fn disconnect(&self, terminate_debuggee: bool) -> Result<()>;

    /// Whether this backend can honor `set_expression` beyond the trait's
    /// default `Err` body.
    fn supports_set_expression(&self) -> bool {
        false
    }

    /// Whether this backend can honor read/read-write data breakpoints.
    fn supports_read_access_watch(&self) -> bool {
        false
    }
}
