//! Stop/Step Coordinator (C8).
//!
//! Owns step-mode semantics, the async-aware frame filter, exception
//! Raised/Handled/Unwinding/Break tracking, and watchpoint snapshot-compare.
//! Grounded conceptually on `db-backend::task::{Action, StepArg}` and
//! `dap_server::dap_command_to_step_action` for the over/in/out/continue
//! shape; the async filter and watchpoint machinery have no literal corpus
//! precedent and are built directly from SPEC_FULL.md §4.8.

use crate::engine::{Granularity, StepMode};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct StepContext {
    pub thread_id: i64,
    pub mode: StepMode,
    pub granularity: Granularity,
    pub captured_depth: usize,
    pub captured_identity: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionState {
    Raised,
    Handled,
    Unwinding,
    Break,
}

pub struct ExceptionTracker {
    /// Buffered uncaught-candidate exceptions per thread, cleared when a
    /// matching `handled` event arrives before unwind reaches user code.
    buffered: HashMap<i64, ExceptionState>,
}

impl Default for ExceptionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionTracker {
    pub fn new() -> Self {
        Self {
            buffered: HashMap::new(),
        }
    }

    /// `user_unhandled_filter_active`/`raised_in_user_code` implement the
    /// `userUnhandled` filter's "user code" predicate: it behaves like
    /// `uncaught` (buffer, then break only once unwind passes all user code)
    /// but only for exceptions that were actually raised from user source.
    pub fn on_raise(
        &mut self,
        thread_id: i64,
        raised_filter_active: bool,
        uncaught_filter_active: bool,
        user_unhandled_filter_active: bool,
        raised_in_user_code: bool,
    ) -> bool {
        if raised_filter_active {
            self.buffered.insert(thread_id, ExceptionState::Break);
            return true;
        }
        if uncaught_filter_active || (user_unhandled_filter_active && raised_in_user_code) {
            self.buffered.insert(thread_id, ExceptionState::Raised);
        }
        false
    }

    pub fn on_handled(&mut self, thread_id: i64) {
        if self.buffered.get(&thread_id) == Some(&ExceptionState::Raised) {
            self.buffered.remove(&thread_id);
        }
    }

    /// Called when unwind passes the outermost user-code frame while a
    /// buffered exception is still pending. Returns `true` if the coordinator
    /// should emit `stopped(reason=exception)`.
    pub fn on_unwind_past_user_code(&mut self, thread_id: i64) -> bool {
        if self.buffered.remove(&thread_id) == Some(ExceptionState::Raised) {
            self.buffered.insert(thread_id, ExceptionState::Break);
            true
        } else {
            false
        }
    }

    pub fn state(&self, thread_id: i64) -> Option<ExceptionState> {
        self.buffered.get(&thread_id).copied()
    }
}

/// Tests whether `source_path` lies outside every configured library install
/// root, i.e. is code the user themselves wrote rather than a dependency or
/// the standard library. Feeds the `userUnhandled` exception filter.
pub fn is_user_code(source_path: &str, library_install_roots: &[String]) -> bool {
    !library_install_roots
        .iter()
        .any(|root| source_path.starts_with(root.as_str()))
}

/// Decides, for a single line/call/return event, whether the active step
/// should keep running or stop, applying the async-frame filter first.
pub struct StepCoordinator {
    active: HashMap<i64, StepContext>,
    async_internal_prefixes: Vec<String>,
}

impl StepCoordinator {
    pub fn new(async_internal_prefixes: Vec<String>) -> Self {
        Self {
            active: HashMap::new(),
            async_internal_prefixes,
        }
    }

    pub fn begin(&mut self, ctx: StepContext) {
        self.active.insert(ctx.thread_id, ctx);
    }

    pub fn clear(&mut self, thread_id: i64) {
        self.active.remove(&thread_id);
    }

    pub fn is_async_internal(&self, qualified_frame_name: &str) -> bool {
        self.async_internal_prefixes
            .iter()
            .any(|p| qualified_frame_name.starts_with(p.as_str()))
    }

    /// Evaluates a single stepping event. `frame_identity`/`frame_depth`
    /// describe the frame the interpreter is currently paused in;
    /// `qualified_frame_name` feeds the async filter.
    pub fn should_stop(
        &self,
        thread_id: i64,
        frame_depth: usize,
        frame_identity: &str,
        qualified_frame_name: &str,
    ) -> bool {
        if self.is_async_internal(qualified_frame_name) {
            return false;
        }
        let Some(ctx) = self.active.get(&thread_id) else {
            return false;
        };
        match ctx.mode {
            StepMode::Over => {
                frame_depth < ctx.captured_depth
                    || (frame_depth == ctx.captured_depth && frame_identity == ctx.captured_identity)
            }
            StepMode::In => true,
            StepMode::Out => frame_depth < ctx.captured_depth,
        }
    }
}

/// Watchpoint snapshot-compare state for a single watch (variable or
/// expression) attached to a frame.
pub struct Watch {
    pub data_id: String,
    pub last_value: Option<String>,
}

pub struct WatchTracker {
    watches: Vec<Watch>,
}

impl Default for WatchTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchTracker {
    pub fn new() -> Self {
        Self { watches: Vec::new() }
    }

    pub fn register(&mut self, data_id: String) {
        self.watches.push(Watch { data_id, last_value: None });
    }

    pub fn unregister(&mut self, data_id: &str) {
        self.watches.retain(|w| w.data_id != data_id);
    }

    /// Feeds a freshly evaluated value for `data_id`; returns `true` exactly
    /// when the value changed since the last observation. The snapshot is
    /// updated unconditionally so re-entry to the same line does not re-fire.
    pub fn observe(&mut self, data_id: &str, current_value: &str) -> bool {
        if let Some(w) = self.watches.iter_mut().find(|w| w.data_id == data_id) {
            let changed = w.last_value.as_deref() != Some(current_value);
            w.last_value = Some(current_value.to_string());
            changed
        } else {
            false
        }
    }
}
