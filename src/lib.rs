//! Core coordination layer for a Debug Adapter Protocol server fronting a
//! dynamic interpreted-language debugger: wire framing, request/response
//! correlation, breakpoint and variable bookkeeping, the step coordinator,
//! and the session state machine that ties them together. The concrete
//! debuggee backend (external process or in-process interpreter) lives
//! behind the `Engine` trait in `engine`.

pub mod breakpoints;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod dap_types;
pub mod engine;
pub mod error;
pub mod hot_reload;
pub mod lifecycle;
pub mod logging;
pub mod session;
pub mod stepper;
pub mod transport;

pub use error::{AdapterError, Result};
