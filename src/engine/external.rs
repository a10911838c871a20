//! External engine backend: encodes each `Engine` call as a C1 command,
//! registers a pending request in the Correlation Registry, writes it
//! through the Transport Multiplexer, and awaits the matched response.
//! Grounded on `db-backend::dap_server`'s `launch`/`write_dap_messages` flow.

use super::{Engine, ExceptionDetails, Granularity, ResolvedBreakpoint, ScopeInfo, StepMode};
use crate::codec::FrameKind;
use crate::correlation::CorrelationRegistry;
use crate::dap_types::{StackFrame, Thread};
use crate::error::{AdapterError, Result};
use crate::transport::Multiplexer;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

pub struct ExternalEngine {
    mux: Multiplexer,
    registry: CorrelationRegistry,
    grace: Duration,
    supports_set_expression: bool,
    supports_read_access_watch: bool,
}

impl ExternalEngine {
    pub fn new(mux: Multiplexer, grace: Duration) -> Self {
        Self {
            mux,
            registry: CorrelationRegistry::new(),
            grace,
            supports_set_expression: false,
            supports_read_access_watch: false,
        }
    }

    pub fn negotiate_capabilities(&mut self, set_expression: bool, read_access_watch: bool) {
        self.supports_set_expression = set_expression;
        self.supports_read_access_watch = read_access_watch;
    }

    /// Sends `command` and awaits its matched response within the per-session
    /// grace window.
    async fn call(&self, command: &str, args: Value) -> Result<Value> {
        let (id, rx) = self
            .registry
            .register()
            .ok_or_else(|| AdapterError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "engine connection shut down",
            )))?;
        let envelope = json!({ "id": id, "command": command, "args": args });
        self.mux.send(FrameKind::Command, &envelope).await?;
        self.registry
            .await_completion(id, rx, Some(self.grace))
            .await
    }

    /// Feeds a decoded response frame back into the registry. Called by the
    /// session's event-pump loop as frames arrive from the reader task.
    pub fn complete_from_response(&self, id: i64, payload: Value) {
        self.registry.complete(id, payload);
    }

    pub fn fail_pending(&self, id: i64, err: AdapterError) {
        self.registry.fail(id, err);
    }

    /// Invoked on disconnect/terminate: fails every outstanding call exactly
    /// once rather than leaving callers waiting on a dead connection.
    pub fn shutdown(&self) {
        self.registry.shutdown(|| {
            AdapterError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "engine connection closed",
            ))
        });
    }

    pub async fn recv_frame(&mut self) -> Option<Result<crate::codec::Frame>> {
        self.mux.recv().await
    }
}

#[async_trait(?Send)]
impl Engine for ExternalEngine {
    async fn set_line_breakpoints(
        &self,
        source_path: &str,
        specs: &[(i64, Option<String>)],
    ) -> Result<Vec<ResolvedBreakpoint>> {
        let resp = self
            .call("setLineBreakpoints", json!({ "source": source_path, "specs": specs }))
            .await?;
        parse_resolved(resp)
    }

    async fn set_function_breakpoints(
        &self,
        specs: &[(String, Option<String>)],
    ) -> Result<Vec<ResolvedBreakpoint>> {
        let resp = self
            .call("setFunctionBreakpoints", json!({ "specs": specs }))
            .await?;
        parse_resolved(resp)
    }

    async fn set_exception_filters(&self, filters: &[String]) -> Result<()> {
        self.call("setExceptionFilters", json!({ "filters": filters }))
            .await?;
        Ok(())
    }

    async fn continue_(&self, thread_id: Option<i64>) -> Result<()> {
        self.call("continue", json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    async fn pause(&self, thread_id: i64) -> Result<()> {
        self.call("pause", json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    async fn step(&self, thread_id: i64, mode: StepMode, granularity: Granularity) -> Result<()> {
        let mode_str = match mode {
            StepMode::Over => "over",
            StepMode::In => "in",
            StepMode::Out => "out",
        };
        let gran_str = match granularity {
            Granularity::Statement => "statement",
            Granularity::Line => "line",
            Granularity::Instruction => "instruction",
        };
        self.call(
            "step",
            json!({ "threadId": thread_id, "mode": mode_str, "granularity": gran_str }),
        )
        .await?;
        Ok(())
    }

    async fn goto(&self, thread_id: i64, line: i64) -> Result<()> {
        self.call("goto", json!({ "threadId": thread_id, "line": line }))
            .await?;
        Ok(())
    }

    async fn threads(&self) -> Result<Vec<Thread>> {
        let resp = self.call("threads", json!({})).await?;
        Ok(serde_json::from_value(resp)?)
    }

    async fn stack_trace(&self, thread_id: i64, start: i64, count: i64) -> Result<Vec<StackFrame>> {
        let resp = self
            .call("stackTrace", json!({ "threadId": thread_id, "start": start, "count": count }))
            .await?;
        Ok(serde_json::from_value(resp)?)
    }

    async fn scopes(&self, frame_id: i64) -> Result<Vec<ScopeInfo>> {
        let resp = self.call("scopes", json!({ "frameId": frame_id })).await?;
        let raw: Vec<Value> = serde_json::from_value(resp)?;
        Ok(raw
            .into_iter()
            .filter_map(|v| {
                Some(ScopeInfo {
                    name: v.get("name")?.as_str()?.to_string(),
                    variables_reference: v.get("variablesReference")?.as_i64()?,
                    expensive: v.get("expensive").and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect())
    }

    async fn variables(&self, handle: i64, start: Option<i64>, count: Option<i64>) -> Result<Value> {
        self.call("variables", json!({ "handle": handle, "start": start, "count": count }))
            .await
    }

    async fn set_variable(&self, container: i64, name: &str, value: &str) -> Result<String> {
        let resp = self
            .call("setVariable", json!({ "container": container, "name": name, "value": value }))
            .await?;
        Ok(resp.get("value").and_then(Value::as_str).unwrap_or_default().to_string())
    }

    async fn evaluate(&self, expr: &str, frame_id: Option<i64>, context: &str) -> Result<String> {
        let resp = self
            .call("evaluate", json!({ "expr": expr, "frameId": frame_id, "context": context }))
            .await?;
        Ok(resp.get("result").and_then(Value::as_str).unwrap_or_default().to_string())
    }

    async fn set_expression(&self, expr: &str, value: &str, frame_id: Option<i64>) -> Result<String> {
        let resp = self
            .call("setExpression", json!({ "expr": expr, "value": value, "frameId": frame_id }))
            .await?;
        Ok(resp.get("value").and_then(Value::as_str).unwrap_or_default().to_string())
    }

    async fn exception_info(&self, thread_id: i64) -> Result<ExceptionDetails> {
        let resp = self
            .call("exceptionInfo", json!({ "threadId": thread_id }))
            .await?;
        Ok(ExceptionDetails {
            id: resp.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            description: resp
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            stack_trace: resp.get("stackTrace").and_then(Value::as_str).map(str::to_string),
        })
    }

    async fn reload_module(&self, source_path: &str) -> Result<Value> {
        self.call("reloadModule", json!({ "sourcePath": source_path })).await
    }

    async fn disconnect(&self, terminate_debuggee: bool) -> Result<()> {
        let _ = self
            .call("disconnect", json!({ "terminateDebuggee": terminate_debuggee }))
            .await;
        self.shutdown();
        Ok(())
    }

    fn supports_set_expression(&self) -> bool {
        self.supports_set_expression
    }

    fn supports_read_access_watch(&self) -> bool {
        self.supports_read_access_watch
    }
}

fn parse_resolved(resp: Value) -> Result<Vec<ResolvedBreakpoint>> {
    let raw: Vec<Value> = serde_json::from_value(resp)?;
    Ok(raw
        .into_iter()
        .filter_map(|v| {
            Some(ResolvedBreakpoint {
                id: v.get("id")?.as_i64()?,
                verified: v.get("verified").and_then(Value::as_bool).unwrap_or(false),
                line: v.get("line").and_then(Value::as_i64),
                message: v.get("message").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect())
}
