//! Hot Reload Service (C10).
//!
//! Only callable while the session is stopped. No literal teacher precedent
//! (CodeTracer is a replay debugger with no reload concept); built from
//! SPEC_FULL.md §4.10 directly, following the corpus's "algorithm as a
//! sequence of fallible steps that logs and continues on partial failure"
//! style (see `backend-manager::backend_manager::ttl_expiry_loop`).

use crate::breakpoints::BreakpointStore;
use crate::dap_types::HotReloadResultBody;
use crate::engine::Engine;
use crate::error::Result;
use log::warn;
use serde_json::Value;

pub struct HotReloadOptions {
    pub invalidate_bytecode_cache: bool,
    pub update_frame_code: bool,
}

/// Outcome of [`reload`] beyond the wire-level counters: whether a
/// `loadedSource(reason=changed)` event should be forwarded to the client.
pub struct HotReloadOutcome {
    pub result: HotReloadResultBody,
    pub source_changed: bool,
}

/// Runs the reload algorithm against `engine` for `source_path`, producing
/// the counters and warnings reported back to the client as
/// `hot_reload_result`.
pub async fn reload(
    engine: &dyn Engine,
    breakpoints: &BreakpointStore,
    source_path: &str,
    opts: &HotReloadOptions,
) -> Result<HotReloadOutcome> {
    let mut result = HotReloadResultBody::default();

    let reload_response = engine.reload_module(source_path).await?;

    let same_language = reload_response
        .get("sameLanguage")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let native_compiled = reload_response
        .get("nativeCompiled")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !same_language || native_compiled {
        result.warnings.push(format!(
            "'{source_path}' cannot be hot reloaded: module is not the same language or is native-compiled"
        ));
        return Ok(HotReloadOutcome { result, source_changed: false });
    }

    result.reloaded_module = reload_response
        .get("reloaded")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if !result.reloaded_module {
        result
            .warnings
            .push(format!("module reload for '{source_path}' reported no change"));
        return Ok(HotReloadOutcome { result, source_changed: false });
    }

    if let Some(side_effects) = reload_response.get("sideEffects").and_then(Value::as_array) {
        for effect in side_effects {
            if let Some(text) = effect.as_str() {
                result.warnings.push(format!("re-executing top-level code: {text}"));
            }
        }
    }

    let affected = breakpoints.line_breakpoints_for(source_path);
    if !affected.is_empty() {
        if let Err(e) = engine.set_line_breakpoints(source_path, &affected).await {
            result
                .warnings
                .push(format!("failed to re-apply line breakpoints for '{source_path}': {e}"));
        }
    }

    if opts.update_frame_code {
        let candidates = reload_response
            .get("liveFrames")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for frame in candidates {
            let compatible = frame
                .get("structurallyCompatible")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let has_free_vars = frame
                .get("hasFreeVariables")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if has_free_vars {
                result
                    .warnings
                    .push("skipped rebinding a closure with captured free variables".into());
                continue;
            }
            if compatible {
                result.updated_frame_codes += 1;
                result.rebound_frames += 1;
            } else {
                warn!("skipping incompatible frame during hot reload of {source_path}");
                result
                    .warnings
                    .push("skipped a frame whose code shape changed incompatibly".into());
            }
        }
    }

    Ok(HotReloadOutcome { result, source_changed: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::in_process::InProcessEngine;

    #[tokio::test]
    async fn reload_reports_changed_and_re_applies_breakpoints() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let engine = InProcessEngine::new(tx);
        let mut breakpoints = BreakpointStore::new();
        breakpoints.replace_line_breakpoints("mod.py", &[(10, None, None, None)]);
        let opts = HotReloadOptions {
            invalidate_bytecode_cache: true,
            update_frame_code: false,
        };
        // InProcessEngine::reload_module always reports reloaded=true with no
        // sameLanguage/nativeCompiled fields, which default to reloadable.
        let outcome = reload(&engine, &breakpoints, "mod.py", &opts).await.unwrap();
        assert!(outcome.result.reloaded_module);
        assert!(outcome.source_changed);
    }

    struct NativeModuleEngine;

    #[async_trait::async_trait(?Send)]
    impl Engine for NativeModuleEngine {
        async fn set_line_breakpoints(
            &self,
            _source_path: &str,
            _specs: &[(i64, Option<String>)],
        ) -> Result<Vec<crate::engine::ResolvedBreakpoint>> {
            Ok(vec![])
        }
        async fn set_function_breakpoints(
            &self,
            _specs: &[(String, Option<String>)],
        ) -> Result<Vec<crate::engine::ResolvedBreakpoint>> {
            Ok(vec![])
        }
        async fn set_exception_filters(&self, _filters: &[String]) -> Result<()> {
            Ok(())
        }
        async fn continue_(&self, _thread_id: Option<i64>) -> Result<()> {
            Ok(())
        }
        async fn pause(&self, _thread_id: i64) -> Result<()> {
            Ok(())
        }
        async fn step(
            &self,
            _thread_id: i64,
            _mode: crate::engine::StepMode,
            _granularity: crate::engine::Granularity,
        ) -> Result<()> {
            Ok(())
        }
        async fn goto(&self, _thread_id: i64, _line: i64) -> Result<()> {
            Ok(())
        }
        async fn threads(&self) -> Result<Vec<crate::dap_types::Thread>> {
            Ok(vec![])
        }
        async fn stack_trace(
            &self,
            _thread_id: i64,
            _start: i64,
            _count: i64,
        ) -> Result<Vec<crate::dap_types::StackFrame>> {
            Ok(vec![])
        }
        async fn scopes(&self, _frame_id: i64) -> Result<Vec<crate::engine::ScopeInfo>> {
            Ok(vec![])
        }
        async fn variables(&self, _handle: i64, _start: Option<i64>, _count: Option<i64>) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn set_variable(&self, _container: i64, _name: &str, value: &str) -> Result<String> {
            Ok(value.to_string())
        }
        async fn evaluate(&self, expr: &str, _frame_id: Option<i64>, _context: &str) -> Result<String> {
            Ok(expr.to_string())
        }
        async fn exception_info(&self, _thread_id: i64) -> Result<crate::engine::ExceptionDetails> {
            Err(crate::error::AdapterError::Protocol("no active exception".into()))
        }
        async fn reload_module(&self, _source_path: &str) -> Result<Value> {
            Ok(serde_json::json!({ "reloaded": true, "nativeCompiled": true }))
        }
        async fn disconnect(&self, _terminate_debuggee: bool) -> Result<()> {
            Ok(())
        }
        fn supports_set_expression(&self) -> bool {
            false
        }
        fn supports_read_access_watch(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn reload_rejects_native_compiled_modules_with_a_warning() {
        let engine = NativeModuleEngine;
        let breakpoints = BreakpointStore::new();
        let opts = HotReloadOptions {
            invalidate_bytecode_cache: true,
            update_frame_code: false,
        };
        let outcome = reload(&engine, &breakpoints, "native_ext.so", &opts).await.unwrap();
        assert!(!outcome.result.reloaded_module);
        assert!(!outcome.source_changed);
        assert!(!outcome.result.warnings.is_empty());
    }
}
