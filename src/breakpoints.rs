//! Breakpoint Store (C4).
//!
//! Category stores (line, function, exception-filter, data/watch, log) with
//! per-scope replace semantics and hit-count persistence keyed on identity.
//! Grounded on `db-backend::handler`'s `set_breakpoints`/`add_breakpoint`/
//! `clear_breakpoints`/`toggle_breakpoint` shape for the replace-by-category
//! contract, and `dap_types::SourceBreakpoint`/`FunctionBreakpoint`/
//! `DataBreakpoint` for the per-spec field layout.

use crate::error::{AdapterError, Result};
use regex::Regex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Write,
    Read,
    ReadWrite,
}

#[derive(Debug, Clone)]
pub struct LineBreakpoint {
    pub id: i64,
    pub source_path: String,
    pub line: i64,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
    pub verified: bool,
    pub resolved_line: Option<i64>,
    pub hit_count: u64,
}

#[derive(Debug, Clone)]
pub struct FunctionBreakpoint {
    pub id: i64,
    pub qualified_name: String,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub hit_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionFilter {
    Raised,
    Uncaught,
    UserUnhandled,
}

#[derive(Debug, Clone)]
pub struct DataBreakpoint {
    pub id: i64,
    pub data_id: String,
    pub access_type: AccessType,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub hit_count: u64,
}

/// Parsed hit-condition grammar: exact N, every Nth (`%N`), or a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCondition {
    Exact(u64),
    EveryNth(u64),
    Ge(u64),
    Gt(u64),
    Eq(u64),
    Lt(u64),
    Le(u64),
}

impl HitCondition {
    pub fn parse(text: &str) -> Result<Self> {
        let t = text.trim();
        let re = Regex::new(r"^(>=|<=|==|>|<)?\s*(\d+)$").expect("static regex is valid");
        let caps = re
            .captures(t)
            .ok_or_else(|| AdapterError::Protocol(format!("invalid hit condition '{text}'")))?;
        let n: u64 = caps[2]
            .parse()
            .map_err(|_| AdapterError::Protocol(format!("invalid hit condition '{text}'")))?;
        if let Some(prefix) = t.strip_prefix('%') {
            let n: u64 = prefix
                .trim()
                .parse()
                .map_err(|_| AdapterError::Protocol(format!("invalid hit condition '{text}'")))?;
            return Ok(HitCondition::EveryNth(n));
        }
        Ok(match caps.get(1).map(|m| m.as_str()) {
            None => HitCondition::Exact(n),
            Some(">=") => HitCondition::Ge(n),
            Some(">") => HitCondition::Gt(n),
            Some("==") => HitCondition::Eq(n),
            Some("<") => HitCondition::Lt(n),
            Some("<=") => HitCondition::Le(n),
            Some(other) => {
                return Err(AdapterError::Protocol(format!("unsupported operator '{other}'")))
            }
        })
    }

    /// Whether a hit at `count` (1-based, post-increment) should stop.
    pub fn matches(&self, count: u64) -> bool {
        match self {
            HitCondition::Exact(n) => count == *n,
            HitCondition::EveryNth(n) => *n > 0 && count % n == 0,
            HitCondition::Ge(n) => count >= *n,
            HitCondition::Gt(n) => count > *n,
            HitCondition::Eq(n) => count == *n,
            HitCondition::Lt(n) => count < *n,
            HitCondition::Le(n) => count <= *n,
        }
    }
}

#[derive(Default)]
pub struct BreakpointStore {
    next_id: i64,
    lines: HashMap<String, Vec<LineBreakpoint>>,
    functions: Vec<FunctionBreakpoint>,
    exception_filters: Vec<ExceptionFilter>,
    data: Vec<DataBreakpoint>,
}

impl BreakpointStore {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    fn alloc_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Replaces the full set of line breakpoints for `source_path`. Hit
    /// counts survive for any `(source, line, condition)` identity present in
    /// both the old and new sets.
    pub fn replace_line_breakpoints(
        &mut self,
        source_path: &str,
        specs: &[(i64, Option<String>, Option<String>, Option<String>)],
    ) -> Vec<LineBreakpoint> {
        let previous = self.lines.remove(source_path).unwrap_or_default();
        let mut result = Vec::with_capacity(specs.len());
        for (line, condition, hit_condition, log_message) in specs {
            let carried_hits = previous
                .iter()
                .find(|bp| bp.line == *line && &bp.condition == condition)
                .map(|bp| bp.hit_count)
                .unwrap_or(0);
            result.push(LineBreakpoint {
                id: self.alloc_id(),
                source_path: source_path.to_string(),
                line: *line,
                condition: condition.clone(),
                hit_condition: hit_condition.clone(),
                log_message: log_message.clone(),
                verified: false,
                resolved_line: None,
                hit_count: carried_hits,
            });
        }
        self.lines.insert(source_path.to_string(), result.clone());
        result
    }

    pub fn mark_resolved(&mut self, source_path: &str, id: i64, resolved_line: i64) {
        if let Some(list) = self.lines.get_mut(source_path) {
            if let Some(bp) = list.iter_mut().find(|bp| bp.id == id) {
                bp.verified = true;
                bp.resolved_line = Some(resolved_line);
            }
        }
    }

    pub fn replace_function_breakpoints(
        &mut self,
        specs: &[(String, Option<String>, Option<String>)],
    ) -> Vec<FunctionBreakpoint> {
        let previous = std::mem::take(&mut self.functions);
        let mut result = Vec::with_capacity(specs.len());
        for (name, condition, hit_condition) in specs {
            let carried = previous
                .iter()
                .find(|bp| &bp.qualified_name == name && &bp.condition == condition)
                .map(|bp| bp.hit_count)
                .unwrap_or(0);
            result.push(FunctionBreakpoint {
                id: self.alloc_id(),
                qualified_name: name.clone(),
                condition: condition.clone(),
                hit_condition: hit_condition.clone(),
                hit_count: carried,
            });
        }
        self.functions = result.clone();
        result
    }

    pub fn set_exception_filters(&mut self, filters: Vec<ExceptionFilter>) {
        self.exception_filters = filters;
    }

    pub fn exception_filter_active(&self, f: ExceptionFilter) -> bool {
        self.exception_filters.contains(&f)
    }

    pub fn replace_data_breakpoints(
        &mut self,
        specs: &[(String, AccessType, Option<String>, Option<String>)],
    ) -> Vec<DataBreakpoint> {
        let previous = std::mem::take(&mut self.data);
        let mut result = Vec::with_capacity(specs.len());
        for (data_id, access_type, condition, hit_condition) in specs {
            let carried = previous
                .iter()
                .find(|bp| &bp.data_id == data_id && &bp.condition == condition)
                .map(|bp| bp.hit_count)
                .unwrap_or(0);
            result.push(DataBreakpoint {
                id: self.alloc_id(),
                data_id: data_id.clone(),
                access_type: *access_type,
                condition: condition.clone(),
                hit_condition: hit_condition.clone(),
                hit_count: carried,
            });
        }
        self.data = result.clone();
        result
    }

    pub fn lookup_line(&self, source_path: &str, line: i64) -> Option<&LineBreakpoint> {
        self.lines
            .get(source_path)
            .and_then(|list| list.iter().find(|bp| bp.line == line))
    }

    /// Current line breakpoint specs for `source_path`, in the shape
    /// `Engine::set_line_breakpoints` expects. Used to re-resolve breakpoints
    /// against a hot-reloaded module without disturbing carried hit counts.
    pub fn line_breakpoints_for(&self, source_path: &str) -> Vec<(i64, Option<String>)> {
        self.lines
            .get(source_path)
            .map(|list| list.iter().map(|bp| (bp.line, bp.condition.clone())).collect())
            .unwrap_or_default()
    }

    /// Registers a hit against a line breakpoint, incrementing its count and
    /// evaluating the hit-condition grammar. Returns `true` when the
    /// breakpoint should actually stop execution (log points never do).
    pub fn register_line_hit(&mut self, source_path: &str, id: i64) -> Result<bool> {
        let list = self
            .lines
            .get_mut(source_path)
            .ok_or_else(|| AdapterError::Internal("hit on unknown source".into()))?;
        let bp = list
            .iter_mut()
            .find(|bp| bp.id == id)
            .ok_or_else(|| AdapterError::Internal("hit on unknown breakpoint id".into()))?;
        bp.hit_count += 1;
        if bp.log_message.is_some() {
            return Ok(false);
        }
        let should_stop = match &bp.hit_condition {
            None => true,
            Some(expr) => HitCondition::parse(expr)?.matches(bp.hit_count),
        };
        Ok(should_stop)
    }
}
