//! Variable/Source Catalog (C5).
//!
//! Allocates monotonic, non-zero handles for scopes, containers, and sources;
//! serves paged reads through lazy providers. Grounded on
//! `db-backend::dap::new_dap_variable` and `dap_types::Variable`/`Scope`/
//! `Source` field shapes; provider-registration-order lookup is new, modeled
//! after the corpus's general first-match-wins helper style.

use crate::dap_types::{Variable, VariablePresentationHint};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredKind {
    Data,
    Property,
    Method,
    Class,
}

impl StructuredKind {
    fn as_str(self) -> &'static str {
        match self {
            StructuredKind::Data => "data",
            StructuredKind::Property => "property",
            StructuredKind::Method => "method",
            StructuredKind::Class => "class",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub value: String,
    pub type_: Option<String>,
    pub kind: StructuredKind,
    pub is_private: bool,
    pub has_side_effects: bool,
    pub has_data_breakpoint: bool,
    /// Value is a raw/unescaped string form (e.g. a language's raw-string
    /// literal) rather than the catalog's usual repr-style rendering.
    pub raw_string: bool,
    /// If `Some`, expanding this field allocates/reuses the given handle.
    pub child_handle: Option<i64>,
}

/// A lazily-populated container: the field list is produced on first read.
pub trait ContainerProvider: Send + Sync {
    fn fields(&self) -> Vec<Field>;
}

pub trait SourceProvider: Send + Sync {
    /// Returns `Some(content)` if this provider owns `path_or_uri`.
    fn resolve(&self, path_or_uri: &str) -> Option<String>;
}

pub struct VariableCatalog {
    next_handle: AtomicI64,
    containers: HashMap<i64, Box<dyn ContainerProvider>>,
    /// Handles retired when their owning frame goes out of scope.
    frame_owned: HashMap<i64, Vec<i64>>,
    source_providers: Vec<Box<dyn SourceProvider>>,
    next_source_ref: AtomicI64,
}

impl Default for VariableCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableCatalog {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicI64::new(1),
            containers: HashMap::new(),
            frame_owned: HashMap::new(),
            source_providers: Vec::new(),
            next_source_ref: AtomicI64::new(1),
        }
    }

    fn alloc(&self) -> i64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn allocate_container(&mut self, frame_id: i64, provider: Box<dyn ContainerProvider>) -> i64 {
        let handle = self.alloc();
        self.containers.insert(handle, provider);
        self.frame_owned.entry(frame_id).or_default().push(handle);
        handle
    }

    pub fn read(&self, handle: i64) -> Vec<Variable> {
        let Some(provider) = self.containers.get(&handle) else {
            return Vec::new();
        };
        provider
            .fields()
            .into_iter()
            .map(|f| {
                let named_variables = f.child_handle.and_then(|h| self.field_count(h));
                Variable {
                    name: f.name,
                    value: f.value,
                    type_: f.type_,
                    presentation_hint: Some(VariablePresentationHint {
                        kind: Some(f.kind.as_str().to_string()),
                        attributes: {
                            let mut attrs = Vec::new();
                            if f.has_side_effects {
                                attrs.push("hasSideEffects".to_string());
                            }
                            if f.has_data_breakpoint {
                                attrs.push("hasDataBreakpoint".to_string());
                            }
                            if f.raw_string {
                                attrs.push("rawString".to_string());
                            }
                            if attrs.is_empty() {
                                None
                            } else {
                                Some(attrs)
                            }
                        },
                        visibility: Some(if f.is_private { "private" } else { "public" }.into()),
                    }),
                    evaluate_name: None,
                    variables_reference: f.child_handle.unwrap_or(0),
                    named_variables,
                    indexed_variables: None,
                }
            })
            .collect()
    }

    /// Field-count badge for a container handle, used to populate a parent
    /// variable's/scope's `named_variables` without expanding its children.
    pub fn field_count(&self, handle: i64) -> Option<i64> {
        self.containers.get(&handle).map(|p| p.fields().len() as i64)
    }

    /// Retires every handle allocated against `frame_id` (e.g. on resume).
    pub fn retire_frame(&mut self, frame_id: i64) {
        if let Some(handles) = self.frame_owned.remove(&frame_id) {
            for h in handles {
                self.containers.remove(&h);
            }
        }
    }

    pub fn is_valid(&self, handle: i64) -> bool {
        self.containers.contains_key(&handle)
    }

    pub fn register_source_provider(&mut self, provider: Box<dyn SourceProvider>) {
        self.source_providers.push(provider);
    }

    pub fn allocate_source_ref(&self) -> i64 {
        self.next_source_ref.fetch_add(1, Ordering::Relaxed)
    }

    /// First-match-wins lookup across registered providers, in registration
    /// order. Provider failures (returning `None`) are treated as "not found"
    /// and never propagate as an error.
    pub fn resolve_source(&self, path_or_uri: &str) -> Option<String> {
        let normalized = path_or_uri.strip_prefix("file://").unwrap_or(path_or_uri);
        for provider in &self.source_providers {
            if let Some(content) = provider.resolve(normalized) {
                return Some(content);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<Field>);
    impl ContainerProvider for Fixed {
        fn fields(&self) -> Vec<Field> {
            self.0.clone()
        }
    }

    struct EchoProvider;
    impl SourceProvider for EchoProvider {
        fn resolve(&self, path_or_uri: &str) -> Option<String> {
            if path_or_uri.ends_with(".py") {
                Some(format!("# contents of {path_or_uri}"))
            } else {
                None
            }
        }
    }

    #[test]
    fn handles_allocate_monotonically() {
        let mut cat = VariableCatalog::new();
        let h1 = cat.allocate_container(1, Box::new(Fixed(vec![])));
        let h2 = cat.allocate_container(1, Box::new(Fixed(vec![])));
        assert!(h2 > h1);
    }

    #[test]
    fn retiring_frame_invalidates_its_handles() {
        let mut cat = VariableCatalog::new();
        let h = cat.allocate_container(1, Box::new(Fixed(vec![])));
        assert!(cat.is_valid(h));
        cat.retire_frame(1);
        assert!(!cat.is_valid(h));
    }

    #[test]
    fn declared_field_order_is_preserved() {
        let mut cat = VariableCatalog::new();
        let fields = vec![
            Field {
                name: "a".into(),
                value: "1".into(),
                type_: None,
                kind: StructuredKind::Data,
                is_private: false,
                has_side_effects: false,
                has_data_breakpoint: false,
                raw_string: false,
                child_handle: None,
            },
            Field {
                name: "_b".into(),
                value: "2".into(),
                type_: None,
                kind: StructuredKind::Data,
                is_private: true,
                has_side_effects: false,
                has_data_breakpoint: false,
                raw_string: false,
                child_handle: None,
            },
        ];
        let h = cat.allocate_container(1, Box::new(Fixed(fields)));
        let vars = cat.read(h);
        assert_eq!(vars[0].name, "a");
        assert_eq!(vars[1].name, "_b");
        assert_eq!(
            vars[1].presentation_hint.as_ref().unwrap().visibility,
            Some("private".into())
        );
    }

    #[test]
    fn raw_string_flag_surfaces_as_presentation_attribute() {
        let mut cat = VariableCatalog::new();
        let fields = vec![Field {
            name: "pattern".into(),
            value: "\\d+".into(),
            type_: None,
            kind: StructuredKind::Data,
            is_private: false,
            has_side_effects: false,
            has_data_breakpoint: false,
            raw_string: true,
            child_handle: None,
        }];
        let h = cat.allocate_container(1, Box::new(Fixed(fields)));
        let vars = cat.read(h);
        assert_eq!(
            vars[0].presentation_hint.as_ref().unwrap().attributes,
            Some(vec!["rawString".to_string()])
        );
    }

    #[test]
    fn named_variables_badge_reflects_child_container_field_count() {
        let mut cat = VariableCatalog::new();
        let child = cat.allocate_container(
            1,
            Box::new(Fixed(vec![
                Field {
                    name: "x".into(),
                    value: "1".into(),
                    type_: None,
                    kind: StructuredKind::Data,
                    is_private: false,
                    has_side_effects: false,
                    has_data_breakpoint: false,
                    raw_string: false,
                    child_handle: None,
                },
                Field {
                    name: "y".into(),
                    value: "2".into(),
                    type_: None,
                    kind: StructuredKind::Data,
                    is_private: false,
                    has_side_effects: false,
                    has_data_breakpoint: false,
                    raw_string: false,
                    child_handle: None,
                },
            ])),
        );
        let parent = cat.allocate_container(
            1,
            Box::new(Fixed(vec![Field {
                name: "point".into(),
                value: "Point(1, 2)".into(),
                type_: None,
                kind: StructuredKind::Data,
                is_private: false,
                has_side_effects: false,
                has_data_breakpoint: false,
                raw_string: false,
                child_handle: Some(child),
            }])),
        );
        let vars = cat.read(parent);
        assert_eq!(vars[0].named_variables, Some(2));
    }

    #[test]
    fn source_providers_consulted_in_order_first_match_wins() {
        let mut cat = VariableCatalog::new();
        cat.register_source_provider(Box::new(EchoProvider));
        assert!(cat.resolve_source("file:///tmp/a.py").is_some());
        assert!(cat.resolve_source("/tmp/a.txt").is_none());
    }
}
