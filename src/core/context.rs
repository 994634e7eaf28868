// src/core/context.rs

use std::collections::HashMap;
use std::ops::Index;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Invalid {kind} value '{raw}' for '{name}'.")]
    InvalidValue {
        name: String,
        kind: &'static str,
        raw: String,
    },
    #[error("Default for '{name}' is a {found}, but the declaration is typed {expected}.")]
    DefaultKindMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// The closed set of kinds a flag or argument declaration can carry.
/// Adding a kind here forces every projection site to be updated, since all
/// matches over it are exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Int,
    Bool,
    StrList,
    IntList,
}

impl ValueKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::StrList => "str_list",
            Self::IntList => "int_list",
        }
    }
}

/// A concrete value projected from a declaration, tagged with its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    StrList(Vec<String>),
    IntList(Vec<i64>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Str(_) => ValueKind::Str,
            Self::Int(_) => ValueKind::Int,
            Self::Bool(_) => ValueKind::Bool,
            Self::StrList(_) => ValueKind::StrList,
            Self::IntList(_) => ValueKind::IntList,
        }
    }

    /// Parses a raw CLI token into a value of the requested kind.
    /// List kinds split on commas; empty raw input yields an empty list.
    pub fn parse(name: &str, kind: ValueKind, raw: &str) -> Result<Self, ContextError> {
        let invalid = || ContextError::InvalidValue {
            name: name.to_string(),
            kind: kind.label(),
            raw: raw.to_string(),
        };
        match kind {
            ValueKind::Str => Ok(Self::Str(raw.to_string())),
            ValueKind::Int => raw.parse::<i64>().map(Self::Int).map_err(|_| invalid()),
            ValueKind::Bool => match raw {
                "true" | "yes" | "1" => Ok(Self::Bool(true)),
                "false" | "no" | "0" => Ok(Self::Bool(false)),
                _ => Err(invalid()),
            },
            ValueKind::StrList => {
                if raw.is_empty() {
                    return Ok(Self::StrList(Vec::new()));
                }
                Ok(Self::StrList(
                    raw.split(',').map(|s| s.trim().to_string()).collect(),
                ))
            }
            ValueKind::IntList => {
                if raw.is_empty() {
                    return Ok(Self::IntList(Vec::new()));
                }
                raw.split(',')
                    .map(|s| s.trim().parse::<i64>())
                    .collect::<Result<Vec<_>, _>>()
                    .map(Self::IntList)
                    .map_err(|_| invalid())
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            Self::StrList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            Self::IntList(v) => Some(v),
            _ => None,
        }
    }
}

/// Canonical underscore form of a key: every character that is not valid in
/// a bare identifier is replaced with '_'. Used to expose `dry-run` style
/// names under `dry_run` as well.
fn canonical_ident(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn needs_alias(key: &str) -> bool {
    key.chars().any(|c| !c.is_alphanumeric() && c != '_')
}

/// A read-only, name-addressable view over resolved values.
///
/// Values are shared (`Arc`), so a raw key and its canonical alias resolve to
/// the *identical* value object, and the merged map shares storage with the
/// per-set maps.
#[derive(Debug, Clone, Default)]
pub struct ContextMap {
    entries: HashMap<String, Arc<Value>>,
}

impl ContextMap {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(Arc::as_ref)
    }

    /// Returns the shared handle for a key. Exposed so callers can verify
    /// that two keys alias the same underlying value.
    pub fn get_shared(&self, key: &str) -> Option<Arc<Value>> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert_shared(&mut self, key: String, value: Arc<Value>) {
        self.entries.insert(key, value);
    }
}

impl Index<&str> for ContextMap {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        self.get(key)
            .unwrap_or_else(|| unreachable!("no value registered under '{key}'"))
    }
}

/// The value bundle handed to an action body. Built fresh per invocation,
/// never shared across concurrent invocations, and read-only by contract.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    flags: ContextMap,
    args: ContextMap,
    merged: ContextMap,
    rest: Vec<String>,
}

impl ExecutionContext {
    pub fn flags(&self) -> &ContextMap {
        &self.flags
    }

    pub fn args(&self) -> &ContextMap {
        &self.args
    }

    /// The union of flags and arguments; arguments win on key collision
    /// (last-applied union semantics).
    pub fn merged(&self) -> &ContextMap {
        &self.merged
    }

    /// The raw positional tokens that were not consumed by any declaration,
    /// in the order they appeared.
    pub fn rest(&self) -> &[String] {
        &self.rest
    }
}

/// Assembles `ExecutionContext` instances from resolved (name, value) pairs.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    flags: Vec<(String, Value)>,
    args: Vec<(String, Value)>,
    rest: Vec<String>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.flags.push((name.into(), value));
        self
    }

    pub fn arg(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.args.push((name.into(), value));
        self
    }

    pub fn rest(&mut self, tokens: Vec<String>) -> &mut Self {
        self.rest = tokens;
        self
    }

    pub fn build(self) -> ExecutionContext {
        // Raw keys from both sets take priority over any canonical alias.
        let declared: Vec<String> = self
            .flags
            .iter()
            .chain(self.args.iter())
            .map(|(name, _)| name.clone())
            .collect();

        let flags = Self::project(&self.flags, &declared);
        let args = Self::project(&self.args, &declared);

        let mut merged = ContextMap::default();
        for map in [&flags, &args] {
            for (key, value) in &map.entries {
                merged.insert_shared(key.clone(), value.clone());
            }
        }

        ExecutionContext {
            flags,
            args,
            merged,
            rest: self.rest,
        }
    }

    fn project(pairs: &[(String, Value)], declared: &[String]) -> ContextMap {
        let mut map = ContextMap::default();
        for (name, value) in pairs {
            map.insert_shared(name.clone(), Arc::new(value.clone()));
        }
        // Alias pass: register the underscore form of every non-identifier
        // key, unless it would shadow a declared raw key.
        for (name, _) in pairs {
            if !needs_alias(name) {
                continue;
            }
            let canonical = canonical_ident(name);
            if declared.iter().any(|raw| *raw == canonical) || map.contains(&canonical) {
                continue;
            }
            let shared = map
                .get_shared(name)
                .unwrap_or_else(|| unreachable!("raw key was just inserted"));
            map.insert_shared(canonical, shared);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_by_kind() {
        assert_eq!(
            Value::parse("n", ValueKind::Int, "42").unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            Value::parse("b", ValueKind::Bool, "true").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Value::parse("l", ValueKind::IntList, "1, 2,3").unwrap(),
            Value::IntList(vec![1, 2, 3])
        );
        assert_eq!(
            Value::parse("s", ValueKind::StrList, "a,b").unwrap(),
            Value::StrList(vec!["a".into(), "b".into()])
        );
        assert!(Value::parse("n", ValueKind::Int, "not-a-number").is_err());
    }

    #[test]
    fn alias_resolves_to_identical_value() {
        let mut builder = ContextBuilder::new();
        builder.flag("dry-run", Value::Bool(true));
        let ctx = builder.build();

        let raw = ctx.flags().get_shared("dry-run").unwrap();
        let alias = ctx.flags().get_shared("dry_run").unwrap();
        assert!(Arc::ptr_eq(&raw, &alias));
        assert_eq!(ctx.flags()["dry_run"], Value::Bool(true));
    }

    #[test]
    fn alias_skipped_when_raw_key_exists() {
        let mut builder = ContextBuilder::new();
        builder.flag("dry-run", Value::Bool(true));
        builder.flag("dry_run", Value::Bool(false));
        let ctx = builder.build();

        // The declared raw key keeps its own value; no alias overwrites it.
        assert_eq!(ctx.flags()["dry_run"], Value::Bool(false));
        assert_eq!(ctx.flags()["dry-run"], Value::Bool(true));
    }

    #[test]
    fn merged_prefers_arguments() {
        let mut builder = ContextBuilder::new();
        builder.flag("target", Value::Str("from-flag".into()));
        builder.arg("target", Value::Str("from-arg".into()));
        let ctx = builder.build();

        assert_eq!(
            ctx.merged()["target"],
            Value::Str("from-arg".into())
        );
        assert_eq!(ctx.flags()["target"], Value::Str("from-flag".into()));
    }

    #[test]
    fn rest_tokens_preserve_order() {
        let mut builder = ContextBuilder::new();
        builder.rest(vec!["a".into(), "b".into(), "c".into()]);
        let ctx = builder.build();
        assert_eq!(ctx.rest(), ["a", "b", "c"]);
    }
}
