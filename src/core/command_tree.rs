// src/core/command_tree.rs

use crate::core::context::{ContextError, ExecutionContext, Value, ValueKind};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("Cannot declare a command with an empty name.")]
    EmptyName,
    #[error("Cannot declare a sub-command with an empty path.")]
    EmptyPath,
    #[error("A command named '{name}' already exists under '{parent}'.")]
    DuplicateName { parent: String, name: String },
    #[error("No command found for path segment '{segment}' (while resolving '{path}').")]
    NoCommandFound { segment: String, path: String },
    #[error(transparent)]
    BadDeclaration(#[from] ContextError),
}

/// The body of a command. Receives the context projected from the specific
/// invoked node, never from global state.
pub type Action = Arc<dyn Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync>;

/// A typed value slot attached to a command node. Immutable once attached.
#[derive(Debug, Clone)]
pub struct ValueDecl {
    pub name: String,
    pub kind: ValueKind,
    pub default: Option<Value>,
    pub usage: Option<String>,
}

impl ValueDecl {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            usage: None,
        }
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn usage(mut self, text: impl Into<String>) -> Self {
        self.usage = Some(text.into());
        self
    }

    fn validate(&self) -> Result<(), ContextError> {
        if let Some(default) = &self.default
            && default.kind() != self.kind
        {
            return Err(ContextError::DefaultKindMismatch {
                name: self.name.clone(),
                expected: self.kind.label(),
                found: default.kind().label(),
            });
        }
        Ok(())
    }
}

/// Everything a declaration carries besides its name: usage text, category,
/// flag and argument slots, and the action body itself.
#[derive(Clone)]
pub struct CommandSpec {
    pub usage: Option<String>,
    pub category: Option<String>,
    pub flags: Vec<ValueDecl>,
    pub args: Vec<ValueDecl>,
    pub action: Action,
}

impl CommandSpec {
    pub fn new(action: Action) -> Self {
        Self {
            usage: None,
            category: None,
            flags: Vec::new(),
            args: Vec::new(),
            action,
        }
    }

    pub fn usage(mut self, text: impl Into<String>) -> Self {
        self.usage = Some(text.into());
        self
    }

    pub fn category(mut self, label: impl Into<String>) -> Self {
        self.category = Some(label.into());
        self
    }

    pub fn flag(mut self, decl: ValueDecl) -> Self {
        self.flags.push(decl);
        self
    }

    pub fn arg(mut self, decl: ValueDecl) -> Self {
        self.args.push(decl);
        self
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("usage", &self.usage)
            .field("category", &self.category)
            .field("flags", &self.flags)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// One addressable entry in the command tree. Nodes are only ever appended,
/// so the structure is a rooted tree by construction.
pub struct CommandNode {
    pub name: String,
    pub usage: Option<String>,
    pub category: Option<String>,
    pub flags: Vec<ValueDecl>,
    pub args: Vec<ValueDecl>,
    pub action: Option<Action>,
    children: Vec<CommandNode>,
}

impl Default for CommandNode {
    fn default() -> Self {
        Self::bare(String::new())
    }
}

impl CommandNode {
    fn bare(name: String) -> Self {
        Self {
            name,
            usage: None,
            category: None,
            flags: Vec::new(),
            args: Vec::new(),
            action: None,
            children: Vec::new(),
        }
    }

    pub fn children(&self) -> &[CommandNode] {
        &self.children
    }

    /// Exact, case-sensitive match against direct children, first match wins.
    pub fn child(&self, name: &str) -> Option<&CommandNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut CommandNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    fn attach(&mut self, name: String, spec: CommandSpec) -> Result<(), TreeError> {
        if name.is_empty() {
            return Err(TreeError::EmptyName);
        }
        if self.child(&name).is_some() {
            return Err(TreeError::DuplicateName {
                parent: self.name.clone(),
                name,
            });
        }
        for decl in spec.flags.iter().chain(spec.args.iter()) {
            decl.validate()?;
        }
        let mut node = CommandNode::bare(name);
        node.usage = spec.usage;
        node.category = spec.category;
        node.flags = spec.flags;
        node.args = spec.args;
        node.action = Some(spec.action);
        self.children.push(node);
        Ok(())
    }
}

// Action closures are opaque, so the derive is written out by hand.
impl fmt::Debug for CommandNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandNode")
            .field("name", &self.name)
            .field("usage", &self.usage)
            .field("category", &self.category)
            .field("flags", &self.flags)
            .field("args", &self.args)
            .field("has_action", &self.action.is_some())
            .field("children", &self.children)
            .finish()
    }
}

/// The command tree builder and resolver.
///
/// A `CommandSet` is constructed explicitly and threaded by reference through
/// the registration phase; once the host starts parsing process arguments it
/// is treated as immutable, so dispatch needs no locking.
#[derive(Debug, Default)]
pub struct CommandSet {
    root: CommandNode,
}

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the root node's name and usage. A second call overwrites the
    /// metadata but preserves children already attached, so scripts may set
    /// metadata after partial registration.
    pub fn declare_root(&mut self, name: impl Into<String>, usage: Option<String>) {
        self.root.name = name.into();
        self.root.usage = usage;
    }

    /// Appends a new command as a direct child of the root.
    pub fn declare_command(
        &mut self,
        name: impl Into<String>,
        spec: CommandSpec,
    ) -> Result<(), TreeError> {
        self.root.attach(name.into(), spec)
    }

    /// Appends a new command under the node addressed by `path`. All but the
    /// last segment must already resolve; the final segment names the new
    /// child.
    pub fn declare_subcommand(&mut self, path: &[&str], spec: CommandSpec) -> Result<(), TreeError> {
        let (last, parents) = match path.split_last() {
            Some(split) => split,
            None => return Err(TreeError::EmptyPath),
        };

        let full_path = path.join(" ");
        let mut node = &mut self.root;
        for segment in parents {
            node = node
                .child_mut(segment)
                .ok_or_else(|| TreeError::NoCommandFound {
                    segment: (*segment).to_string(),
                    path: full_path.clone(),
                })?;
        }
        node.attach((*last).to_string(), spec)
    }

    pub fn root(&self) -> &CommandNode {
        &self.root
    }

    /// Walks `path` from the root, left to right. Returns `None` as soon as
    /// a segment fails to match.
    pub fn resolve(&self, path: &[&str]) -> Option<&CommandNode> {
        let mut node = &self.root;
        for segment in path {
            node = node.child(segment)?;
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_spec() -> CommandSpec {
        CommandSpec::new(Arc::new(|_ctx| Ok(())))
    }

    #[test]
    fn declare_and_resolve_subcommand() {
        let mut set = CommandSet::new();
        set.declare_root("demo", Some("A demo tool.".into()));
        set.declare_command("deploy", noop_spec()).unwrap();
        set.declare_subcommand(&["deploy", "staging"], noop_spec())
            .unwrap();

        let node = set.resolve(&["deploy", "staging"]).unwrap();
        assert_eq!(node.name, "staging");
        assert!(node.action.is_some());
    }

    #[test]
    fn subcommand_with_missing_parent_fails() {
        let mut set = CommandSet::new();
        set.declare_root("demo", None);
        let err = set
            .declare_subcommand(&["missing", "x"], noop_spec())
            .unwrap_err();
        assert!(matches!(err, TreeError::NoCommandFound { .. }));
    }

    #[test]
    fn empty_path_fails() {
        let mut set = CommandSet::new();
        let err = set.declare_subcommand(&[], noop_spec()).unwrap_err();
        assert!(matches!(err, TreeError::EmptyPath));
    }

    #[test]
    fn duplicate_sibling_fails() {
        let mut set = CommandSet::new();
        set.declare_command("build", noop_spec()).unwrap();
        let err = set.declare_command("build", noop_spec()).unwrap_err();
        assert!(matches!(err, TreeError::DuplicateName { .. }));
    }

    #[test]
    fn redeclaring_root_preserves_children() {
        let mut set = CommandSet::new();
        set.declare_root("demo", None);
        set.declare_command("build", noop_spec()).unwrap();
        set.declare_root("renamed", Some("usage".into()));

        assert_eq!(set.root().name, "renamed");
        assert!(set.resolve(&["build"]).is_some());
    }

    #[test]
    fn mismatched_default_is_a_registration_error() {
        let mut set = CommandSet::new();
        let spec = noop_spec().flag(
            ValueDecl::new("count", ValueKind::Int).default_value(Value::Str("1".into())),
        );
        let err = set.declare_command("build", spec).unwrap_err();
        assert!(matches!(err, TreeError::BadDeclaration(_)));
    }
}
