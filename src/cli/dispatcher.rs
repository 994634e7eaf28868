// src/cli/dispatcher.rs

use crate::core::{
    command_tree::{CommandNode, CommandSet, ValueDecl},
    context::{ContextBuilder, ExecutionContext, Value, ValueKind},
};
use anyhow::Result;
use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No command given. Available commands: {available}.")]
    NoCommandGiven { available: String },
    #[error("Unknown command '{name}'. Available commands: {available}.")]
    UnknownCommand { name: String, available: String },
    #[error("'{name}' is not runnable on its own. Use a subcommand: {available}.")]
    NoAction { name: String, available: String },
    #[error("Unknown flag '--{name}' for command '{command}'.")]
    UnknownFlag { name: String, command: String },
    #[error("Flag '--{name}' requires a value.")]
    MissingFlagValue { name: String },
    #[error("Missing required argument '{name}' for command '{command}'.")]
    MissingArgument { name: String, command: String },
    #[error(transparent)]
    BadValue(#[from] crate::core::context::ContextError),
}

fn sibling_names(node: &CommandNode) -> String {
    let names: Vec<&str> = node.children().iter().map(|c| c.name.as_str()).collect();
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

/// Walks the command tree along `argv` and returns the deepest matching node
/// plus the tokens left over for flag/argument parsing.
fn descend<'a>(
    set: &'a CommandSet,
    argv: &[String],
) -> Result<(&'a CommandNode, usize), DispatchError> {
    let root = set.root();
    let first = argv.first().ok_or_else(|| DispatchError::NoCommandGiven {
        available: sibling_names(root),
    })?;

    let mut node = root.child(first).ok_or_else(|| DispatchError::UnknownCommand {
        name: first.clone(),
        available: sibling_names(root),
    })?;

    let mut consumed = 1;
    for token in &argv[1..] {
        match node.child(token) {
            Some(child) => {
                node = child;
                consumed += 1;
            }
            None => break,
        }
    }
    Ok((node, consumed))
}

/// Parses the tokens after the command path against the node's declarations.
///
/// Flag forms: `--name=value`, `--name value`, and bare `--name` for bools.
/// Positional tokens fill argument declarations in order; everything beyond
/// them is preserved as raw `rest` tokens.
fn build_context(node: &CommandNode, tokens: &[String]) -> Result<ExecutionContext, DispatchError> {
    let mut provided_flags: Vec<(String, Value)> = Vec::new();
    let mut positionals: Vec<String> = Vec::new();

    let find_flag = |name: &str| -> Option<&ValueDecl> {
        node.flags.iter().find(|f| f.name == name)
    };

    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next() {
        let Some(stripped) = token.strip_prefix("--") else {
            positionals.push(token.clone());
            continue;
        };

        let (name, inline_value) = match stripped.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (stripped, None),
        };

        let decl = find_flag(name).ok_or_else(|| DispatchError::UnknownFlag {
            name: name.to_string(),
            command: node.name.clone(),
        })?;

        let raw = match inline_value {
            Some(value) => value,
            None if decl.kind == ValueKind::Bool => {
                // A bare boolean flag means true; an explicit value may
                // still follow as `--flag false`, but only a boolean literal
                // is consumed, so positionals after the flag stay intact.
                let boolish = matches!(
                    iter.peek().map(|s| s.as_str()),
                    Some("true" | "false" | "yes" | "no" | "1" | "0")
                );
                if boolish {
                    iter.next().cloned().unwrap()
                } else {
                    "true".to_string()
                }
            }
            None => match iter.peek() {
                Some(next) if !next.starts_with('-') => iter.next().cloned().unwrap(),
                _ => {
                    return Err(DispatchError::MissingFlagValue {
                        name: name.to_string(),
                    });
                }
            },
        };

        provided_flags.push((decl.name.clone(), Value::parse(&decl.name, decl.kind, &raw)?));
    }

    let mut builder = ContextBuilder::new();

    // Declared flags: provided value, else default, else absent.
    for decl in &node.flags {
        if let Some((_, value)) = provided_flags.iter().find(|(name, _)| *name == decl.name) {
            builder.flag(decl.name.clone(), value.clone());
        } else if let Some(default) = &decl.default {
            builder.flag(decl.name.clone(), default.clone());
        }
    }

    // Declared arguments consume positionals in order.
    let mut positional_iter = positionals.iter();
    for decl in &node.args {
        match positional_iter.next() {
            Some(raw) => {
                builder.arg(decl.name.clone(), Value::parse(&decl.name, decl.kind, raw)?);
            }
            None => match &decl.default {
                Some(default) => {
                    builder.arg(decl.name.clone(), default.clone());
                }
                None => {
                    return Err(DispatchError::MissingArgument {
                        name: decl.name.clone(),
                        command: node.name.clone(),
                    });
                }
            },
        }
    }
    builder.rest(positional_iter.cloned().collect());

    Ok(builder.build())
}

/// Resolves `argv` against the command tree and invokes the matching node's
/// action with a context projected from that node's own declarations.
pub fn dispatch(set: &CommandSet, argv: &[String]) -> Result<()> {
    let (node, consumed) = descend(set, argv)?;
    debug!("Dispatching to '{}' ({} path tokens).", node.name, consumed);

    let action = node.action.as_ref().ok_or_else(|| DispatchError::NoAction {
        name: node.name.clone(),
        available: sibling_names(node),
    })?;

    let context = build_context(node, &argv[consumed..])?;
    action(&context)
}
