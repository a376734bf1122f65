//! A small Python-flavoured snippet language.
//!
//! Programs see only the variables they are given and a fixed set of
//! builtins. There is no way to reach the filesystem, the network or other
//! processes: such names simply do not exist, and anything outside the
//! whitelist is rejected as a security violation.

mod interp;
mod lexer;
mod parser;
mod value;

use thiserror::Error;

use owl_core::error::SandboxFault;

pub use interp::{Interpreter, Limits};
pub use parser::{parse, Program};
pub use value::ScriptValue;

/// Builtin functions a snippet may call.
pub const BUILTINS: &[&str] = &[
    "abs", "all", "any", "bool", "float", "int", "len", "list", "max", "min", "print", "range",
    "round", "sorted", "str", "sum",
];

/// Method names a snippet may call on strings, lists and mappings.
pub const METHODS: &[&str] = &[
    "append", "count", "endswith", "extend", "find", "get", "index", "items", "join", "keys",
    "lower", "lstrip", "pop", "replace", "rstrip", "split", "startswith", "strip", "upper",
    "values",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("{0}")]
    Security(String),

    #[error("line {line}: {message}")]
    Runtime { line: usize, message: String },

    #[error("resource limit exceeded: {0}")]
    Limit(String),

    #[error("interrupted")]
    Interrupted,
}

impl ScriptError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }

    /// Runtime error whose line is filled in by the statement that raised it.
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            line: 0,
            message: message.into(),
        }
    }

    pub(crate) fn at_line(self, line: usize) -> Self {
        match self {
            Self::Runtime { line: 0, message } => Self::Runtime { line, message },
            other => other,
        }
    }

    /// Map onto the sandbox fault taxonomy.
    pub fn into_fault(self, budget_ms: u64) -> SandboxFault {
        match self {
            Self::Security(msg) => SandboxFault::SecurityViolation(msg),
            Self::Interrupted => SandboxFault::TimedOut { budget_ms },
            other => SandboxFault::Faulted(other.to_string()),
        }
    }
}
