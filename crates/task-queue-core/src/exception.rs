use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Hierarchical error kind, written as a dotted path.
///
/// `"arithmetic.zero_division"` is a subkind of `"arithmetic"`, and the root
/// kind (the empty path) is an ancestor of every kind. Retry policies match
/// raised errors against kinds with [`ErrorKind::is_a`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorKind(String);

impl ErrorKind {
    pub fn new(path: impl Into<String>) -> Self {
        ErrorKind(path.into())
    }

    /// The kind every error belongs to.
    pub fn root() -> Self {
        ErrorKind(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `self` equals `ancestor` or lies below it in the hierarchy.
    pub fn is_a(&self, ancestor: &ErrorKind) -> bool {
        if ancestor.is_root() || self.0 == ancestor.0 {
            return true;
        }
        self.0
            .strip_prefix(ancestor.0.as_str())
            .map_or(false, |rest| rest.starts_with('.'))
    }

    /// Last path segment, used as the short class name in diagnostics.
    pub fn name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or("")
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("error")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for ErrorKind {
    fn from(path: &str) -> Self {
        ErrorKind::new(path)
    }
}

/// True when `kind` matches any entry of `matchers`.
pub fn matches_any(kind: &ErrorKind, matchers: &[ErrorKind]) -> bool {
    matchers.iter().any(|m| kind.is_a(m))
}

/// A constructor argument of a task exception.
#[derive(Debug, Clone, PartialEq)]
pub enum ExceptionArg {
    /// Survives serialization unchanged.
    Value(Value),
    /// Only known through its debug representation; cannot cross a process boundary.
    Opaque(String),
}

/// Error raised by a task body.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskException {
    pub kind: ErrorKind,
    pub message: String,
    pub args: Vec<ExceptionArg>,
}

impl TaskException {
    pub fn new(kind: impl Into<ErrorKind>, message: impl Into<String>) -> Self {
        let message = message.into();
        TaskException {
            kind: kind.into(),
            args: vec![ExceptionArg::Value(Value::String(message.clone()))],
            message,
        }
    }

    /// Exception without the implicit message argument.
    pub fn with_args(
        kind: impl Into<ErrorKind>,
        message: impl Into<String>,
        args: Vec<ExceptionArg>,
    ) -> Self {
        TaskException {
            kind: kind.into(),
            message: message.into(),
            args,
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(ExceptionArg::Value(value.into()));
        self
    }

    pub fn opaque_arg(mut self, repr: impl Into<String>) -> Self {
        self.args.push(ExceptionArg::Opaque(repr.into()));
        self
    }

    pub fn is_a(&self, kind: &ErrorKind) -> bool {
        self.kind.is_a(kind)
    }

    /// Whether every argument can be carried to another process as-is.
    pub fn is_transportable(&self) -> bool {
        self.args
            .iter()
            .all(|arg| matches!(arg, ExceptionArg::Value(_)))
    }

    pub fn to_wire(&self) -> WireException {
        WireException::from(self)
    }
}

impl fmt::Display for TaskException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskException {}

/// Transport form of a [`TaskException`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireException {
    /// Every argument serialized faithfully.
    Exact {
        kind: ErrorKind,
        message: String,
        args: Vec<Value>,
    },
    /// Generic carrier for an exception with arguments that cannot be
    /// serialized. Keeps the kind and the arguments that could be.
    Unserializable {
        exc_kind: ErrorKind,
        exc_args: Vec<Value>,
        text: String,
    },
}

impl WireException {
    pub fn kind(&self) -> &ErrorKind {
        match self {
            WireException::Exact { kind, .. } => kind,
            WireException::Unserializable { exc_kind, .. } => exc_kind,
        }
    }

    /// Short class name of the original exception.
    pub fn class_name(&self) -> &str {
        self.kind().name()
    }

    pub fn args(&self) -> &[Value] {
        match self {
            WireException::Exact { args, .. } => args,
            WireException::Unserializable { exc_args, .. } => exc_args,
        }
    }

    pub fn is_wrapped(&self) -> bool {
        matches!(self, WireException::Unserializable { .. })
    }

    /// Rebuild a local exception. Arguments dropped on the way out stay lost.
    pub fn restore(&self) -> TaskException {
        match self {
            WireException::Exact {
                kind,
                message,
                args,
            } => TaskException::with_args(
                kind.clone(),
                message.clone(),
                args.iter().cloned().map(ExceptionArg::Value).collect(),
            ),
            WireException::Unserializable {
                exc_kind,
                exc_args,
                text,
            } => TaskException::with_args(
                exc_kind.clone(),
                text.clone(),
                exc_args.iter().cloned().map(ExceptionArg::Value).collect(),
            ),
        }
    }
}

impl From<&TaskException> for WireException {
    fn from(exc: &TaskException) -> Self {
        if exc.is_transportable() {
            return WireException::Exact {
                kind: exc.kind.clone(),
                message: exc.message.clone(),
                args: exc
                    .args
                    .iter()
                    .filter_map(|arg| match arg {
                        ExceptionArg::Value(v) => Some(v.clone()),
                        ExceptionArg::Opaque(_) => None,
                    })
                    .collect(),
            };
        }

        let exc_args = exc
            .args
            .iter()
            .filter_map(|arg| match arg {
                ExceptionArg::Value(v) => Some(v.clone()),
                ExceptionArg::Opaque(_) => None,
            })
            .collect();

        WireException::Unserializable {
            exc_kind: exc.kind.clone(),
            exc_args,
            text: exc.to_string(),
        }
    }
}

impl fmt::Display for WireException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireException::Exact { kind, message, .. } => write!(f, "{}: {}", kind, message),
            WireException::Unserializable { text, .. } => f.write_str(text),
        }
    }
}
