use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Action,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Action => "action",
        }
    }

    /// Only queries can be kept live.
    pub fn is_subscribable(self) -> bool {
        matches!(self, OperationKind::Query)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified name of a remote function, e.g. `servers:get`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionPath(Arc<str>);

impl FunctionPath {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(Arc::from(path.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for FunctionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunctionPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionRef {
    pub kind: OperationKind,
    pub path: FunctionPath,
}

impl FunctionRef {
    pub fn query(path: impl AsRef<str>) -> Self {
        Self {
            kind: OperationKind::Query,
            path: FunctionPath::new(path),
        }
    }

    pub fn mutation(path: impl AsRef<str>) -> Self {
        Self {
            kind: OperationKind::Mutation,
            path: FunctionPath::new(path),
        }
    }

    pub fn action(path: impl AsRef<str>) -> Self {
        Self {
            kind: OperationKind::Action,
            path: FunctionPath::new(path),
        }
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub kind: OperationKind,
    pub path: FunctionPath,
    pub args: Value,
}

impl RemoteCall {
    pub fn new(function: &FunctionRef, args: Value) -> Self {
        Self {
            kind: function.kind,
            path: function.path.clone(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryCacheKey {
    pub path: FunctionPath,
    pub args_canonical: Arc<str>,
}

impl fmt::Display for QueryCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\u{0}{}", self.path, self.args_canonical)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Call {
        request_id: u64,
        kind: OperationKind,
        path: FunctionPath,
        args: Value,
    },
    Watch {
        watch_id: u64,
        path: FunctionPath,
        args: Value,
    },
    Unwatch {
        watch_id: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Result { request_id: u64, value: Value },
    Failure { request_id: u64, message: String },
    Update { watch_id: u64, value: Value },
    WatchFailure { watch_id: u64, message: String },
}
