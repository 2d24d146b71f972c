use thiserror::Error;

/// Primary error type for memdex operations.
///
/// Variants map one-to-one onto the stable wire codes in [`ErrorCode`], so a
/// client that only understands numeric codes loses no information beyond the
/// message text.
#[derive(Error, Debug, Clone)]
pub enum MemdexError {
    // === Request validation ===
    /// Invalid parameters supplied by the caller.
    #[error("{0}")]
    Params(String),

    /// Internal consistency violation surfaced to the caller.
    #[error("{0}")]
    Logic(String),

    // === Parsers ===
    /// SQL text could not be parsed.
    #[error("SQL error: {detail}")]
    ParseSql { detail: String, pos: usize },

    /// Full-text DSL could not be parsed.
    #[error("fulltext DSL error: {0}")]
    ParseDsl(String),

    /// JSON document could not be parsed.
    #[error("JSON error: {0}")]
    ParseJson(String),

    // === Catalog ===
    /// Namespace, index or meta key does not exist.
    #[error("{what} '{name}' not found")]
    NotFound { what: &'static str, name: String },

    /// Namespace or index already exists.
    #[error("{what} '{name}' already exists")]
    Exists { what: &'static str, name: String },

    /// Operation is not permitted for this caller or namespace state.
    #[error("forbidden: {0}")]
    Forbidden(String),

    // === Cancellation ===
    /// The operation's context was canceled.
    #[error("context canceled")]
    Canceled,

    /// The operation's deadline expired.
    #[error("context deadline exceeded")]
    Timeout,

    // === Concurrency ===
    /// Concurrent modification conflict (e.g. tagsmatcher merge clash).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The namespace handle was invalidated by a copy-on-write commit.
    ///
    /// Internal signal: the cloner wrapper retries on it and clients never
    /// observe it.
    #[error("namespace was invalidated")]
    NamespaceInvalidated,

    // === Execution ===
    /// Query execution failed against a specific index or field.
    #[error("{0}")]
    QueryExec(String),

    /// A replication record could not be applied on the slave.
    #[error("replication update error: {0}")]
    UpdateReplication(String),

    /// Network failure while talking to the master.
    #[error("network error: {0}")]
    Network(String),

    /// Unrecoverable engine failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Stable numeric codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    Params = 1,
    Logic = 2,
    ParseSql = 3,
    ParseDsl = 4,
    ParseJson = 5,
    NotFound = 6,
    Exists = 7,
    Forbidden = 8,
    Canceled = 9,
    Timeout = 10,
    Conflict = 11,
    NamespaceInvalidated = 12,
    QueryExec = 13,
    UpdateReplication = 14,
    Network = 15,
    Fatal = 16,
}

impl MemdexError {
    /// Map this error to its stable wire code.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Params(_) => ErrorCode::Params,
            Self::Logic(_) => ErrorCode::Logic,
            Self::ParseSql { .. } => ErrorCode::ParseSql,
            Self::ParseDsl(_) => ErrorCode::ParseDsl,
            Self::ParseJson(_) => ErrorCode::ParseJson,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Exists { .. } => ErrorCode::Exists,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Canceled => ErrorCode::Canceled,
            Self::Timeout => ErrorCode::Timeout,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::NamespaceInvalidated => ErrorCode::NamespaceInvalidated,
            Self::QueryExec(_) => ErrorCode::QueryExec,
            Self::UpdateReplication(_) => ErrorCode::UpdateReplication,
            Self::Network(_) => ErrorCode::Network,
            Self::Fatal(_) => ErrorCode::Fatal,
        }
    }

    /// Whether a retry may succeed without caller intervention.
    ///
    /// The replication consumer restarts its loop on transient errors and
    /// halts the namespace on everything else.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::NamespaceInvalidated
        )
    }

    /// Create a `params` error.
    pub fn params(msg: impl Into<String>) -> Self {
        Self::Params(msg.into())
    }

    /// Create a `logic` error.
    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }

    /// Create a `parse_sql` error at a byte position.
    pub fn parse_sql(pos: usize, detail: impl Into<String>) -> Self {
        Self::ParseSql {
            detail: detail.into(),
            pos,
        }
    }

    /// Create a `parse_dsl` error.
    pub fn parse_dsl(msg: impl Into<String>) -> Self {
        Self::ParseDsl(msg.into())
    }

    /// Create a `parse_json` error.
    pub fn parse_json(msg: impl Into<String>) -> Self {
        Self::ParseJson(msg.into())
    }

    /// Create a `not_found` error.
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    /// Create an `exists` error.
    pub fn exists(what: &'static str, name: impl Into<String>) -> Self {
        Self::Exists {
            what,
            name: name.into(),
        }
    }

    /// Create a `conflict` error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a `query_exec` error.
    pub fn query_exec(msg: impl Into<String>) -> Self {
        Self::QueryExec(msg.into())
    }
}

/// Result type alias using `MemdexError`.
pub type Result<T> = std::result::Result<T, MemdexError>;
