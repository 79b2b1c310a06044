use crate::fingerprint::QueryId;
use crate::state::QueryState;

/// The crate-wide error type. Variants map onto the failure taxonomy the
/// server exposes: validation and authorisation failures surface
/// synchronously, execution and dependency failures are recorded against the
/// query id and surfaced on poll, and everything else is infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The submitted spec is malformed or missing a required parameter.
    /// No state record is created for these.
    #[error("invalid query spec: {0}")]
    Validation(String),

    /// The `query_kind` discriminator names no known kind.
    #[error("unknown query kind: '{0}'")]
    UnknownQueryKind(String),

    /// The id is neither in the in-memory registry nor in the cache.
    #[error("Unknown query id: '{0}'")]
    UnknownQueryId(QueryId),

    /// A state transition was requested that the per-id machine forbids.
    #[error("illegal transition for query '{id}': {from} -> {to}")]
    IllegalTransition {
        id: QueryId,
        from: QueryState,
        to: QueryState,
    },

    /// A prerequisite of this query terminated without materialising.
    #[error("dependency_failed({0})")]
    DependencyFailed(QueryId),

    /// The execution observed a cancel request and aborted.
    #[error("query cancelled")]
    Cancelled,

    /// The dependency walk re-entered a node already on the current path.
    /// This is a programming error in the query-kind tables, not user input.
    #[error("cycle detected in dependency graph at '{0}'")]
    CycleDetected(QueryId),

    /// SQL-level failure reported by the warehouse.
    #[error("warehouse error: {0}")]
    Warehouse(#[from] sqlx::Error),

    #[error("serialisation error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The bearer token verified but its claims do not cover the request.
    #[error("authorisation failed: {0}")]
    Forbidden(String),

    #[error("invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// The message socket between gateway and server broke or produced a
    /// reply that does not parse.
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether retrying the same operation against the warehouse can
    /// plausibly succeed. Connection-level drops are transient; SQL-level
    /// failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Warehouse(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }
}
