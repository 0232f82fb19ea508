use thiserror::Error;

/// Crate-wide result alias. Every internal layer returns this; the dispatcher
/// boundary converts the error into a structured JSON response.
pub type Result<T, E = CalmError> = std::result::Result<T, E>;

/// The error taxonomy shared by every CALM component.
///
/// Kinds map one-to-one onto the machine-readable `type` field of error
/// responses. `Store` and `Embed` are the only kinds the dispatcher retries.
#[derive(Debug, Error)]
pub enum CalmError {
    /// A precondition on caller input was violated. No state was mutated.
    #[error("{0}")]
    Validation(String),

    /// The named id or collection does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A GHAP state-machine transition outside the legal diagram.
    #[error("{0}")]
    InvalidState(String),

    /// Value validation or clustering ran against a cluster with no members.
    #[error("{0}")]
    EmptyCluster(String),

    /// Clustering refused to run below the minimum member count.
    #[error("{0}")]
    InsufficientData(String),

    /// Vector dimension does not match the target collection.
    #[error("vector has dimension {actual} but collection '{collection}' expects {expected}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    /// Transient vector-store failure.
    #[error("store: {0}")]
    Store(String),

    /// Embedder failure: timeout, OOM, or model load.
    #[error("embed: {0}")]
    Embed(String),

    /// An on-disk journal or persistence file could not be read.
    #[error("corrupt state: {0}")]
    CorruptState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CalmError {
    /// The machine-readable kind carried in error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            CalmError::Validation(_) => "validation",
            CalmError::NotFound(_) => "not_found",
            CalmError::InvalidState(_) => "invalid_state",
            CalmError::EmptyCluster(_) => "empty_cluster",
            CalmError::InsufficientData(_) => "insufficient_data",
            CalmError::DimensionMismatch { .. } => "dimension_mismatch",
            CalmError::Store(_) => "store",
            CalmError::Embed(_) => "embed",
            CalmError::CorruptState(_) => "corrupt_state",
            CalmError::Io(_) => "io",
        }
    }

    /// Whether the dispatcher may retry the failed call once.
    pub fn is_transient(&self) -> bool {
        matches!(self, CalmError::Store(_) | CalmError::Embed(_))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CalmError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        CalmError::NotFound(message.into())
    }
}
