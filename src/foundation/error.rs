pub type MeshpressResult<T> = Result<T, MeshpressError>;

#[derive(thiserror::Error, Debug)]
pub enum MeshpressError {
    /// An operation was invoked without a loaded document.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Malformed input during load (bad magic bytes, unparseable JSON,
    /// truncated chunks).
    #[error("format error: {0}")]
    Format(String),

    /// An argument failed validation before any work was attempted.
    #[error("validation error: {0}")]
    Validation(String),

    /// An algorithmic failure inside a mesh or texture transform. The live
    /// document is guaranteed unchanged when this surfaces.
    #[error("transform error: {0}")]
    Transform(String),

    /// A transient network failure during texture offload. Retried
    /// internally; demoted to a per-texture failure once retries run out.
    #[error("network error: {0}")]
    Network(String),

    /// The offload response carried a texture index that does not match the
    /// request. Never retried.
    #[error("texture identity error: {0}")]
    Identity(String),

    /// Every texture in an offloaded compression call failed.
    #[error("all textures failed: {0}")]
    AggregateFailure(String),

    /// A serialization or packaging failure during export.
    #[error("export error: {0}")]
    Export(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MeshpressError {
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }

    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export(msg.into())
    }
}
