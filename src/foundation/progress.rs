use serde::{Deserialize, Serialize};

/// A single progress notification from a long-running operation.
///
/// `progress` is a percentage in `0..=100`. Operations report discrete named
/// stages rather than continuous byte counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Human-readable name of the running operation.
    pub operation: String,
    /// Completion percentage, `0..=100`.
    pub progress: u8,
    /// Optional free-form detail (current stage, current resource).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ProgressEvent {
    pub fn new(operation: impl Into<String>, progress: u8) -> Self {
        Self {
            operation: operation.into(),
            progress: progress.min(100),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Pipeline stage tag attached by the orchestrator when it forwards
/// sub-component progress, so a caller can render one unified bar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Loading,
    Optimizing,
    Exporting,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loading => write!(f, "loading"),
            Self::Optimizing => write!(f, "optimizing"),
            Self::Exporting => write!(f, "exporting"),
        }
    }
}

/// A progress event tagged with its pipeline stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: PipelineStage,
    pub event: ProgressEvent,
}

/// Registered progress callback. Invoked synchronously within the calling
/// stack; it must not block.
pub(crate) type ProgressFn = Box<dyn FnMut(&ProgressEvent)>;

/// Shared emit helper for components that hold an optional callback.
pub(crate) fn emit(
    sink: &mut Option<ProgressFn>,
    operation: &str,
    progress: u8,
    details: Option<&str>,
) {
    if let Some(callback) = sink.as_mut() {
        let event = ProgressEvent {
            operation: operation.to_owned(),
            progress: progress.min(100),
            details: details.map(str::to_owned),
        };
        callback(&event);
    }
}
