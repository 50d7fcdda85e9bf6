use crate::stage::StageName;

/// Result alias that carries the custom [`KaraokeError`] type.
pub type Result<T> = std::result::Result<T, KaraokeError>;

/// Common error type for the core crate.
///
/// Validation and protocol errors are returned synchronously to the caller
/// and never change any state. Stage execution failures are produced on the
/// worker thread and surface through the progress record instead.
#[derive(Debug, thiserror::Error)]
pub enum KaraokeError {
    /// Free-form message for conditions that do not deserve their own variant.
    #[error("{0}")]
    Message(String),
    /// Malformed input: bad timestamps, unparsable lyric files, empty edits.
    #[error("invalid input: {0}")]
    Validation(String),
    /// The interval `[start, end)` intersects the line at `conflict`.
    #[error("line [{start:.3}s, {end:.3}s) overlaps line {conflict}")]
    Overlap { start: f64, end: f64, conflict: usize },
    #[error("invalid range: end {end:.3}s must be after start {start:.3}s")]
    InvalidRange { start: f64, end: f64 },
    #[error("no lyric line at index {index} (timeline has {len})")]
    LineNotFound { index: usize, len: usize },
    /// The caller edited against an outdated view of the timeline.
    #[error("timeline revision {expected} is stale; current revision is {current}")]
    StaleRevision { expected: u64, current: u64 },
    #[error("stage `{running}` is already running")]
    AlreadyRunning { running: StageName },
    #[error("cannot start `{requested}`: {reason}")]
    StageSequence { requested: StageName, reason: String },
    /// Timeline edits are refused while a stage executes.
    #[error("pipeline is busy running `{running}`")]
    PipelineBusy { running: StageName },
    #[error("no stage is running")]
    NotRunning,
    #[error(transparent)]
    StageExecution(#[from] StageError),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl KaraokeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<&str> for KaraokeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for KaraokeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Failure reported by an external collaborator while a stage executes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("vocal separation failed: {0}")]
    Separation(String),
    #[error("transcription failed: {0}")]
    Transcription(String),
    #[error("encoding failed: {0}")]
    Encoding(String),
    #[error("stage `{stage}` panicked: {message}")]
    Panicked { stage: StageName, message: String },
}

impl StageError {
    /// Human-readable text stored in the progress record. Collaborator errors
    /// carry their own message verbatim so clients see what the tool said.
    pub fn client_message(&self) -> String {
        match self {
            Self::Download(message)
            | Self::Separation(message)
            | Self::Transcription(message)
            | Self::Encoding(message) => message.clone(),
            Self::Panicked { .. } => self.to_string(),
        }
    }
}
