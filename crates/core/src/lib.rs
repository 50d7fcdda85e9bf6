//! Core library for the karaoke maker.
//!
//! A job moves through four stages (download, separate, extract, generate).
//! The [`Pipeline`] owns the stage artifacts, the editable [`LyricTimeline`]
//! and the [`ProgressTracker`] that clients poll. Frame rendering reads the
//! timeline through [`render::resolve`]. The external tools sit behind the
//! traits in [`stage`], with command-line adapters in [`tools`] and
//! [`record`].

pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod render;
pub mod romanize;
pub mod stage;
pub mod subtitle;
pub mod timeline;
pub mod tools;

pub use config::AppConfig;
pub use error::{KaraokeError, Result, StageError};
pub use pipeline::{
    output_file_name, Collaborators, EditOutcome, Pipeline, PipelineSettings, PipelineState,
    StageInput, StageTicket,
};
pub use progress::{ProgressRecord, ProgressStatus, ProgressTracker, StageReporter};
pub use record::{FfmpegEncoder, RecordingSettings};
pub use render::{FrameCanvas, FrameClock, FrameState, Palette};
pub use stage::{StageName, StageOutput};
pub use subtitle::{load_lyrics, LyricsDocument};
pub use timeline::{LineEntry, LineUpdate, LyricTimeline, TimelineSnapshot};
