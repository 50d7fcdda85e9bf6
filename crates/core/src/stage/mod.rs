//! Stage catalogue, the artifacts stages exchange, and the seams behind which
//! the external tools live.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::StageError,
    progress::StageReporter,
    render::{self, FrameState},
    timeline::{LineEntry, TimelineSnapshot, TranscriptSegment},
    KaraokeError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Download,
    Separate,
    Extract,
    Generate,
}

impl StageName {
    pub const ALL: [StageName; 4] = [
        StageName::Download,
        StageName::Separate,
        StageName::Extract,
        StageName::Generate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Separate => "separate",
            Self::Extract => "extract",
            Self::Generate => "generate",
        }
    }

    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    pub fn descriptor(&self) -> &'static StageDescriptor {
        &STAGES[self.ordinal()]
    }

    pub fn is_terminal(&self) -> bool {
        self.descriptor().terminal
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = KaraokeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| KaraokeError::validation(format!("unknown stage `{value}`")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    SourceReference,
    Audio,
    SeparatedTracks,
    LyricTimeline,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageDescriptor {
    pub name: StageName,
    pub ordinal: usize,
    pub input: ArtifactKind,
    pub output: ArtifactKind,
    pub terminal: bool,
}

pub const STAGES: [StageDescriptor; 4] = [
    StageDescriptor {
        name: StageName::Download,
        ordinal: 0,
        input: ArtifactKind::SourceReference,
        output: ArtifactKind::Audio,
        terminal: false,
    },
    StageDescriptor {
        name: StageName::Separate,
        ordinal: 1,
        input: ArtifactKind::Audio,
        output: ArtifactKind::SeparatedTracks,
        terminal: false,
    },
    StageDescriptor {
        name: StageName::Extract,
        ordinal: 2,
        input: ArtifactKind::Audio,
        output: ArtifactKind::LyricTimeline,
        terminal: false,
    },
    StageDescriptor {
        name: StageName::Generate,
        ordinal: 3,
        input: ArtifactKind::LyricTimeline,
        output: ArtifactKind::Video,
        terminal: true,
    },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedAudio {
    pub title: String,
    pub audio_path: PathBuf,
    pub duration_seconds: Option<f64>,
    pub artist: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeparatedTracks {
    pub vocals: PathBuf,
    pub instrumental: PathBuf,
}

/// Transcriber output before it is normalised into a timeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub language: Option<String>,
    /// Whole transcription as one string, as the model produced it.
    #[serde(default)]
    pub full_text: String,
    pub segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LyricsOrigin {
    Transcribed,
    Imported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedLyrics {
    pub origin: LyricsOrigin,
    pub language: Option<String>,
    /// Unromanised transcript text, or the imported lines joined by spaces.
    #[serde(default)]
    pub full_text: String,
    pub lines: Vec<LineEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoArtifact {
    pub output_path: PathBuf,
}

/// What a completed stage hands to the next one. Also published as the
/// progress record's `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StageOutput {
    Download(DownloadedAudio),
    Separate(SeparatedTracks),
    Extract(ExtractedLyrics),
    Generate(VideoArtifact),
}

impl StageOutput {
    pub fn stage(&self) -> StageName {
        match self {
            Self::Download(_) => StageName::Download,
            Self::Separate(_) => StageName::Separate,
            Self::Extract(_) => StageName::Extract,
            Self::Generate(_) => StageName::Generate,
        }
    }

    /// One-line summary used as the completion message.
    pub fn summary(&self) -> String {
        match self {
            Self::Download(audio) => format!("Downloaded: {}", audio.title),
            Self::Separate(_) => "Vocals separated successfully".to_string(),
            Self::Extract(lyrics) => format!("Extracted {} lyric lines", lyrics.lines.len()),
            Self::Generate(video) => {
                format!("Karaoke video generated: {}", video.output_path.display())
            }
        }
    }
}

pub trait Downloader: Send + Sync {
    fn download(&self, source: &str, reporter: &StageReporter)
        -> Result<DownloadedAudio, StageError>;
}

pub trait Separator: Send + Sync {
    fn separate(
        &self,
        audio: &DownloadedAudio,
        reporter: &StageReporter,
    ) -> Result<SeparatedTracks, StageError>;
}

pub trait Transcriber: Send + Sync {
    fn transcribe(&self, audio: &Path, reporter: &StageReporter)
        -> Result<Transcript, StageError>;
}

pub trait Encoder: Send + Sync {
    fn encode(&self, job: &EncodeJob, reporter: &StageReporter)
        -> Result<VideoArtifact, StageError>;
}

/// Everything an [`Encoder`] needs to produce the final video.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub timeline: TimelineSnapshot,
    pub instrumental: PathBuf,
    pub output_path: PathBuf,
    pub title: String,
}

impl EncodeJob {
    /// Per-frame access to the frame state resolver.
    pub fn resolve(&self, time: f64) -> FrameState {
        render::resolve(&self.timeline, time)
    }
}
