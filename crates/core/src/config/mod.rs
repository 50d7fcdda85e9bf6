use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{render::Palette, Result};

pub const OUTPUT_DIR_ENV: &str = "KARAOKE_OUTPUT_DIR";
pub const TEMP_DIR_ENV: &str = "KARAOKE_TEMP_DIR";

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub video: VideoConfig,
    pub separation: SeparationConfig,
    pub transcription: TranscriptionConfig,
    pub tools: ToolsConfig,
}

impl AppConfig {
    /// Reads a JSON config file. Missing sections and fields keep their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Defaults with the directory overrides from the environment applied.
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = env::var_os(OUTPUT_DIR_ENV).filter(|value| !value.is_empty()) {
            self.paths.output_dir = dir.into();
        }
        if let Some(dir) = env::var_os(TEMP_DIR_ENV).filter(|value| !value.is_empty()) {
            self.paths.temp_dir = dir.into();
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.temp_dir)?;
        fs::create_dir_all(&self.paths.output_dir)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Scratch space for downloads and separated stems.
    pub temp_dir: PathBuf,
    /// Where finished videos are written.
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let output_dir = directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("karaoke-output"));
        Self {
            temp_dir: env::temp_dir().join("karaoke-temp"),
            output_dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: String,
    pub codec: String,
    pub audio_codec: String,
    pub font_size: u32,
    pub font_color: [u8; 3],
    pub highlight_color: [u8; 3],
    pub background_color: [u8; 3],
}

impl VideoConfig {
    pub fn palette(&self) -> Palette {
        Palette {
            background: self.background_color,
            text: self.font_color,
            highlight: self.highlight_color,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate: "5000k".to_string(),
            codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            font_size: 72,
            font_color: [255, 255, 255],
            highlight_color: [255, 255, 0],
            background_color: [0, 0, 0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    /// Demucs model name, e.g. `htdemucs` or `htdemucs_ft`.
    pub model: String,
    /// `cpu` or `cuda`.
    pub device: String,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            model: "htdemucs".to_string(),
            device: "cpu".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub model: String,
    /// Language code such as `en` or `bn`; `None` lets the model detect it.
    pub language: Option<String>,
    /// Write Indic-script lyrics (Bengali, Hindi, Tamil, ...) in Latin letters.
    pub romanize: bool,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model: "small".to_string(),
            language: None,
            romanize: false,
        }
    }
}

/// Executables invoked by the stage adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub yt_dlp: PathBuf,
    pub demucs: PathBuf,
    pub whisper: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            yt_dlp: "yt-dlp".into(),
            demucs: "demucs".into(),
            whisper: "whisper".into(),
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
        }
    }
}
