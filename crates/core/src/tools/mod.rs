//! Command-line adapters for the external collaborators.
//!
//! Each adapter shells out to the tool named in [`ToolsConfig`] and turns a
//! non-zero exit or missing output into the matching [`StageError`].

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use serde::Deserialize;

use crate::{
    config::{AppConfig, ToolsConfig},
    error::StageError,
    pipeline::Collaborators,
    progress::StageReporter,
    record::{FfmpegEncoder, RecordingSettings},
    stage::{DownloadedAudio, Downloader, SeparatedTracks, Separator, Transcriber, Transcript},
    timeline::TranscriptSegment,
};

/// Wires every adapter from the application config.
pub fn collaborators(config: &AppConfig) -> Collaborators {
    Collaborators {
        downloader: Box::new(YtDlpDownloader::from_config(config)),
        separator: Box::new(DemucsSeparator::from_config(config)),
        transcriber: Box::new(WhisperTranscriber::from_config(config)),
        encoder: Box::new(FfmpegEncoder::new(RecordingSettings::from_config(config))),
    }
}

/// Fetches the best audio stream of a URL and converts it to 320 kbps MP3.
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    program: PathBuf,
    output_dir: PathBuf,
}

impl YtDlpDownloader {
    pub fn new(program: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.tools.yt_dlp, &config.paths.temp_dir)
    }
}

impl Downloader for YtDlpDownloader {
    fn download(
        &self,
        source: &str,
        reporter: &StageReporter,
    ) -> Result<DownloadedAudio, StageError> {
        fs::create_dir_all(&self.output_dir).map_err(|err| {
            StageError::Download(format!("cannot create {}: {err}", self.output_dir.display()))
        })?;
        reporter.report(5, "Downloading audio...");

        let mut command = Command::new(&self.program);
        command
            .args(["--no-playlist", "--no-simulate", "--restrict-filenames"])
            .args(["--extract-audio", "--audio-format", "mp3", "--audio-quality", "320K"])
            .arg("--output")
            .arg(self.output_dir.join("%(title)s.%(ext)s"))
            .args(["--print", "%(title)s", "--print", "%(duration)s"])
            .args(["--print", "%(uploader)s"])
            .args(["--print", "after_move:filepath"])
            .arg(source);
        let stdout = run(command, StageError::Download)?;

        let audio = parse_download_output(&stdout).map_err(StageError::Download)?;
        tracing::info!(
            title = %audio.title,
            path = %audio.audio_path.display(),
            "downloaded audio"
        );
        reporter.report(100, format!("Downloaded: {}", audio.title));
        Ok(audio)
    }
}

/// Splits vocals from accompaniment with Demucs' two-stem mode.
#[derive(Debug, Clone)]
pub struct DemucsSeparator {
    program: PathBuf,
    output_dir: PathBuf,
    model: String,
    device: String,
}

impl DemucsSeparator {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            program: config.tools.demucs.clone(),
            output_dir: config.paths.temp_dir.clone(),
            model: config.separation.model.clone(),
            device: config.separation.device.clone(),
        }
    }
}

impl Separator for DemucsSeparator {
    fn separate(
        &self,
        audio: &DownloadedAudio,
        reporter: &StageReporter,
    ) -> Result<SeparatedTracks, StageError> {
        if !audio.audio_path.exists() {
            return Err(StageError::Separation(format!(
                "audio file not found: {}",
                audio.audio_path.display()
            )));
        }
        reporter.report(5, format!("Separating vocals with {}...", self.model));

        let mut command = Command::new(&self.program);
        command
            .args(["--two-stems", "vocals", "--mp3", "--mp3-bitrate", "320"])
            .arg("--out")
            .arg(&self.output_dir)
            .args(["--device", self.device.as_str(), "--name", self.model.as_str()])
            .arg(&audio.audio_path);
        run(command, StageError::Separation)?;

        let tracks = locate_stems(&self.output_dir, &self.model, &audio.audio_path)?;
        reporter.report(100, "Vocals separated successfully");
        Ok(tracks)
    }
}

/// Demucs writes `<out>/<model>/<track stem>/{vocals,no_vocals}.{mp3,wav}`.
pub fn locate_stems(
    output_dir: &Path,
    model: &str,
    audio: &Path,
) -> Result<SeparatedTracks, StageError> {
    let stem = audio.file_stem().unwrap_or_default();
    let dir = output_dir.join(model).join(stem);
    let pick = |name: &str| {
        ["mp3", "wav"]
            .iter()
            .map(|ext| dir.join(format!("{name}.{ext}")))
            .find(|path| path.is_file())
    };

    match (pick("vocals"), pick("no_vocals")) {
        (Some(vocals), Some(instrumental)) => Ok(SeparatedTracks { vocals, instrumental }),
        _ => Err(StageError::Separation(format!(
            "separated files not found in {}",
            dir.display()
        ))),
    }
}

/// Runs the Whisper CLI and reads back its JSON transcript.
#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    program: PathBuf,
    output_dir: PathBuf,
    model: String,
    language: Option<String>,
}

impl WhisperTranscriber {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            program: config.tools.whisper.clone(),
            output_dir: config.paths.temp_dir.join("transcripts"),
            model: config.transcription.model.clone(),
            language: config.transcription.language.clone(),
        }
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&self, audio: &Path, reporter: &StageReporter) -> Result<Transcript, StageError> {
        fs::create_dir_all(&self.output_dir)
            .map_err(|err| StageError::Transcription(err.to_string()))?;
        reporter.report(5, format!("Transcribing with whisper `{}`...", self.model));

        let mut command = Command::new(&self.program);
        command
            .arg(audio)
            .args(["--model", self.model.as_str(), "--output_format", "json"])
            .args(["--word_timestamps", "True", "--verbose", "False"])
            .arg("--output_dir")
            .arg(&self.output_dir);
        if let Some(language) = &self.language {
            command.args(["--language", language.as_str()]);
        }
        run(command, StageError::Transcription)?;

        let stem = audio.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = self.output_dir.join(format!("{stem}.json"));
        let raw = fs::read_to_string(&json_path).map_err(|err| {
            StageError::Transcription(format!("cannot read {}: {err}", json_path.display()))
        })?;
        let transcript = parse_whisper_json(&raw)?;
        tracing::info!(
            segments = transcript.segments.len(),
            language = transcript.language.as_deref().unwrap_or("unknown"),
            "transcription complete"
        );
        reporter.report(100, format!("Transcribed {} segments", transcript.segments.len()));
        Ok(transcript)
    }
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
}

pub fn parse_whisper_json(raw: &str) -> Result<Transcript, StageError> {
    let output: WhisperOutput = serde_json::from_str(raw)
        .map_err(|err| StageError::Transcription(format!("malformed whisper output: {err}")))?;
    Ok(Transcript {
        language: output.language,
        full_text: output.text,
        segments: output.segments,
    })
}

/// Duration of a media file in seconds, as reported by ffprobe.
pub fn media_duration(tools: &ToolsConfig, media: &Path) -> Result<f64, StageError> {
    let mut command = Command::new(&tools.ffprobe);
    command
        .args(["-v", "error", "-show_entries", "format=duration"])
        .args(["-of", "default=noprint_wrappers=1:nokey=1"])
        .arg(media);
    let stdout = run(command, StageError::Encoding)?;
    stdout
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|duration| duration.is_finite() && *duration > 0.0)
        .ok_or_else(|| {
            StageError::Encoding(format!("ffprobe reported no duration for {}", media.display()))
        })
}

/// Runs `command` to completion and returns its stdout.
pub(crate) fn run(
    mut command: Command,
    fail: fn(String) -> StageError,
) -> Result<String, StageError> {
    let program = command.get_program().to_string_lossy().into_owned();
    tracing::debug!(?command, "running external tool");

    let output = command
        .output()
        .map_err(|err| fail(format!("could not run `{program}`: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(fail(format!(
            "`{program}` exited with {}: {}",
            output.status,
            last_line(&stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no output")
}

/// yt-dlp prints title, duration and uploader before downloading and the
/// final file path after post-processing.
fn parse_download_output(stdout: &str) -> Result<DownloadedAudio, String> {
    let lines: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let [title, duration, uploader, .., path] = lines.as_slice() else {
        return Err(format!("unexpected yt-dlp output: {stdout:?}"));
    };
    let known = |value: &str| (value != "NA").then(|| value.to_string());

    Ok(DownloadedAudio {
        title: title.to_string(),
        audio_path: PathBuf::from(path),
        duration_seconds: duration.parse().ok(),
        artist: known(uploader),
    })
}
