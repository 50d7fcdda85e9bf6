use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use serde::{Deserialize, Serialize};

use crate::{
    config::{AppConfig, ToolsConfig},
    error::StageError,
    progress::StageReporter,
    render::{FrameCanvas, FrameClock, Palette},
    stage::{EncodeJob, Encoder, VideoArtifact},
    subtitle::{to_karaoke_ass, KaraokeStyle},
    tools::{last_line, media_duration},
};

/// Colour of the next-line preview.
const PREVIEW_GREY: [u8; 3] = [180, 180, 180];

/// Configuration options for the video encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSettings {
    pub tools: ToolsConfig,
    /// Scratch directory for the subtitle sidecar.
    pub work_dir: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: String,
    pub codec: String,
    pub audio_codec: String,
    /// Font size in output pixels.
    pub font_size: u32,
    pub palette: Palette,
}

impl RecordingSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let video = &config.video;
        Self {
            tools: config.tools.clone(),
            work_dir: config.paths.temp_dir.clone(),
            width: video.width,
            height: video.height,
            fps: video.fps,
            bitrate: video.bitrate.clone(),
            codec: video.codec.clone(),
            audio_codec: video.audio_codec.clone(),
            font_size: video.font_size,
            palette: video.palette(),
        }
    }

    fn karaoke_style(&self) -> KaraokeStyle {
        KaraokeStyle {
            width: self.width,
            height: self.height,
            font_size: self.font_size,
            text: self.palette.text,
            highlight: self.palette.highlight,
            preview: PREVIEW_GREY,
        }
    }
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Pipes painted frames into FFmpeg, burns the karaoke lyrics in with the
/// `subtitles` filter and muxes the instrumental track.
#[derive(Debug, Clone, Default)]
pub struct FfmpegEncoder {
    settings: RecordingSettings,
}

impl FfmpegEncoder {
    pub fn new(settings: RecordingSettings) -> Self {
        Self { settings }
    }

    fn command(&self, job: &EncodeJob, subtitles: &Path) -> Command {
        let s = &self.settings;
        let filter = format!("subtitles=filename={}", escape_filter_path(subtitles));

        let mut command = Command::new(&s.tools.ffmpeg);
        command
            .args(["-y", "-loglevel", "error", "-nostats"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", format!("{}x{}", s.width, s.height).as_str()])
            .args(["-r", s.fps.to_string().as_str(), "-i", "-"])
            .arg("-i")
            .arg(&job.instrumental)
            .args(["-vf", filter.as_str(), "-map", "0:v", "-map", "1:a"])
            .args(["-c:v", s.codec.as_str(), "-b:v", s.bitrate.as_str()])
            .args(["-pix_fmt", "yuv420p"])
            .args(["-c:a", s.audio_codec.as_str(), "-shortest"])
            .arg(&job.output_path);
        command
    }
}

impl Encoder for FfmpegEncoder {
    fn encode(
        &self,
        job: &EncodeJob,
        reporter: &StageReporter,
    ) -> Result<VideoArtifact, StageError> {
        let s = &self.settings;
        let io_error =
            |context: &str, err: std::io::Error| StageError::Encoding(format!("{context}: {err}"));

        reporter.report(5, "Reading instrumental duration...");
        let duration = media_duration(&s.tools, &job.instrumental)?;

        fs::create_dir_all(&s.work_dir).map_err(|err| io_error("cannot create work dir", err))?;
        let subtitles = Sidecar(
            s.work_dir
                .join(format!("lyrics_rev{}.ass", job.timeline.revision())),
        );
        fs::write(&subtitles.0, to_karaoke_ass(&job.timeline, &s.karaoke_style()))
            .map_err(|err| io_error("cannot write subtitles", err))?;
        if let Some(parent) = job.output_path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error("cannot create output dir", err))?;
        }

        reporter.report(10, "Rendering frames...");
        let mut child = self
            .command(job, &subtitles.0)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| io_error("could not start ffmpeg", err))?;

        let clock = FrameClock::new(s.fps, duration);
        let total = clock.frame_count().max(1);
        let mut canvas = FrameCanvas::new(s.width, s.height, s.palette);
        let mut reported = 10;
        let mut write_failure = None;

        if let Some(stdin) = child.stdin.take() {
            let mut sink = BufWriter::new(stdin);
            for (frame, _, state) in clock.frames(&job.timeline) {
                if let Err(err) = sink.write_all(canvas.paint(&state)) {
                    write_failure = Some(err);
                    break;
                }
                let percent = 10 + ((frame + 1) * 85 / total) as u32;
                if percent > reported {
                    reported = percent;
                    reporter.report(percent, format!("Rendering frame {} of {total}", frame + 1));
                }
            }
            if write_failure.is_none() {
                write_failure = sink.flush().err();
            }
            // Dropping the writer closes stdin so ffmpeg can finish.
        }

        reporter.report(95, "Finalising video...");
        let output = child
            .wait_with_output()
            .map_err(|err| io_error("ffmpeg did not finish", err))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StageError::Encoding(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                last_line(&stderr)
            )));
        }
        if let Some(err) = write_failure {
            return Err(io_error("ffmpeg closed its input early", err));
        }

        tracing::info!(path = %job.output_path.display(), frames = total, "video encoded");
        Ok(VideoArtifact {
            output_path: job.output_path.clone(),
        })
    }
}

/// Subtitle script that is deleted however encoding ends.
struct Sidecar(PathBuf);

impl Drop for Sidecar {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.0) {
            tracing::debug!(path = %self.0.display(), %err, "could not remove subtitle sidecar");
        }
    }
}

/// Escapes a path for use as a filter option value.
fn escape_filter_path(path: &Path) -> String {
    let mut out = String::new();
    for c in path.to_string_lossy().chars() {
        match c {
            '\\' => out.push('/'),
            ':' | '\'' | ',' | '[' | ']' | ';' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
