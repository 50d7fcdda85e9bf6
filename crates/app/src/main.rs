use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use chrono::Local;
use clap::{Parser, Subcommand};
use karaoke_maker_core::{
    output_file_name,
    render::{self, FrameClock},
    stage::{EncodeJob, Encoder},
    tools, AppConfig, FfmpegEncoder, KaraokeError, LyricTimeline, LyricsDocument, Pipeline,
    PipelineSettings, ProgressRecord, ProgressStatus, ProgressTracker, RecordingSettings,
    StageName, StageOutput, StageReporter, StageTicket,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> karaoke_maker_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Make {
            source,
            lyrics,
            romanize,
        } => {
            config.transcription.romanize |= romanize;
            run_make(&config, &source, lyrics.as_deref())
        }
        Commands::Render {
            audio,
            lyrics,
            output,
            title,
        } => run_render(&config, &audio, &lyrics, output, title),
        Commands::Import { input, output } => run_import(&input, &output),
        Commands::Inspect { lyrics, at, fps } => run_inspect(&lyrics, &at, fps),
    }
}

fn load_config(path: Option<&Path>) -> karaoke_maker_core::Result<AppConfig> {
    match path {
        Some(path) => {
            let mut config = AppConfig::load(path)?;
            config.apply_env_overrides();
            Ok(config)
        }
        None => Ok(AppConfig::from_env_or_default()),
    }
}

fn run_make(
    config: &AppConfig,
    source: &str,
    lyrics: Option<&Path>,
) -> karaoke_maker_core::Result<()> {
    tracing::info!(source, ?lyrics, "making karaoke video");
    config.ensure_dirs()?;

    let pipeline = Pipeline::new(
        tools::collaborators(config),
        PipelineSettings::from_config(config),
    );

    follow(&pipeline, pipeline.download(source)?)?;
    follow(&pipeline, pipeline.separate()?)?;
    match lyrics {
        Some(path) => {
            let lines = karaoke_maker_core::load_lyrics(path)?;
            let revision = pipeline.import_lyrics(None, lines)?;
            tracing::info!(?path, revision, "imported lyrics");
        }
        None => {
            follow(&pipeline, pipeline.extract()?)?;
        }
    }
    let record = follow(&pipeline, pipeline.generate()?)?;

    if let Some(StageOutput::Generate(video)) = &record.result {
        println!("{}", video.output_path.display());
    }
    Ok(())
}

/// Polls the progress record until the stage settles, logging every change.
fn follow(
    pipeline: &Pipeline,
    ticket: StageTicket,
) -> karaoke_maker_core::Result<ProgressRecord> {
    tracing::info!(stage = %ticket.stage, job_id = %ticket.job_id, "stage accepted");

    let mut last_seen: Option<(u8, String)> = None;
    loop {
        let record = pipeline.current_progress();
        let seen = (record.percent, record.message.clone());
        if last_seen.as_ref() != Some(&seen) {
            tracing::info!(stage = %ticket.stage, progress = record.percent, "{}", record.message);
            last_seen = Some(seen);
        }
        if !record.is_running() {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    let record = pipeline.wait()?;
    match record.status {
        ProgressStatus::Complete => Ok(record),
        _ => Err(KaraokeError::msg(format!(
            "{} failed: {}",
            ticket.stage,
            record.error.as_deref().unwrap_or("unknown error")
        ))),
    }
}

fn run_render(
    config: &AppConfig,
    audio: &Path,
    lyrics: &Path,
    output: Option<PathBuf>,
    title: Option<String>,
) -> karaoke_maker_core::Result<()> {
    let timeline = LyricTimeline::from_entries(karaoke_maker_core::load_lyrics(lyrics)?)?;
    if timeline.is_empty() {
        return Err(KaraokeError::validation("lyrics file contains no lines"));
    }

    let title = title.unwrap_or_else(|| {
        audio
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let output_path = match output {
        Some(path) => path,
        None => {
            config.ensure_dirs()?;
            config
                .paths
                .output_dir
                .join(output_file_name(&title, Local::now().naive_local()))
        }
    };
    tracing::info!(?audio, ?output_path, lines = timeline.len(), "rendering video");

    let job = EncodeJob {
        timeline: timeline.all(),
        instrumental: audio.to_path_buf(),
        output_path,
        title,
    };
    let tracker = ProgressTracker::new(Uuid::new_v4());
    tracker.begin(tracker.snapshot().job_id, StageName::Generate, "Generating video...");
    let reporter = StageReporter::new(StageName::Generate, tracker);

    let encoder = FfmpegEncoder::new(RecordingSettings::from_config(config));
    let video = encoder.encode(&job, &reporter)?;
    println!("{}", video.output_path.display());
    Ok(())
}

fn run_import(input: &Path, output: &Path) -> karaoke_maker_core::Result<()> {
    let lines = karaoke_maker_core::load_lyrics(input)?;
    // Reject overlapping cues before writing anything.
    let timeline = LyricTimeline::from_entries(lines)?;
    LyricsDocument::new(timeline.entries().to_vec()).save(output)?;
    tracing::info!(?input, ?output, lines = timeline.len(), "lyrics imported");
    Ok(())
}

fn run_inspect(lyrics: &Path, at: &[f64], fps: u32) -> karaoke_maker_core::Result<()> {
    let timeline = LyricTimeline::from_entries(karaoke_maker_core::load_lyrics(lyrics)?)?;

    if !at.is_empty() {
        for &time in at {
            let state = render::resolve(&timeline, time);
            println!("{}", serde_json::json!({ "time": time, "state": state }));
        }
        return Ok(());
    }

    let duration = timeline.entries().last().map_or(0.0, |line| line.end);
    for (frame, time, state) in FrameClock::new(fps, duration).frames(timeline.entries()) {
        println!(
            "{}",
            serde_json::json!({ "frame": frame, "time": time, "state": state })
        );
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Turn songs into karaoke videos", long_about = None)]
struct Cli {
    /// JSON config file; missing fields keep their defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download, separate, transcribe and render a song end to end.
    Make {
        /// URL (or anything yt-dlp accepts) of the song.
        source: String,
        /// Use this SRT/ASS/JSON lyrics file instead of transcribing.
        #[arg(short, long)]
        lyrics: Option<PathBuf>,
        /// Write Indic-script lyrics in Latin letters.
        #[arg(long)]
        romanize: bool,
    },
    /// Render a video from an existing instrumental track and lyrics file.
    Render {
        /// Instrumental audio to put under the lyrics.
        audio: PathBuf,
        lyrics: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Title used for the output file name; defaults to the audio file name.
        #[arg(short, long)]
        title: Option<String>,
    },
    /// Convert an SRT or ASS subtitle file to the JSON lyrics document.
    Import { input: PathBuf, output: PathBuf },
    /// Print the resolved frame state at the given times, or for every frame.
    Inspect {
        lyrics: PathBuf,
        /// Time in seconds; may be repeated.
        #[arg(long)]
        at: Vec<f64>,
        #[arg(long, default_value_t = 30)]
        fps: u32,
    },
}
