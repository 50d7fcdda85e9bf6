//! Single-job stage pipeline.
//!
//! One stage runs at a time on its own worker thread. The foreground keeps
//! serving status polls and, while nothing runs, timeline edits. Workers
//! report through the shared [`ProgressTracker`]; their failures never
//! propagate out of the thread and are only visible through the next poll.
//!
//! Stages must complete in order. Re-running an earlier stage whose
//! downstream work already exists requires [`StageInput::force`] and marks
//! that downstream work stale; stale artifacts are kept but no longer satisfy
//! prerequisites. Running stages cannot be cancelled.

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
};

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    error::StageError,
    progress::{ProgressRecord, ProgressTracker, StageReporter},
    romanize,
    stage::{
        DownloadedAudio, Downloader, EncodeJob, Encoder, ExtractedLyrics, LyricsOrigin, Separator,
        StageName, StageOutput, Transcriber,
    },
    timeline::{normalize_segments, LineEntry, LineUpdate, LyricTimeline, TimelineSnapshot},
    KaraokeError, Result,
};

/// The external tools a pipeline drives.
pub struct Collaborators {
    pub downloader: Box<dyn Downloader>,
    pub separator: Box<dyn Separator>,
    pub transcriber: Box<dyn Transcriber>,
    pub encoder: Box<dyn Encoder>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Directory receiving generated videos.
    pub output_dir: PathBuf,
    /// Romanise Indic-script transcripts during Extract.
    pub romanize: bool,
}

impl PipelineSettings {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            romanize: false,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            output_dir: config.paths.output_dir.clone(),
            romanize: config.transcription.romanize,
        }
    }
}

/// Arguments for [`Pipeline::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageInput {
    pub source: Option<String>,
    pub force: bool,
}

impl StageInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            force: false,
        }
    }

    /// Allows re-running a stage even though later stages already completed.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Acceptance returned by the stage endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageTicket {
    pub job_id: Uuid,
    pub stage: StageName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EditOutcome {
    pub index: usize,
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "lowercase")]
pub enum PipelineState {
    /// Nothing runs; `next` is the first stage without a fresh artifact.
    Idle { next: StageName },
    Running(StageName),
    /// Every stage, including the terminal one, has a fresh artifact.
    Finished,
}

pub struct Pipeline {
    shared: Arc<Shared>,
}

struct Shared {
    collaborators: Collaborators,
    settings: PipelineSettings,
    progress: ProgressTracker,
    control: Mutex<Control>,
    timeline: Mutex<LyricTimeline>,
}

struct Control {
    job_id: Uuid,
    artifacts: [Option<ArtifactSlot>; 4],
    worker: Option<JoinHandle<()>>,
}

struct ArtifactSlot {
    output: StageOutput,
    stale: bool,
}

enum Work {
    Download { source: String },
    Separate { audio: DownloadedAudio },
    Extract { audio: PathBuf, romanize: bool },
    Generate(EncodeJob),
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, settings: PipelineSettings) -> Self {
        let job_id = Uuid::new_v4();
        Self {
            shared: Arc::new(Shared {
                collaborators,
                settings,
                progress: ProgressTracker::new(job_id),
                control: Mutex::new(Control {
                    job_id,
                    artifacts: Default::default(),
                    worker: None,
                }),
                timeline: Mutex::new(LyricTimeline::new()),
            }),
        }
    }

    pub fn download(&self, source: impl Into<String>) -> Result<StageTicket> {
        self.start(StageName::Download, StageInput::source(source))
    }

    pub fn separate(&self) -> Result<StageTicket> {
        self.start(StageName::Separate, StageInput::new())
    }

    pub fn extract(&self) -> Result<StageTicket> {
        self.start(StageName::Extract, StageInput::new())
    }

    pub fn generate(&self) -> Result<StageTicket> {
        self.start(StageName::Generate, StageInput::new())
    }

    /// Starts `stage` on a worker thread and returns immediately.
    ///
    /// Checks run before any state changes, in this order: prerequisites
    /// ([`KaraokeError::StageSequence`]), a stage already in flight
    /// ([`KaraokeError::AlreadyRunning`]), downstream work that a re-run
    /// would invalidate (`StageSequence` unless forced), then the stage's own
    /// input.
    pub fn start(&self, stage: StageName, input: StageInput) -> Result<StageTicket> {
        let mut control = self.shared.lock_control()?;
        control.check_prerequisites(stage)?;
        if let Some(running) = self.shared.progress.snapshot().running_stage() {
            return Err(KaraokeError::AlreadyRunning { running });
        }
        control.check_downstream(stage, input.force)?;

        // Held until the worker is marked running so no edit can slip in
        // between the generation snapshot and the status change.
        let timeline = self.shared.lock_timeline()?;
        let work = self.prepare(&control, &timeline, stage, input)?;

        if let Some(previous) = control.worker.take() {
            // The previous worker already published its outcome under the
            // control lock we now hold; it is only unwinding its thread.
            let _ = previous.join();
        }

        let job_id = control.job_id;
        self.shared.progress.begin(job_id, stage, starting_message(stage));
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("stage-{stage}"))
            .spawn(move || run_worker(shared, stage, work));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                let _ = self.shared.progress.fail(format!("could not start worker: {err}"));
                return Err(err.into());
            }
        };
        drop(timeline);

        control.invalidate_from(stage);
        control.worker = Some(handle);
        tracing::info!(%job_id, %stage, "stage accepted");
        Ok(StageTicket { job_id, stage })
    }

    /// Copy of the live progress record.
    pub fn current_progress(&self) -> ProgressRecord {
        self.shared.progress.snapshot()
    }

    pub fn state(&self) -> Result<PipelineState> {
        let control = self.shared.lock_control()?;
        if let Some(stage) = self.shared.progress.snapshot().running_stage() {
            return Ok(PipelineState::Running(stage));
        }
        Ok(match control.next_stage() {
            Some(next) => PipelineState::Idle { next },
            None => PipelineState::Finished,
        })
    }

    /// Fresh output of `stage`, if it completed and was not invalidated.
    pub fn artifact(&self, stage: StageName) -> Result<Option<StageOutput>> {
        let control = self.shared.lock_control()?;
        Ok(control.fresh(stage).cloned())
    }

    /// Blocks until the current worker, if any, has exited and returns the
    /// settled progress record.
    pub fn wait(&self) -> Result<ProgressRecord> {
        let worker = self.shared.lock_control()?.worker.take();
        if let Some(handle) = worker {
            handle
                .join()
                .map_err(|_| KaraokeError::msg("stage worker terminated abnormally"))?;
        }
        Ok(self.current_progress())
    }

    /// Starts a new job: artifacts, timeline and progress are cleared.
    pub fn reset(&self) -> Result<Uuid> {
        let mut control = self.shared.lock_control()?;
        self.shared.ensure_idle()?;
        if let Some(previous) = control.worker.take() {
            let _ = previous.join();
        }
        let job_id = Uuid::new_v4();
        control.job_id = job_id;
        control.artifacts = Default::default();
        self.shared.lock_timeline()?.clear();
        self.shared.progress.reset(job_id);
        tracing::info!(%job_id, "pipeline reset");
        Ok(job_id)
    }

    pub fn timeline(&self) -> Result<TimelineSnapshot> {
        Ok(self.shared.lock_timeline()?.all())
    }

    pub fn insert_line(
        &self,
        expected_revision: Option<u64>,
        entry: LineEntry,
    ) -> Result<EditOutcome> {
        self.shared
            .edit(expected_revision, |timeline| timeline.insert(entry))
    }

    pub fn update_line(
        &self,
        expected_revision: Option<u64>,
        index: usize,
        update: LineUpdate,
    ) -> Result<EditOutcome> {
        self.shared.edit(expected_revision, |timeline| {
            timeline.update(index, update).map(|()| index)
        })
    }

    pub fn delete_line(
        &self,
        expected_revision: Option<u64>,
        index: usize,
    ) -> Result<EditOutcome> {
        self.shared
            .edit(expected_revision, |timeline| timeline.delete(index).map(|_| index))
    }

    /// Replaces the whole timeline with user-supplied lines. The imported
    /// lyrics count as the Extract stage's output, so every earlier stage must
    /// have completed. A generated video becomes stale.
    pub fn import_lyrics(
        &self,
        expected_revision: Option<u64>,
        lines: Vec<LineEntry>,
    ) -> Result<u64> {
        let mut control = self.shared.lock_control()?;
        let mut timeline = self.shared.lock_timeline()?;
        self.shared.ensure_idle()?;
        control.check_prerequisites(StageName::Extract)?;
        if let Some(expected) = expected_revision {
            timeline.check_revision(expected)?;
        }
        timeline.replace(lines)?;

        let lines = timeline.entries().to_vec();
        let full_text = lines
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        control.artifacts[StageName::Extract.ordinal()] = Some(ArtifactSlot {
            output: StageOutput::Extract(ExtractedLyrics {
                origin: LyricsOrigin::Imported,
                language: None,
                full_text,
                lines,
            }),
            stale: false,
        });
        control.invalidate_from(StageName::Generate);
        tracing::info!(lines = timeline.len(), revision = timeline.revision(), "imported lyrics");
        Ok(timeline.revision())
    }

    fn prepare(
        &self,
        control: &Control,
        timeline: &LyricTimeline,
        stage: StageName,
        input: StageInput,
    ) -> Result<Work> {
        match stage {
            StageName::Download => {
                let source = input
                    .source
                    .map(|source| source.trim().to_string())
                    .filter(|source| !source.is_empty())
                    .ok_or_else(|| KaraokeError::validation("no source provided"))?;
                Ok(Work::Download { source })
            }
            StageName::Separate => Ok(Work::Separate {
                audio: control.downloaded()?.clone(),
            }),
            StageName::Extract => Ok(Work::Extract {
                audio: control.downloaded()?.audio_path.clone(),
                romanize: self.shared.settings.romanize,
            }),
            StageName::Generate => {
                if timeline.is_empty() {
                    return Err(KaraokeError::validation("lyric timeline is empty"));
                }
                let title = control.downloaded()?.title.clone();
                let instrumental = match control.fresh(StageName::Separate) {
                    Some(StageOutput::Separate(tracks)) => tracks.instrumental.clone(),
                    _ => return Err(missing(StageName::Generate, StageName::Separate)),
                };
                let file_name = output_file_name(&title, Local::now().naive_local());
                Ok(Work::Generate(EncodeJob {
                    timeline: timeline.all(),
                    instrumental,
                    output_path: self.shared.settings.output_dir.join(file_name),
                    title,
                }))
            }
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("settings", &self.shared.settings)
            .field("progress", &self.shared.progress.snapshot())
            .finish()
    }
}

impl Shared {
    fn lock_control(&self) -> Result<MutexGuard<'_, Control>> {
        self.control
            .lock()
            .map_err(|_| KaraokeError::msg("pipeline control state has been poisoned"))
    }

    fn lock_timeline(&self) -> Result<MutexGuard<'_, LyricTimeline>> {
        self.timeline
            .lock()
            .map_err(|_| KaraokeError::msg("lyric timeline has been poisoned"))
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.progress.snapshot().running_stage() {
            Some(running) => Err(KaraokeError::PipelineBusy { running }),
            None => Ok(()),
        }
    }

    /// Applies a timeline edit. A successful edit makes any generated video
    /// stale.
    fn edit<F>(&self, expected_revision: Option<u64>, apply: F) -> Result<EditOutcome>
    where
        F: FnOnce(&mut LyricTimeline) -> Result<usize>,
    {
        let mut control = self.lock_control()?;
        let mut timeline = self.lock_timeline()?;
        self.ensure_idle()?;
        if let Some(expected) = expected_revision {
            timeline.check_revision(expected)?;
        }
        let index = apply(&mut timeline)?;
        control.invalidate_from(StageName::Generate);
        Ok(EditOutcome {
            index,
            revision: timeline.revision(),
        })
    }

    /// Publishes a worker's outcome. Artifacts and the terminal status change
    /// together under the control lock so `start` never sees one without the
    /// other.
    fn complete(&self, stage: StageName, outcome: std::result::Result<StageOutput, StageError>) {
        let mut control = self
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let output = match outcome {
            Ok(output) => output,
            Err(error) => {
                tracing::error!(%stage, %error, "stage failed");
                let _ = self.progress.fail(error.client_message());
                return;
            }
        };

        if let StageOutput::Extract(lyrics) = &output {
            let mut timeline = self
                .timeline
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(error) = timeline.replace(lyrics.lines.clone()) {
                tracing::error!(%stage, %error, "transcript produced an invalid timeline");
                let _ = self.progress.fail(error.to_string());
                return;
            }
        }

        let message = output.summary();
        control.artifacts[output.stage().ordinal()] = Some(ArtifactSlot {
            output: output.clone(),
            stale: false,
        });
        if let Err(error) = self.progress.finish(output, message.as_str()) {
            tracing::warn!(%stage, %error, "stage finished while not running");
        }
        tracing::info!(%stage, %message, "stage complete");
    }
}

impl Control {
    fn fresh(&self, stage: StageName) -> Option<&StageOutput> {
        self.artifacts[stage.ordinal()]
            .as_ref()
            .filter(|slot| !slot.stale)
            .map(|slot| &slot.output)
    }

    fn next_stage(&self) -> Option<StageName> {
        StageName::ALL
            .into_iter()
            .find(|&stage| self.fresh(stage).is_none())
    }

    fn downloaded(&self) -> Result<&DownloadedAudio> {
        match self.fresh(StageName::Download) {
            Some(StageOutput::Download(audio)) => Ok(audio),
            _ => Err(KaraokeError::msg("download artifact is missing")),
        }
    }

    fn check_prerequisites(&self, stage: StageName) -> Result<()> {
        match StageName::ALL[..stage.ordinal()]
            .iter()
            .find(|&&earlier| self.fresh(earlier).is_none())
        {
            Some(&earlier) => Err(missing(stage, earlier)),
            None => Ok(()),
        }
    }

    fn check_downstream(&self, stage: StageName, force: bool) -> Result<()> {
        if force {
            return Ok(());
        }
        match StageName::ALL[stage.ordinal() + 1..]
            .iter()
            .find(|&&later| self.fresh(later).is_some())
        {
            Some(later) => Err(KaraokeError::StageSequence {
                requested: stage,
                reason: format!(
                    "re-running would invalidate `{later}`; force the re-run to proceed"
                ),
            }),
            None => Ok(()),
        }
    }

    /// Marks the artifacts of `stage` and everything after it as stale.
    fn invalidate_from(&mut self, stage: StageName) {
        for slot in self.artifacts[stage.ordinal()..].iter_mut().flatten() {
            slot.stale = true;
        }
    }
}

fn missing(requested: StageName, prerequisite: StageName) -> KaraokeError {
    KaraokeError::StageSequence {
        requested,
        reason: format!("`{prerequisite}` has not completed"),
    }
}

fn starting_message(stage: StageName) -> &'static str {
    match stage {
        StageName::Download => "Downloading audio...",
        StageName::Separate => "Separating vocals...",
        StageName::Extract => "Extracting lyrics...",
        StageName::Generate => "Preparing video generation...",
    }
}

fn run_worker(shared: Arc<Shared>, stage: StageName, work: Work) {
    let reporter = StageReporter::new(stage, shared.progress.clone());
    tracing::info!(%stage, "stage started");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        execute(&shared.collaborators, work, &reporter)
    }))
    .unwrap_or_else(|payload| {
        Err(StageError::Panicked {
            stage,
            message: panic_message(&*payload),
        })
    });

    shared.complete(stage, outcome);
}

fn execute(
    tools: &Collaborators,
    work: Work,
    reporter: &StageReporter,
) -> std::result::Result<StageOutput, StageError> {
    match work {
        Work::Download { source } => tools
            .downloader
            .download(&source, reporter)
            .map(StageOutput::Download),
        Work::Separate { audio } => tools
            .separator
            .separate(&audio, reporter)
            .map(StageOutput::Separate),
        Work::Extract { audio, romanize } => {
            let transcript = tools.transcriber.transcribe(&audio, reporter)?;
            let language = transcript.language.as_deref();
            let lines = if romanize && romanize::needs_romanization(language) {
                reporter.report(95, "Romanising lyrics...");
                normalize_segments(&romanize::romanize_segments(&transcript.segments))
            } else {
                normalize_segments(&transcript.segments)
            };
            Ok(StageOutput::Extract(ExtractedLyrics {
                origin: LyricsOrigin::Transcribed,
                language: transcript.language,
                full_text: transcript.full_text.trim().to_string(),
                lines,
            }))
        }
        Work::Generate(job) => tools
            .encoder
            .encode(&job, reporter)
            .map(StageOutput::Generate),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// `<title>_<YYYYmmdd_HHMMSS>_karaoke.mp4`, keeping only alphanumerics,
/// spaces, `-` and `_` from the title.
pub fn output_file_name(title: &str, at: NaiveDateTime) -> String {
    let safe: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let safe = match safe.trim() {
        "" => "karaoke",
        trimmed => trimmed,
    };
    format!("{safe}_{}_karaoke.mp4", at.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
    };

    use chrono::NaiveDate;

    use super::*;
    use crate::{
        progress::ProgressStatus,
        render::FrameClock,
        stage::{SeparatedTracks, Transcript, VideoArtifact},
        timeline::TranscriptSegment,
    };

    /// Scripted stand-in for every external tool.
    #[derive(Default)]
    struct Script {
        gates: Mutex<HashMap<StageName, mpsc::Receiver<()>>>,
        transcription_failures: AtomicUsize,
        panic_in_separation: bool,
        segments: Vec<TranscriptSegment>,
        language: Option<&'static str>,
        frames_with_lyrics: AtomicUsize,
    }

    impl Script {
        fn gate(&self, stage: StageName) -> mpsc::Sender<()> {
            let (tx, rx) = mpsc::channel();
            self.gates.lock().unwrap().insert(stage, rx);
            tx
        }

        fn pass(&self, stage: StageName) {
            let gate = self.gates.lock().unwrap().remove(&stage);
            if let Some(gate) = gate {
                gate.recv().unwrap();
            }
        }
    }

    #[derive(Clone)]
    struct FakeTools(Arc<Script>);

    impl Downloader for FakeTools {
        fn download(
            &self,
            source: &str,
            reporter: &StageReporter,
        ) -> std::result::Result<DownloadedAudio, StageError> {
            reporter.report(50, "fetching");
            self.0.pass(StageName::Download);
            Ok(DownloadedAudio {
                title: format!("Song: {source}"),
                audio_path: PathBuf::from("/tmp/song.mp3"),
                duration_seconds: Some(4.0),
                artist: None,
            })
        }
    }

    impl Separator for FakeTools {
        fn separate(
            &self,
            audio: &DownloadedAudio,
            _reporter: &StageReporter,
        ) -> std::result::Result<SeparatedTracks, StageError> {
            self.0.pass(StageName::Separate);
            if self.0.panic_in_separation {
                panic!("separator exploded");
            }
            let dir = audio.audio_path.with_extension("");
            Ok(SeparatedTracks {
                vocals: dir.join("vocals.mp3"),
                instrumental: dir.join("no_vocals.mp3"),
            })
        }
    }

    impl Transcriber for FakeTools {
        fn transcribe(
            &self,
            _audio: &Path,
            reporter: &StageReporter,
        ) -> std::result::Result<Transcript, StageError> {
            reporter.report(30, "extracting");
            self.0.pass(StageName::Extract);
            let failures = &self.0.transcription_failures;
            if failures.load(Ordering::SeqCst) > 0 {
                failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StageError::Transcription("model unavailable".into()));
            }
            let segments = self.0.segments.clone();
            Ok(Transcript {
                language: Some(self.0.language.unwrap_or("en").to_string()),
                full_text: segments
                    .iter()
                    .map(|segment| segment.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
                segments,
            })
        }
    }

    impl Encoder for FakeTools {
        fn encode(
            &self,
            job: &EncodeJob,
            reporter: &StageReporter,
        ) -> std::result::Result<VideoArtifact, StageError> {
            self.0.pass(StageName::Generate);
            let duration = job.timeline.last().map(|line| line.end).unwrap_or(0.0);
            let clock = FrameClock::new(10, duration);
            for frame in 0..clock.frame_count() {
                if job.resolve(clock.timestamp(frame)).active_line.is_some() {
                    self.0.frames_with_lyrics.fetch_add(1, Ordering::SeqCst);
                }
            }
            reporter.report(100, "encoded");
            Ok(VideoArtifact {
                output_path: job.output_path.clone(),
            })
        }
    }

    fn script() -> Script {
        Script {
            segments: vec![segment("hello", 0.0, 2.0), segment("world", 2.0, 4.0)],
            ..Default::default()
        }
    }

    fn segment(text: &str, start: f64, end: f64) -> TranscriptSegment {
        TranscriptSegment {
            text: text.into(),
            start,
            end,
        }
    }

    fn pipeline(script: Script) -> (Pipeline, Arc<Script>) {
        with_settings(script, PipelineSettings::new("/tmp/karaoke-out"))
    }

    fn with_settings(script: Script, settings: PipelineSettings) -> (Pipeline, Arc<Script>) {
        let script = Arc::new(script);
        let tools = FakeTools(Arc::clone(&script));
        let pipeline = Pipeline::new(
            Collaborators {
                downloader: Box::new(tools.clone()),
                separator: Box::new(tools.clone()),
                transcriber: Box::new(tools.clone()),
                encoder: Box::new(tools),
            },
            settings,
        );
        (pipeline, script)
    }

    fn run(pipeline: &Pipeline, stage: StageName, input: StageInput) -> ProgressRecord {
        pipeline.start(stage, input).unwrap();
        let record = pipeline.wait().unwrap();
        assert_eq!(record.status, ProgressStatus::Complete, "{record:?}");
        record
    }

    fn through_separation(pipeline: &Pipeline) {
        run(pipeline, StageName::Download, StageInput::source("song"));
        run(pipeline, StageName::Separate, StageInput::new());
    }

    #[test]
    fn runs_every_stage_to_a_video() {
        let (pipeline, script) = pipeline(script());
        assert_eq!(
            pipeline.state().unwrap(),
            PipelineState::Idle { next: StageName::Download }
        );

        through_separation(&pipeline);
        let extracted = run(&pipeline, StageName::Extract, StageInput::new());
        assert_eq!(extracted.message, "Extracted 2 lyric lines");
        let timeline = pipeline.timeline().unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.entry_at(3.0).unwrap().text, "world");

        let generated = run(&pipeline, StageName::Generate, StageInput::new());
        assert_eq!(generated.percent, 100);
        let Some(StageOutput::Generate(video)) = &generated.result else {
            panic!("expected a video result, got {:?}", generated.result);
        };
        assert!(video.output_path.starts_with("/tmp/karaoke-out"));
        assert!(video
            .output_path
            .to_string_lossy()
            .ends_with("_karaoke.mp4"));
        assert_eq!(script.frames_with_lyrics.load(Ordering::SeqCst), 40);
        assert_eq!(pipeline.state().unwrap(), PipelineState::Finished);
    }

    #[test]
    fn start_returns_before_the_stage_finishes() {
        let (pipeline, script) = pipeline(script());
        let release = script.gate(StageName::Download);

        let ticket = pipeline.download("song").unwrap();
        assert_eq!(ticket.stage, StageName::Download);
        assert_eq!(
            pipeline.state().unwrap(),
            PipelineState::Running(StageName::Download)
        );
        assert!(pipeline.current_progress().is_running());

        release.send(()).unwrap();
        assert_eq!(pipeline.wait().unwrap().status, ProgressStatus::Complete);
    }

    #[test]
    fn stages_cannot_start_while_download_runs() {
        let (pipeline, script) = pipeline(script());
        let release = script.gate(StageName::Download);
        pipeline.download("song").unwrap();

        assert!(matches!(
            pipeline.separate(),
            Err(KaraokeError::StageSequence { requested: StageName::Separate, .. })
        ));
        assert!(matches!(
            pipeline.download("other"),
            Err(KaraokeError::AlreadyRunning { running: StageName::Download })
        ));

        release.send(()).unwrap();
        let record = pipeline.wait().unwrap();
        assert_eq!(record.status, ProgressStatus::Complete);
        assert_eq!(record.message, "Downloaded: Song: song");
    }

    #[test]
    fn generate_requires_extraction() {
        let (pipeline, _) = pipeline(script());
        through_separation(&pipeline);

        let err = pipeline.generate().unwrap_err();
        assert!(matches!(
            err,
            KaraokeError::StageSequence { requested: StageName::Generate, .. }
        ));
        assert!(err.to_string().contains("`extract` has not completed"));
    }

    #[test]
    fn download_needs_a_source() {
        let (pipeline, _) = pipeline(script());
        assert!(matches!(
            pipeline.start(StageName::Download, StageInput::new()),
            Err(KaraokeError::Validation(_))
        ));
        assert!(matches!(
            pipeline.download("   "),
            Err(KaraokeError::Validation(_))
        ));
        assert_eq!(pipeline.current_progress().status, ProgressStatus::Idle);
    }

    #[test]
    fn failed_stage_is_reported_and_can_be_retried() {
        let script = script();
        script.transcription_failures.store(1, Ordering::SeqCst);
        let (pipeline, _) = pipeline(script);
        through_separation(&pipeline);

        pipeline.extract().unwrap();
        let record = pipeline.wait().unwrap();
        assert_eq!(record.status, ProgressStatus::Error);
        assert_eq!(record.percent, 30);
        assert_eq!(record.error.as_deref(), Some("model unavailable"));
        assert_eq!(record.result, None);
        assert_eq!(
            pipeline.state().unwrap(),
            PipelineState::Idle { next: StageName::Extract }
        );

        run(&pipeline, StageName::Extract, StageInput::new());
        assert_eq!(pipeline.timeline().unwrap().len(), 2);
    }

    #[test]
    fn worker_panics_surface_as_errors() {
        let (pipeline, _) = pipeline(Script {
            panic_in_separation: true,
            ..script()
        });
        run(&pipeline, StageName::Download, StageInput::source("song"));

        pipeline.separate().unwrap();
        let record = pipeline.wait().unwrap();
        assert_eq!(record.status, ProgressStatus::Error);
        let error = record.error.unwrap();
        assert!(error.contains("separator exploded"), "{error}");
        assert!(pipeline.artifact(StageName::Separate).unwrap().is_none());
    }

    #[test]
    fn edits_are_refused_while_a_stage_runs() {
        let (pipeline, script) = pipeline(script());
        through_separation(&pipeline);
        run(&pipeline, StageName::Extract, StageInput::new());

        let release = script.gate(StageName::Generate);
        pipeline.generate().unwrap();
        let revision = pipeline.timeline().unwrap().revision();

        let line = LineEntry::new("late", 10.0, 11.0).unwrap();
        assert!(matches!(
            pipeline.insert_line(None, line.clone()),
            Err(KaraokeError::PipelineBusy { running: StageName::Generate })
        ));
        assert!(matches!(
            pipeline.delete_line(None, 0),
            Err(KaraokeError::PipelineBusy { .. })
        ));
        assert!(matches!(
            pipeline.import_lyrics(None, vec![line.clone()]),
            Err(KaraokeError::PipelineBusy { .. })
        ));
        assert!(matches!(pipeline.reset(), Err(KaraokeError::PipelineBusy { .. })));

        release.send(()).unwrap();
        pipeline.wait().unwrap();
        assert_eq!(pipeline.timeline().unwrap().revision(), revision);
        pipeline.insert_line(Some(revision), line).unwrap();
    }

    #[test]
    fn edits_use_optimistic_revisions() {
        let (pipeline, _) = pipeline(script());
        let first = pipeline
            .insert_line(Some(0), LineEntry::new("hello", 0.0, 2.0).unwrap())
            .unwrap();
        assert_eq!(first, EditOutcome { index: 0, revision: 1 });

        let second = pipeline
            .insert_line(None, LineEntry::new("world", 2.0, 4.0).unwrap())
            .unwrap();
        assert_eq!(second, EditOutcome { index: 1, revision: 2 });

        assert!(matches!(
            pipeline.update_line(Some(1), 0, LineUpdate::new().text("hi")),
            Err(KaraokeError::StaleRevision { expected: 1, current: 2 })
        ));
        assert!(matches!(
            pipeline.insert_line(None, LineEntry::new("x", 1.0, 3.0).unwrap()),
            Err(KaraokeError::Overlap { .. })
        ));
        assert_eq!(pipeline.timeline().unwrap().len(), 2);

        pipeline
            .update_line(Some(2), 0, LineUpdate::new().text("hi"))
            .unwrap();
        let removed = pipeline.delete_line(Some(3), 1).unwrap();
        assert_eq!(removed.revision, 4);
        assert_eq!(pipeline.timeline().unwrap().to_vec()[0].text, "hi");
    }

    #[test]
    fn imported_lyrics_stand_in_for_extraction() {
        let (pipeline, script) = pipeline(script());
        through_separation(&pipeline);

        let revision = pipeline
            .import_lyrics(
                None,
                vec![
                    LineEntry::new("two", 1.0, 2.0).unwrap(),
                    LineEntry::new("one", 0.0, 1.0).unwrap(),
                ],
            )
            .unwrap();
        assert_eq!(revision, 1);
        assert!(matches!(
            pipeline.artifact(StageName::Extract).unwrap(),
            Some(StageOutput::Extract(ExtractedLyrics { origin: LyricsOrigin::Imported, .. }))
        ));

        run(&pipeline, StageName::Generate, StageInput::new());
        assert_eq!(script.frames_with_lyrics.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn importing_lyrics_requires_separation() {
        let (pipeline, _) = pipeline(script());
        run(&pipeline, StageName::Download, StageInput::source("song"));

        let lines = vec![LineEntry::new("new", 0.0, 1.0).unwrap()];
        assert!(matches!(
            pipeline.import_lyrics(None, lines.clone()),
            Err(KaraokeError::StageSequence { requested: StageName::Extract, .. })
        ));
        assert!(pipeline.timeline().unwrap().is_empty());
        assert!(pipeline.artifact(StageName::Extract).unwrap().is_none());

        run(&pipeline, StageName::Separate, StageInput::new());
        pipeline.import_lyrics(None, lines).unwrap();
        assert_eq!(
            pipeline.state().unwrap(),
            PipelineState::Idle { next: StageName::Generate }
        );
    }

    #[test]
    fn changing_lyrics_after_generation_makes_the_video_stale() {
        let (pipeline, _) = pipeline(script());
        through_separation(&pipeline);
        run(&pipeline, StageName::Extract, StageInput::new());
        run(&pipeline, StageName::Generate, StageInput::new());
        assert_eq!(pipeline.state().unwrap(), PipelineState::Finished);

        pipeline
            .import_lyrics(None, vec![LineEntry::new("new", 0.0, 1.0).unwrap()])
            .unwrap();
        assert!(pipeline.artifact(StageName::Generate).unwrap().is_none());
        assert_eq!(
            pipeline.state().unwrap(),
            PipelineState::Idle { next: StageName::Generate }
        );

        run(&pipeline, StageName::Generate, StageInput::new());
        assert_eq!(pipeline.state().unwrap(), PipelineState::Finished);
        pipeline
            .update_line(None, 0, LineUpdate::new().text("newer"))
            .unwrap();
        assert!(pipeline.artifact(StageName::Generate).unwrap().is_none());
        assert_eq!(
            pipeline.state().unwrap(),
            PipelineState::Idle { next: StageName::Generate }
        );
    }

    #[test]
    fn rejected_edits_keep_the_video_fresh() {
        let (pipeline, _) = pipeline(script());
        through_separation(&pipeline);
        run(&pipeline, StageName::Extract, StageInput::new());
        run(&pipeline, StageName::Generate, StageInput::new());

        assert!(pipeline.delete_line(None, 9).is_err());
        let late = LineEntry::new("x", 9.0, 10.0).unwrap();
        assert!(pipeline.insert_line(Some(0), late).is_err());
        assert_eq!(pipeline.state().unwrap(), PipelineState::Finished);
    }

    #[test]
    fn romanizes_indic_transcripts_when_enabled() {
        let bengali = || Script {
            segments: vec![segment("আমি", 0.0, 2.0), segment("তুমি", 2.0, 4.0)],
            language: Some("bn"),
            ..Default::default()
        };

        let mut settings = PipelineSettings::new("/tmp/karaoke-out");
        settings.romanize = true;
        let (romanized, _) = with_settings(bengali(), settings);
        through_separation(&romanized);
        let record = run(&romanized, StageName::Extract, StageInput::new());

        let timeline = romanized.timeline().unwrap();
        assert_eq!(timeline.len(), 2);
        assert!(timeline.iter().all(|line| line.text.is_ascii()), "{timeline:?}");
        let Some(StageOutput::Extract(lyrics)) = &record.result else {
            panic!("expected extracted lyrics, got {:?}", record.result);
        };
        assert_eq!(lyrics.language.as_deref(), Some("bn"));
        assert_eq!(lyrics.full_text, "আমি তুমি");

        let (untouched, _) = pipeline(bengali());
        through_separation(&untouched);
        run(&untouched, StageName::Extract, StageInput::new());
        assert_eq!(untouched.timeline().unwrap()[0].text, "আমি");
    }

    #[test]
    fn generate_refuses_an_empty_timeline() {
        let (pipeline, _) = pipeline(script());
        through_separation(&pipeline);
        pipeline.import_lyrics(None, Vec::new()).unwrap();

        assert!(matches!(pipeline.generate(), Err(KaraokeError::Validation(_))));
        assert_eq!(pipeline.current_progress().stage, Some(StageName::Separate));
    }

    #[test]
    fn forced_rerun_invalidates_downstream_artifacts() {
        let (pipeline, _) = pipeline(script());
        through_separation(&pipeline);

        assert!(matches!(
            pipeline.download("again"),
            Err(KaraokeError::StageSequence { requested: StageName::Download, .. })
        ));

        run(
            &pipeline,
            StageName::Download,
            StageInput::source("again").force(),
        );
        assert!(pipeline.artifact(StageName::Download).unwrap().is_some());
        assert!(pipeline.artifact(StageName::Separate).unwrap().is_none());
        assert_eq!(
            pipeline.state().unwrap(),
            PipelineState::Idle { next: StageName::Separate }
        );
        assert!(matches!(
            pipeline.extract(),
            Err(KaraokeError::StageSequence { .. })
        ));
    }

    #[test]
    fn latest_stage_can_be_rerun_without_force() {
        let (pipeline, _) = pipeline(script());
        through_separation(&pipeline);
        run(&pipeline, StageName::Separate, StageInput::new());
        run(&pipeline, StageName::Extract, StageInput::new());
        run(&pipeline, StageName::Generate, StageInput::new());
        run(&pipeline, StageName::Generate, StageInput::new());
    }

    #[test]
    fn reset_starts_a_new_job() {
        let (pipeline, _) = pipeline(script());
        let first_job = pipeline.current_progress().job_id;
        through_separation(&pipeline);
        pipeline
            .insert_line(None, LineEntry::new("x", 0.0, 1.0).unwrap())
            .unwrap();

        let job_id = pipeline.reset().unwrap();
        assert_ne!(job_id, first_job);
        let record = pipeline.current_progress();
        assert_eq!(record.job_id, job_id);
        assert_eq!(record.status, ProgressStatus::Idle);
        assert!(pipeline.timeline().unwrap().is_empty());
        assert_eq!(
            pipeline.state().unwrap(),
            PipelineState::Idle { next: StageName::Download }
        );
    }

    #[test]
    fn names_output_files_after_the_title() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(14, 5, 7)
            .unwrap();
        assert_eq!(
            output_file_name("AC/DC: Thunder (Live)!", at),
            "ACDC Thunder Live_20240309_140507_karaoke.mp4"
        );
        assert_eq!(output_file_name("???", at), "karaoke_20240309_140507_karaoke.mp4");
    }
}
