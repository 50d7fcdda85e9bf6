//! The single live progress record and the handles that write to it.
//!
//! Writers hold the lock only for the duration of the field writes; readers
//! copy the whole record out, so a poll never observes a half-written update.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{stage::StageName, stage::StageOutput, KaraokeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Idle,
    Running,
    Complete,
    Error,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub job_id: Uuid,
    #[serde(rename = "task")]
    pub stage: Option<StageName>,
    pub status: ProgressStatus,
    #[serde(rename = "progress")]
    pub percent: u8,
    pub message: String,
    pub error: Option<String>,
    pub result: Option<StageOutput>,
}

impl ProgressRecord {
    pub fn idle(job_id: Uuid) -> Self {
        Self {
            job_id,
            stage: None,
            status: ProgressStatus::Idle,
            percent: 0,
            message: String::new(),
            error: None,
            result: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ProgressStatus::Running
    }

    /// Stage currently executing, if any.
    pub fn running_stage(&self) -> Option<StageName> {
        if self.is_running() {
            self.stage
        } else {
            None
        }
    }
}

/// Cloneable handle to the shared [`ProgressRecord`].
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    record: Arc<Mutex<ProgressRecord>>,
}

impl ProgressTracker {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            record: Arc::new(Mutex::new(ProgressRecord::idle(job_id))),
        }
    }

    /// Copies the current record out. Never fails and never waits on a
    /// running stage, only on a concurrent field write.
    pub fn snapshot(&self) -> ProgressRecord {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_running()
    }

    /// Overwrites the record for a fresh stage invocation.
    pub fn begin(&self, job_id: Uuid, stage: StageName, message: impl Into<String>) {
        *self.lock() = ProgressRecord {
            job_id,
            stage: Some(stage),
            status: ProgressStatus::Running,
            percent: 0,
            message: message.into(),
            error: None,
            result: None,
        };
    }

    /// Records intermediate progress. Percentages above 100 are clamped and a
    /// value below the current one keeps the current percentage, so progress
    /// within a stage never goes backwards. Ignored unless a stage runs.
    pub fn report(&self, percent: u32, message: impl Into<String>) {
        let mut record = self.lock();
        if !record.is_running() {
            return;
        }
        let percent = percent.min(100) as u8;
        if percent < record.percent {
            tracing::warn!(
                current = record.percent,
                requested = percent,
                "ignoring progress regression"
            );
        } else {
            record.percent = percent;
        }
        record.message = message.into();
    }

    pub fn finish(&self, result: StageOutput, message: impl Into<String>) -> Result<()> {
        let mut record = self.lock();
        if !record.is_running() {
            return Err(KaraokeError::NotRunning);
        }
        record.status = ProgressStatus::Complete;
        record.percent = 100;
        record.message = message.into();
        record.result = Some(result);
        Ok(())
    }

    /// Marks the running stage as failed. The percentage reached so far is
    /// kept and `result` stays empty.
    pub fn fail(&self, error: impl Into<String>) -> Result<()> {
        let mut record = self.lock();
        if !record.is_running() {
            return Err(KaraokeError::NotRunning);
        }
        let error = error.into();
        record.status = ProgressStatus::Error;
        record.message = error.clone();
        record.error = Some(error);
        record.result = None;
        Ok(())
    }

    /// Returns the record to idle for a new job.
    pub fn reset(&self, job_id: Uuid) {
        *self.lock() = ProgressRecord::idle(job_id);
    }

    fn lock(&self) -> MutexGuard<'_, ProgressRecord> {
        // A panic while holding the guard cannot leave the record torn: every
        // write path assigns plain fields.
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle given to a stage's collaborator so it can report progress.
#[derive(Debug, Clone)]
pub struct StageReporter {
    stage: StageName,
    tracker: ProgressTracker,
}

impl StageReporter {
    pub fn new(stage: StageName, tracker: ProgressTracker) -> Self {
        Self { stage, tracker }
    }

    pub fn report(&self, percent: u32, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(stage = %self.stage, percent, %message, "progress");
        self.tracker.report(percent, message);
    }
}
