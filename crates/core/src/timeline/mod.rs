//! Ordered, non-overlapping collection of timed lyric lines.
//!
//! Entries are kept sorted by start time and satisfy `end(i) <= start(i + 1)`,
//! so lookups by timestamp are a binary search over starts. Every successful
//! mutation bumps the revision counter; rejected edits leave both the entries
//! and the revision untouched.

use std::{ops::Deref, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{KaraokeError, Result};

/// A single lyric line shown during `[start, end)` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineEntry {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

impl LineEntry {
    pub fn new(text: impl Into<String>, start: f64, end: f64) -> Result<Self> {
        let entry = Self {
            text: text.into(),
            start,
            end,
        };
        entry.validate()?;
        Ok(entry)
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, time: f64) -> bool {
        self.start <= time && time < self.end
    }

    fn validate(&self) -> Result<()> {
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(KaraokeError::validation(format!(
                "timestamps must be finite (start {}, end {})",
                self.start, self.end
            )));
        }
        if self.start < 0.0 {
            return Err(KaraokeError::validation(format!(
                "start {:.3}s must not be negative",
                self.start
            )));
        }
        if self.end <= self.start {
            return Err(KaraokeError::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}

/// Partial edit applied by [`LyricTimeline::update`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineUpdate {
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub text: Option<String>,
}

impl LineUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(mut self, start: f64) -> Self {
        self.start = Some(start);
        self
    }

    pub fn end(mut self, end: f64) -> Self {
        self.end = Some(end);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.text.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LyricTimeline {
    entries: Vec<LineEntry>,
    revision: u64,
}

impl LyricTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a timeline from user-provided lines. Lines may arrive in any
    /// order but must not overlap once sorted.
    pub fn from_entries(entries: Vec<LineEntry>) -> Result<Self> {
        let mut timeline = Self::new();
        timeline.replace(entries)?;
        Ok(timeline)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LineEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&LineEntry> {
        self.entries.get(index)
    }

    /// Fails with [`KaraokeError::StaleRevision`] unless `expected` matches.
    pub fn check_revision(&self, expected: u64) -> Result<()> {
        if expected == self.revision {
            Ok(())
        } else {
            Err(KaraokeError::StaleRevision {
                expected,
                current: self.revision,
            })
        }
    }

    /// Inserts `entry` at its start-ordered position and returns that index.
    pub fn insert(&mut self, entry: LineEntry) -> Result<usize> {
        entry.validate()?;
        let index = self.entries.partition_point(|e| e.start < entry.start);

        if index > 0 && self.entries[index - 1].end > entry.start {
            return Err(overlap(&entry, index - 1));
        }
        if let Some(next) = self.entries.get(index) {
            if entry.end > next.start {
                return Err(overlap(&entry, index));
            }
        }

        self.entries.insert(index, entry);
        self.bump();
        Ok(index)
    }

    /// Applies `update` to the line at `index`. Only the immediate neighbours
    /// are consulted; moving a line past a neighbour is reported as an overlap
    /// rather than reordering the timeline.
    pub fn update(&mut self, index: usize, update: LineUpdate) -> Result<()> {
        if update.is_empty() {
            return Err(KaraokeError::validation("update changes nothing"));
        }
        let current = self.entries.get(index).ok_or(KaraokeError::LineNotFound {
            index,
            len: self.entries.len(),
        })?;

        let candidate = LineEntry {
            text: update.text.unwrap_or_else(|| current.text.clone()),
            start: update.start.unwrap_or(current.start),
            end: update.end.unwrap_or(current.end),
        };
        candidate.validate()?;

        if index > 0 && self.entries[index - 1].end > candidate.start {
            return Err(overlap(&candidate, index - 1));
        }
        if let Some(next) = self.entries.get(index + 1) {
            if candidate.end > next.start {
                return Err(overlap(&candidate, index + 1));
            }
        }

        self.entries[index] = candidate;
        self.bump();
        Ok(())
    }

    pub fn delete(&mut self, index: usize) -> Result<LineEntry> {
        if index >= self.entries.len() {
            return Err(KaraokeError::LineNotFound {
                index,
                len: self.entries.len(),
            });
        }
        let removed = self.entries.remove(index);
        self.bump();
        Ok(removed)
    }

    /// Swaps the whole content for `entries` as a single mutation.
    pub fn replace(&mut self, mut entries: Vec<LineEntry>) -> Result<()> {
        for entry in &entries {
            entry.validate()?;
        }
        entries.sort_by(|a, b| a.start.total_cmp(&b.start));
        for (index, pair) in entries.windows(2).enumerate() {
            if pair[0].end > pair[1].start {
                return Err(overlap(&pair[1], index));
            }
        }

        self.entries = entries;
        self.bump();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bump();
    }

    pub fn index_at(&self, time: f64) -> Option<usize> {
        index_at(&self.entries, time)
    }

    pub fn entry_at(&self, time: f64) -> Option<&LineEntry> {
        self.index_at(time).map(|index| &self.entries[index])
    }

    /// Read-only snapshot of the current content. The snapshot shares no
    /// state with the live timeline.
    pub fn all(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            revision: self.revision,
            entries: self.entries.as_slice().into(),
        }
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}

impl AsRef<[LineEntry]> for LyricTimeline {
    fn as_ref(&self) -> &[LineEntry] {
        &self.entries
    }
}

/// Immutable, cheaply cloneable copy of a timeline at a given revision.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineSnapshot {
    revision: u64,
    entries: Arc<[LineEntry]>,
}

impl TimelineSnapshot {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn index_at(&self, time: f64) -> Option<usize> {
        index_at(&self.entries, time)
    }

    pub fn entry_at(&self, time: f64) -> Option<&LineEntry> {
        self.index_at(time).map(|index| &self.entries[index])
    }

    pub fn to_vec(&self) -> Vec<LineEntry> {
        self.entries.to_vec()
    }
}

impl Default for TimelineSnapshot {
    fn default() -> Self {
        LyricTimeline::new().all()
    }
}

impl Deref for TimelineSnapshot {
    type Target = [LineEntry];

    fn deref(&self) -> &[LineEntry] {
        &self.entries
    }
}

impl AsRef<[LineEntry]> for TimelineSnapshot {
    fn as_ref(&self) -> &[LineEntry] {
        &self.entries
    }
}

impl<'a> IntoIterator for &'a TimelineSnapshot {
    type Item = &'a LineEntry;
    type IntoIter = std::slice::Iter<'a, LineEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Raw `(text, start, end)` triple as produced by a transcriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Turns transcriber output into lines that satisfy the timeline invariants.
///
/// Text is trimmed and empty lines dropped. A segment starting before the
/// previous line ends is clipped to start there; segments that collapse to
/// nothing are dropped.
pub fn normalize_segments(segments: &[TranscriptSegment]) -> Vec<LineEntry> {
    let mut ordered: Vec<&TranscriptSegment> = segments.iter().collect();
    ordered.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut lines: Vec<LineEntry> = Vec::with_capacity(ordered.len());
    for segment in ordered {
        let text = segment.text.trim();
        if text.is_empty() {
            continue;
        }
        let floor = lines.last().map(|line| line.end).unwrap_or(0.0);
        let start = segment.start.max(floor);
        if let Ok(line) = LineEntry::new(text, start, segment.end) {
            lines.push(line);
        }
    }

    let dropped = segments.len() - lines.len();
    if dropped > 0 {
        tracing::warn!(dropped, kept = lines.len(), "dropped unusable transcript segments");
    }
    lines
}

/// Index of the entry containing `time`, or `None` when `time` falls in a
/// gap, before the first line, or after the last one.
pub(crate) fn index_at(entries: &[LineEntry], time: f64) -> Option<usize> {
    let after = entries.partition_point(|e| e.start <= time);
    let candidate = after.checked_sub(1)?;
    entries[candidate].contains(time).then_some(candidate)
}

fn overlap(entry: &LineEntry, conflict: usize) -> KaraokeError {
    KaraokeError::Overlap {
        start: entry.start,
        end: entry.end,
        conflict,
    }
}
