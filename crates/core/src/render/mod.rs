//! Maps playback timestamps to what the renderer should draw.
//!
//! [`resolve`] is called once per output frame, so it only ever performs a
//! binary search over the timeline; sampling a whole video stays linear in
//! the number of frames.

use serde::{Deserialize, Serialize};

use crate::timeline::LineEntry;

/// Visual state for a single frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameState {
    pub active_line: Option<usize>,
    /// Share of the active line's duration already elapsed, in `[0, 1]`.
    /// Always 0 when no line is active.
    pub fraction: f64,
    /// First line starting after `time`, shown as a dimmed preview.
    pub upcoming_line: Option<usize>,
}

impl FrameState {
    pub fn is_idle(&self) -> bool {
        self.active_line.is_none()
    }
}

pub fn resolve<T: AsRef<[LineEntry]> + ?Sized>(timeline: &T, time: f64) -> FrameState {
    let entries = timeline.as_ref();
    let after = entries.partition_point(|e| e.start <= time);
    let upcoming_line = (after < entries.len()).then_some(after);

    let active = after
        .checked_sub(1)
        .filter(|&index| entries[index].contains(time));

    match active {
        Some(index) => {
            let entry = &entries[index];
            let fraction = ((time - entry.start) / entry.duration()).clamp(0.0, 1.0);
            FrameState {
                active_line: Some(index),
                fraction,
                upcoming_line,
            }
        }
        None => FrameState {
            active_line: None,
            fraction: 0.0,
            upcoming_line,
        },
    }
}

/// Splits `text` into the highlighted prefix and the remaining suffix.
/// The prefix holds `floor(chars * fraction)` characters.
pub fn split_highlight(text: &str, fraction: f64) -> (&str, &str) {
    let total = text.chars().count();
    let lit = ((total as f64) * fraction.clamp(0.0, 1.0)).floor() as usize;
    let boundary = text
        .char_indices()
        .nth(lit)
        .map(|(offset, _)| offset)
        .unwrap_or(text.len());
    text.split_at(boundary)
}

/// Fixed-rate sampling of a track of `duration` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameClock {
    pub fps: u32,
    pub duration: f64,
}

impl FrameClock {
    pub fn new(fps: u32, duration: f64) -> Self {
        Self {
            fps: fps.max(1),
            duration: duration.max(0.0),
        }
    }

    pub fn frame_count(&self) -> u64 {
        (self.duration * f64::from(self.fps)).ceil() as u64
    }

    pub fn timestamp(&self, frame: u64) -> f64 {
        frame as f64 / f64::from(self.fps)
    }

    /// Iterates `(frame, timestamp, state)` for every frame of the track.
    pub fn frames<'a>(&self, timeline: &'a [LineEntry]) -> Frames<'a> {
        Frames {
            clock: *self,
            timeline,
            next: 0,
            total: self.frame_count(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frames<'a> {
    clock: FrameClock,
    timeline: &'a [LineEntry],
    next: u64,
    total: u64,
}

impl Iterator for Frames<'_> {
    type Item = (u64, f64, FrameState);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let frame = self.next;
        self.next += 1;
        let time = self.clock.timestamp(frame);
        Some((frame, time, resolve(self.timeline, time)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Frames<'_> {}

/// Colours used by [`FrameCanvas`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Palette {
    pub background: [u8; 3],
    pub text: [u8; 3],
    pub highlight: [u8; 3],
}

/// Packed RGB24 frame buffer. Lyric text itself is drawn by the encoder;
/// the canvas paints the karaoke sweep that tracks [`FrameState::fraction`].
#[derive(Debug, Clone)]
pub struct FrameCanvas {
    width: u32,
    height: u32,
    palette: Palette,
    pixels: Vec<u8>,
}

impl FrameCanvas {
    pub fn new(width: u32, height: u32, palette: Palette) -> Self {
        Self {
            width,
            height,
            palette,
            pixels: vec![0; width as usize * height as usize * 3],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn paint(&mut self, state: &FrameState) -> &[u8] {
        let background = self.palette.background;
        self.fill_rows(0, self.height, 0, self.width, background);

        let margin = self.width / 20;
        let track_width = self.width.saturating_sub(margin * 2);
        let bar_top = self.height * 17 / 20;
        let bar_height = (self.height / 90).max(1);

        if state.active_line.is_some() {
            let lit = (f64::from(track_width) * state.fraction).round() as u32;
            let dim = dimmed(self.palette.text);
            let highlight = self.palette.highlight;
            self.fill_rows(bar_top, bar_height, margin, track_width, dim);
            self.fill_rows(bar_top, bar_height, margin, lit, highlight);
        }

        if state.upcoming_line.is_some() {
            let preview_top = bar_top + bar_height * 3;
            let preview = dimmed(dimmed(self.palette.text));
            self.fill_rows(preview_top, (bar_height / 2).max(1), margin, track_width / 3, preview);
        }

        &self.pixels
    }

    fn fill_rows(&mut self, top: u32, rows: u32, left: u32, cols: u32, colour: [u8; 3]) {
        let bottom = top.saturating_add(rows).min(self.height);
        let right = left.saturating_add(cols).min(self.width);
        if left >= right {
            return;
        }
        let stride = self.width as usize * 3;
        for y in top..bottom {
            let row = y as usize * stride;
            let span = &mut self.pixels[row + left as usize * 3..row + right as usize * 3];
            for pixel in span.chunks_exact_mut(3) {
                pixel.copy_from_slice(&colour);
            }
        }
    }
}

fn dimmed(colour: [u8; 3]) -> [u8; 3] {
    colour.map(|channel| channel / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::LyricTimeline;

    fn hello_world() -> LyricTimeline {
        LyricTimeline::from_entries(vec![
            LineEntry::new("hello", 0.0, 2.0).unwrap(),
            LineEntry::new("world", 2.0, 4.0).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn resolves_active_line_and_fraction() {
        let timeline = hello_world();

        let first = resolve(&timeline, 1.0);
        assert_eq!(first.active_line, Some(0));
        assert!((first.fraction - 0.5).abs() < 1e-9);
        assert_eq!(first.upcoming_line, Some(1));

        let second = resolve(&timeline, 3.0);
        assert_eq!(second.active_line, Some(1));
        assert!((second.fraction - 0.5).abs() < 1e-9);
        assert_eq!(second.upcoming_line, None);

        let after = resolve(&timeline, 5.0);
        assert_eq!(after.active_line, None);
        assert_eq!(after.fraction, 0.0);
    }

    #[test]
    fn before_first_line_previews_it() {
        let timeline = LyricTimeline::from_entries(vec![LineEntry::new("late", 3.0, 4.0).unwrap()])
            .unwrap();
        let state = resolve(&timeline, 1.0);
        assert!(state.is_idle());
        assert_eq!(state.fraction, 0.0);
        assert_eq!(state.upcoming_line, Some(0));
    }

    #[test]
    fn fraction_interpolates_linearly() {
        let timeline = LyricTimeline::from_entries(vec![LineEntry::new("x", 10.0, 14.0).unwrap()])
            .unwrap();
        for (time, expected) in [(10.0, 0.0), (11.0, 0.25), (13.0, 0.75)] {
            let state = resolve(&timeline, time);
            assert!((state.fraction - expected).abs() < 1e-9, "t={time}");
        }
        assert!(resolve(&timeline, 14.0).is_idle());
    }

    #[test]
    fn resolves_against_snapshots_and_slices() {
        let timeline = hello_world();
        let snapshot = timeline.all();
        assert_eq!(resolve(&snapshot, 2.5).active_line, Some(1));
        assert_eq!(resolve(timeline.entries(), 0.5).active_line, Some(0));
        assert!(resolve(&[] as &[LineEntry], 0.5).is_idle());
    }

    #[test]
    fn splits_highlight_on_char_boundaries() {
        assert_eq!(split_highlight("hello", 0.0), ("", "hello"));
        assert_eq!(split_highlight("hello", 0.5), ("he", "llo"));
        assert_eq!(split_highlight("hello", 1.0), ("hello", ""));
        assert_eq!(split_highlight("আমি গান", 0.5), ("আমি", " গান"));
    }

    #[test]
    fn frame_clock_samples_every_frame() {
        let timeline = hello_world();
        let clock = FrameClock::new(10, 4.0);
        assert_eq!(clock.frame_count(), 40);

        let frames: Vec<_> = clock.frames(timeline.entries()).collect();
        assert_eq!(frames.len(), 40);
        assert_eq!(frames[10].2.active_line, Some(0));
        assert!((frames[10].1 - 1.0).abs() < 1e-9);
        assert_eq!(frames[30].2.active_line, Some(1));
    }

    #[test]
    fn canvas_sweep_tracks_fraction() {
        let palette = Palette {
            background: [0, 0, 0],
            text: [200, 200, 200],
            highlight: [255, 255, 0],
        };
        let mut canvas = FrameCanvas::new(200, 90, palette);
        let pixels = canvas
            .paint(&FrameState {
                active_line: Some(0),
                fraction: 0.5,
                upcoming_line: None,
            })
            .to_vec();
        assert_eq!(pixels.len(), 200 * 90 * 3);

        let row = (90 * 17 / 20) as usize * 200 * 3;
        let pixel = |x: usize| &pixels[row + x * 3..row + x * 3 + 3];
        assert_eq!(pixel(0), [0, 0, 0]);
        assert_eq!(pixel(20), [255, 255, 0]);
        assert_eq!(pixel(150), [100, 100, 100]);

        let idle = canvas.paint(&FrameState::default());
        assert!(idle.iter().all(|&channel| channel == 0));
    }
}
