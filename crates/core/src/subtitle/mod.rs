//! Lyric file formats: SRT and ASS/SSA subtitles plus the JSON lyrics
//! document (`{"segments": [{"start", "end", "text"}], "language"}`).

use std::{fmt::Write as _, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{render::split_highlight, timeline::LineEntry, KaraokeError, Result};

const STYLE_FORMAT: &str = "Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, \
    OutlineColour, BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, \
    Angle, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding";

const EVENT_FORMAT: &str =
    "Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LyricsDocument {
    pub segments: Vec<LineEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl LyricsDocument {
    pub fn new(segments: Vec<LineEntry>) -> Self {
        Self {
            segments,
            language: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let document: Self = serde_json::from_str(&raw)?;
        for segment in &document.segments {
            LineEntry::new(segment.text.clone(), segment.start, segment.end)?;
        }
        Ok(document)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Loads lyric lines from `.srt`, `.ass`, `.ssa` or `.json` files.
pub fn load_lyrics(path: &Path) -> Result<Vec<LineEntry>> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "json" => Ok(LyricsDocument::load(path)?.segments),
        "srt" => parse_srt(&fs::read_to_string(path)?),
        "ass" | "ssa" => parse_ass(&fs::read_to_string(path)?),
        other => Err(KaraokeError::validation(format!(
            "unsupported lyrics format `.{other}`; use .srt, .ass, .ssa or .json"
        ))),
    }
}

/// Parses SubRip cues. Blocks without a timing line are skipped.
pub fn parse_srt(content: &str) -> Result<Vec<LineEntry>> {
    let normalized = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    let mut lines = Vec::new();

    for block in normalized.split("\n\n") {
        let mut rows = block.trim().lines();
        let Some(first) = rows.next() else {
            continue;
        };
        // The cue counter is optional in the wild.
        let timing = if first.contains("-->") {
            first
        } else {
            match rows.next() {
                Some(row) => row,
                None => continue,
            }
        };
        let Some((start, end)) = timing.split_once("-->") else {
            continue;
        };
        let start = parse_srt_time(start.trim())?;
        // Position hints may follow the end timestamp.
        let end = parse_srt_time(end.split_whitespace().next().unwrap_or_default())?;
        let text = rows.collect::<Vec<_>>().join("\n");
        lines.push(LineEntry::new(text.trim(), start, end)?);
    }

    Ok(lines)
}

/// Parses `Dialogue:` events, dropping `{...}` override codes.
pub fn parse_ass(content: &str) -> Result<Vec<LineEntry>> {
    let mut lines = Vec::new();

    for row in content.lines() {
        let Some(event) = row.trim().strip_prefix("Dialogue:") else {
            continue;
        };
        let fields: Vec<&str> = event.splitn(10, ',').collect();
        if fields.len() < 10 {
            continue;
        }
        let start = parse_ass_time(fields[1].trim())?;
        let end = parse_ass_time(fields[2].trim())?;
        let text = strip_override_codes(fields[9]).replace("\\N", "\n");
        lines.push(LineEntry::new(text.trim(), start, end)?);
    }

    Ok(lines)
}

/// Renders lines as SubRip cues, numbered from 1.
pub fn to_srt(lines: &[LineEntry]) -> String {
    let mut out = String::new();
    for (index, line) in lines.iter().enumerate() {
        let _ = write!(
            out,
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_srt_time(line.start),
            format_srt_time(line.end),
            line.text
        );
    }
    out
}

/// Layout and colours of the karaoke subtitle script, in output pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KaraokeStyle {
    pub width: u32,
    pub height: u32,
    pub font_size: u32,
    /// Colour of the part of a line not yet sung.
    pub text: [u8; 3],
    pub highlight: [u8; 3],
    /// Colour of the next-line preview.
    pub preview: [u8; 3],
}

/// Renders lines as an ASS script for burning into the video.
///
/// Each line is drawn centred in `text` and turns `highlight` one character
/// at a time, so that at any moment the lit prefix is the one
/// [`split_highlight`] gives for the elapsed fraction of the line. While a
/// line is sung the following line is previewed below it in a smaller,
/// dimmed style.
pub fn to_karaoke_ass(lines: &[LineEntry], style: &KaraokeStyle) -> String {
    let margin = style.width / 20;
    let preview_size = (style.font_size * 3 / 5).max(1);
    let preview_top = style.height / 2 + style.font_size;

    let mut out = String::new();
    let _ = write!(
        out,
        "[Script Info]\nScriptType: v4.00+\nPlayResX: {}\nPlayResY: {}\n\
         WrapStyle: 0\nScaledBorderAndShadow: yes\n\n[V4+ Styles]\n{STYLE_FORMAT}\n",
        style.width, style.height
    );
    let _ = writeln!(
        out,
        "Style: Lyric,Arial,{},{},{},&H00000000,&H80000000,\
         -1,0,0,0,100,100,0,0,1,3,0,5,{margin},{margin},0,1",
        style.font_size,
        ass_colour(style.highlight),
        ass_colour(style.text),
    );
    let _ = writeln!(
        out,
        "Style: Preview,Arial,{preview_size},{},{},&H00000000,&H80000000,\
         0,0,0,0,100,100,0,0,1,2,0,8,{margin},{margin},{preview_top},1",
        ass_colour(style.preview),
        ass_colour(style.preview),
    );
    let _ = write!(out, "\n[Events]\n{EVENT_FORMAT}\n");

    for (index, line) in lines.iter().enumerate() {
        let (start, end) = (format_ass_time(line.start), format_ass_time(line.end));
        let _ = writeln!(
            out,
            "Dialogue: 1,{start},{end},Lyric,,0,0,0,,{}",
            karaoke_text(line)
        );
        if let Some(next) = lines.get(index + 1) {
            let _ = writeln!(
                out,
                "Dialogue: 0,{start},{end},Preview,,0,0,0,,{}",
                escape_ass_text(&next.text)
            );
        }
    }
    out
}

/// One `\k` span per character. A leading empty span delays the first
/// character until `1/n` of the line has elapsed.
fn karaoke_text(line: &LineEntry) -> String {
    let chars = line.text.chars().count();
    if chars == 0 {
        return String::new();
    }
    let total = (line.duration() * 100.0).round() as u64;
    let count = chars as u64;
    let lit_at = |lit: u64| total * lit / count;

    let mut out = format!("{{\\k{}}}", lit_at(1));
    let mut sung = 0;
    for lit in 1..=chars {
        // Sampling mid-step keeps the floor inside split_highlight exact.
        let fraction = ((lit as f64 + 0.5) / chars as f64).min(1.0);
        let (head, _) = split_highlight(&line.text, fraction);
        let step = lit as u64;
        let hold = if step < count {
            lit_at(step + 1) - lit_at(step)
        } else {
            0
        };
        let piece = escape_ass_text(&line.text[sung..head.len()]);
        let _ = write!(out, "{{\\k{hold}}}{piece}");
        sung = head.len();
    }
    out
}

fn escape_ass_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\N"),
            '\r' => {}
            '{' => out.push('('),
            '}' => out.push(')'),
            '\\' => out.push('/'),
            _ => out.push(c),
        }
    }
    out
}

/// `&HAABBGGRR` with an opaque alpha.
fn ass_colour([r, g, b]: [u8; 3]) -> String {
    format!("&H00{b:02X}{g:02X}{r:02X}")
}

/// `H:MM:SS.cc`.
fn format_ass_time(seconds: f64) -> String {
    let total = (seconds.max(0.0) * 100.0).round() as u64;
    let (hours, rest) = (total / 360_000, total % 360_000);
    let (minutes, rest) = (rest / 6_000, rest % 6_000);
    let (secs, centis) = (rest / 100, rest % 100);
    format!("{hours}:{minutes:02}:{secs:02}.{centis:02}")
}

/// `HH:MM:SS,mmm` (a `.` separator is accepted too). Fractions shorter or
/// longer than three digits are read as decimal fractions of a second.
fn parse_srt_time(value: &str) -> Result<f64> {
    let invalid = || KaraokeError::validation(format!("invalid SRT timestamp `{value}`"));
    let (clock, fraction) = value
        .split_once(|c: char| c == ',' || c == '.')
        .ok_or_else(invalid)?;
    let digits = fraction.len();
    if !(1..=9).contains(&digits) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let fraction = fraction.parse::<f64>().map_err(|_| invalid())? / 10f64.powi(digits as i32);
    let mut parts = clock.split(':').map(str::parse::<u32>);
    let (Some(Ok(hours)), Some(Ok(minutes)), Some(Ok(seconds)), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    Ok(f64::from(hours) * 3600.0 + f64::from(minutes) * 60.0 + f64::from(seconds) + fraction)
}

/// `H:MM:SS.cc` or `MM:SS.cc`.
fn parse_ass_time(value: &str) -> Result<f64> {
    let invalid = || KaraokeError::validation(format!("invalid ASS timestamp `{value}`"));
    let parts: Vec<&str> = value.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => ("0", *m, *s),
        _ => return Err(invalid()),
    };
    let hours: f64 = hours.parse().map_err(|_| invalid())?;
    let minutes: f64 = minutes.parse().map_err(|_| invalid())?;
    let seconds: f64 = seconds.parse().map_err(|_| invalid())?;
    Ok(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn format_srt_time(seconds: f64) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let (hours, rest) = (total_millis / 3_600_000, total_millis % 3_600_000);
    let (minutes, rest) = (rest / 60_000, rest % 60_000);
    let (secs, millis) = (rest / 1000, rest % 1000);
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}

fn strip_override_codes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '{' => depth += 1,
            '}' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}
