//! Latin rendering of Indic-script transcripts so singers who cannot read
//! the script can follow along.

use deunicode::deunicode;

use crate::timeline::TranscriptSegment;

/// Language codes whose transcripts come back in a non-Latin Indic script.
pub const INDIC_LANGUAGES: [&str; 9] = ["as", "bn", "hi", "mr", "pa", "sa", "ta", "te", "ur"];

pub fn needs_romanization(language: Option<&str>) -> bool {
    language.is_some_and(|code| INDIC_LANGUAGES.contains(&code.to_ascii_lowercase().as_str()))
}

/// ASCII transliteration of `text` with diacritics dropped and whitespace
/// collapsed. Text that transliterates to nothing is returned trimmed but
/// otherwise untouched.
pub fn romanize(text: &str) -> String {
    let latin = deunicode(text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if latin.is_empty() {
        text.trim().to_string()
    } else {
        latin
    }
}

pub fn romanize_segments(segments: &[TranscriptSegment]) -> Vec<TranscriptSegment> {
    let romanized: Vec<TranscriptSegment> = segments
        .iter()
        .map(|segment| TranscriptSegment {
            text: romanize(&segment.text),
            start: segment.start,
            end: segment.end,
        })
        .collect();
    tracing::debug!(segments = romanized.len(), "romanised transcript");
    romanized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_indic_languages_are_romanized() {
        assert!(needs_romanization(Some("bn")));
        assert!(needs_romanization(Some("HI")));
        assert!(!needs_romanization(Some("en")));
        assert!(!needs_romanization(None));
    }

    #[test]
    fn strips_diacritics_and_collapses_spaces() {
        assert_eq!(romanize("  Rāma   ṭīkā "), "Rama tika");
        assert_eq!(romanize("plain words"), "plain words");
    }

    #[test]
    fn bengali_becomes_ascii() {
        let latin = romanize("আমি তোমায় ভালোবাসি");
        assert!(latin.is_ascii(), "{latin}");
        assert!(!latin.is_empty());
        assert!(latin.contains(' '), "{latin}");
    }

    #[test]
    fn keeps_segment_timing() {
        let segments = vec![TranscriptSegment {
            text: "নমস্কার".into(),
            start: 1.5,
            end: 3.0,
        }];
        let romanized = romanize_segments(&segments);
        assert_eq!((romanized[0].start, romanized[0].end), (1.5, 3.0));
        assert!(romanized[0].text.is_ascii());
    }
}
