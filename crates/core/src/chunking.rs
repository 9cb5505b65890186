use crate::error::ConfigError;
use crate::models::TextChunk;
use regex::Regex;
use serde::{Deserialize, Serialize};

const PAGE_MARKER_PATTERN: &str = r"--- Page (\d+) ---";

/// Sizes are counted in characters, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1_000,
            overlap_chars: 200,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chars == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.overlap_chars >= self.max_chars {
            return Err(ConfigError::OverlapTooLarge {
                max_chars: self.max_chars,
                overlap: self.overlap_chars,
            });
        }
        Ok(())
    }

    /// How far back from a window's end a natural break is searched for.
    fn lookback(&self) -> usize {
        self.max_chars / 5
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BreakClass {
    Whitespace,
    Sentence,
    Paragraph,
}

/// Splits `text` into overlapping windows of at most `max_chars` characters.
///
/// Each window that stops short of the end of the text is cut at the best
/// natural break inside its lookback (blank line, then sentence end, then
/// any whitespace), or hard-split at `max_chars` when none qualifies. The
/// following window starts exactly `overlap_chars` before that cut, so
/// dropping the first `overlap_chars` of every chunk after the first and
/// concatenating gives back `text` unchanged (see [`reconstruct`]).
pub fn split_text(text: &str, config: ChunkingConfig) -> Result<Vec<TextChunk>, ConfigError> {
    config.validate()?;
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = text.chars().collect();
    let byte_offsets: Vec<usize> = text
        .char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(text.len()))
        .collect();
    let markers = page_markers(text, &byte_offsets)?;

    let total = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let window_end = start + config.max_chars;
        if window_end >= total {
            chunks.push(make_chunk(text, &byte_offsets, &markers, start, total, chunks.len()));
            break;
        }

        let end = find_break(&chars, start, window_end, config).unwrap_or(window_end);
        chunks.push(make_chunk(text, &byte_offsets, &markers, start, end, chunks.len()));
        start = end - config.overlap_chars;
    }

    Ok(chunks)
}

/// Inverse of [`split_text`] for chunks produced with the same overlap.
pub fn reconstruct(chunks: &[TextChunk], overlap_chars: usize) -> String {
    let mut text = String::new();
    for (position, chunk) in chunks.iter().enumerate() {
        if position == 0 {
            text.push_str(&chunk.content);
        } else {
            text.extend(chunk.content.chars().skip(overlap_chars));
        }
    }
    text
}

fn find_break(
    chars: &[char],
    start: usize,
    window_end: usize,
    config: ChunkingConfig,
) -> Option<usize> {
    // A cut at or before start + overlap would not move the next window forward.
    let floor = (start + config.overlap_chars + 1).max(window_end.saturating_sub(config.lookback()));
    let mut best: Option<(BreakClass, usize)> = None;

    for position in (floor..=window_end).rev() {
        if let Some(class) = break_class(chars, position) {
            if best.map_or(true, |(current, _)| class > current) {
                best = Some((class, position));
            }
        }
    }

    best.map(|(_, position)| position)
}

/// Classifies a cut placed just before `chars[position]`.
fn break_class(chars: &[char], position: usize) -> Option<BreakClass> {
    if position == 0 || position > chars.len() {
        return None;
    }

    let previous = chars[position - 1];
    let before_previous = position.checked_sub(2).map(|index| chars[index]);

    if previous == '\n' && before_previous == Some('\n') {
        Some(BreakClass::Paragraph)
    } else if previous.is_whitespace() && matches!(before_previous, Some('.' | '!' | '?')) {
        Some(BreakClass::Sentence)
    } else if previous.is_whitespace() {
        Some(BreakClass::Whitespace)
    } else {
        None
    }
}

/// Character offsets of every page marker, paired with its page number.
fn page_markers(text: &str, byte_offsets: &[usize]) -> Result<Vec<(usize, u32)>, ConfigError> {
    let marker_re = Regex::new(PAGE_MARKER_PATTERN)?;
    Ok(marker_re
        .captures_iter(text)
        .filter_map(|capture| {
            let whole = capture.get(0)?;
            let page = capture.get(1)?.as_str().parse::<u32>().ok()?;
            let char_offset = byte_offsets.partition_point(|&offset| offset < whole.start());
            Some((char_offset, page))
        })
        .collect())
}

fn page_for_span(markers: &[(usize, u32)], start: usize, end: usize) -> Option<u32> {
    markers
        .iter()
        .rev()
        .find(|(offset, _)| *offset <= start)
        .or_else(|| markers.iter().find(|(offset, _)| *offset < end))
        .map(|(_, page)| *page)
}

fn make_chunk(
    text: &str,
    byte_offsets: &[usize],
    markers: &[(usize, u32)],
    start: usize,
    end: usize,
    ordinal: usize,
) -> TextChunk {
    TextChunk {
        content: text[byte_offsets[start]..byte_offsets[end]].to_string(),
        source_ordinal: ordinal as u64,
        start,
        end,
        page: page_for_span(markers, start, end),
    }
}
