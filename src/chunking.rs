//! Chunking utilities for splitting markdown documents into overlapping
//! segments.
//!
//! Splitting is recursive: the coarsest separator present in the text is
//! tried first (heading markers, then paragraph breaks, line breaks, words
//! and finally single characters), and a piece is only split further when
//! it is still at least as long as the target size. Neighbouring pieces are
//! merged back up to the target size, carrying up to `overlap` characters
//! of the previous chunk into the next one.
//!
//! Every chunk is then located in the source file to attach a line range and
//! the nearest preceding heading.

use serde::{Deserialize, Serialize};

/// Target chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Overlap carried from one chunk into the next, in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Separator hierarchy, coarsest first. Separators are kept at the head of
/// the piece that follows them.
pub const SEPARATORS: &[&str] = &[
    "\n## ", "\n### ", "\n#### ", "\n##### ", "\n\n", "\n", " ", "",
];

/// Name reported for this splitting strategy in chunk dumps.
pub const STRATEGY: &str = "recursive-character";

/// Chunking configuration.
///
/// # Examples
///
/// ```
/// use docrag::chunking::{ChunkingConfig, DEFAULT_CHUNK_SIZE};
///
/// let config = ChunkingConfig::default();
/// assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
/// assert!(config.overlap < config.chunk_size);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks in characters.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

/// A markdown heading found in the source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heading {
    pub text: String,
    /// 1 for `#`, up to 6 for `######`.
    pub level: u8,
    /// 1-based line number in the raw file.
    pub line_number: usize,
}

/// Inclusive, 1-based line range of a chunk in the raw file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

/// A chunk produced by [`chunk_document`], before it is assigned to a
/// stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCandidate {
    pub content: String,
    /// Zero-based chunk index within the document.
    pub index: usize,
    pub lines: LineRange,
    pub heading: Option<Heading>,
    pub character_count: usize,
    pub word_count: usize,
}

/// Split a document body and attach positional metadata.
///
/// `raw` is the full file (frontmatter included), `body` the text after the
/// frontmatter and `line_offset` the number of lines the frontmatter took.
/// An empty or whitespace-only body yields no chunks.
///
/// # Examples
///
/// ```
/// use docrag::chunking::{chunk_document, ChunkingConfig};
///
/// let raw = "# Intro\n\nHello, world!";
/// let chunks = chunk_document(raw, raw, 0, &ChunkingConfig::default());
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].lines.start, 1);
/// assert_eq!(chunks[0].heading.as_ref().unwrap().text, "Intro");
/// ```
pub fn chunk_document(
    raw: &str,
    body: &str,
    line_offset: usize,
    config: &ChunkingConfig,
) -> Vec<ChunkCandidate> {
    if body.trim().is_empty() {
        return Vec::new();
    }

    let headings = heading_index(raw, line_offset);
    split_text(body, config)
        .into_iter()
        .enumerate()
        .map(|(index, content)| {
            let lines = locate_lines(body, &content, line_offset);
            let heading = nearest_heading(&headings, lines.start).cloned();
            ChunkCandidate {
                character_count: content.chars().count(),
                word_count: content.split_whitespace().count(),
                content,
                index,
                lines,
                heading,
            }
        })
        .collect()
}

/// Split text with the recursive separator hierarchy.
///
/// Deterministic: identical input always produces identical output.
///
/// ```
/// use docrag::chunking::{split_text, ChunkingConfig};
///
/// let text = "word ".repeat(500);
/// let chunks = split_text(&text, &ChunkingConfig::default());
/// assert!(chunks.len() >= 3);
/// assert!(chunks.iter().all(|c| c.chars().count() <= 1000));
/// ```
pub fn split_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    Splitter { config }.split(text, SEPARATORS)
}

struct Splitter<'a> {
    config: &'a ChunkingConfig,
}

impl Splitter<'_> {
    fn split(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (separator, finer) = pick_separator(text, separators);
        let mut chunks = Vec::new();
        let mut small: Vec<&str> = Vec::new();

        for piece in split_keeping_separator(text, separator) {
            if char_len(piece) < self.config.chunk_size {
                small.push(piece);
                continue;
            }

            if !small.is_empty() {
                chunks.extend(self.merge(&small));
                small.clear();
            }

            if finer.is_empty() {
                chunks.push(piece.to_string());
            } else {
                chunks.extend(self.split(piece, finer));
            }
        }

        if !small.is_empty() {
            chunks.extend(self.merge(&small));
        }

        chunks
    }

    /// Greedily pack pieces up to the chunk size, keeping a tail of at most
    /// `overlap` characters as the start of the next chunk.
    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let ChunkingConfig {
            chunk_size,
            overlap,
        } = *self.config;
        let mut merged = Vec::new();
        let mut window: std::collections::VecDeque<&str> =
            std::collections::VecDeque::new();
        let mut total = 0;

        for &piece in pieces {
            let len = char_len(piece);
            if total + len > chunk_size && !window.is_empty() {
                if let Some(chunk) = join_trimmed(&window) {
                    merged.push(chunk);
                }
                while total > overlap || (total + len > chunk_size && total > 0)
                {
                    let Some(front) = window.pop_front() else {
                        break;
                    };
                    total -= char_len(front);
                }
            }
            window.push_back(piece);
            total += len;
        }

        if let Some(chunk) = join_trimmed(&window) {
            merged.push(chunk);
        }
        merged
    }
}

/// The first separator present in `text`, and the finer ones after it.
fn pick_separator<'a>(
    text: &str,
    separators: &'a [&'a str],
) -> (&'a str, &'a [&'a str]) {
    for (i, &sep) in separators.iter().enumerate() {
        if sep.is_empty() {
            return (sep, &[]);
        }
        if text.contains(sep) {
            return (sep, &separators[i + 1..]);
        }
    }
    ("", &[])
}

/// Split before every occurrence of `separator` (overlapping occurrences
/// included) so the separator stays attached to the following piece. An
/// empty separator splits into single characters.
fn split_keeping_separator<'t>(text: &'t str, separator: &str) -> Vec<&'t str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }

    let mut cuts = Vec::new();
    let mut from = 0;
    while let Some(found) = text[from..].find(separator) {
        let at = from + found;
        if at > 0 {
            cuts.push(at);
        }
        from = at + text[at..].chars().next().map_or(1, char::len_utf8);
    }

    let mut pieces = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        pieces.push(&text[start..cut]);
        start = cut;
    }
    pieces.push(&text[start..]);
    pieces.retain(|p| !p.is_empty());
    pieces
}

fn join_trimmed(window: &std::collections::VecDeque<&str>) -> Option<String> {
    let joined: String = window.iter().copied().collect();
    let trimmed = joined.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Collect every ATX heading of the raw file, skipping the first
/// `skip_lines` lines (the frontmatter block).
pub fn heading_index(raw: &str, skip_lines: usize) -> Vec<Heading> {
    raw.split('\n')
        .enumerate()
        .skip(skip_lines)
        .filter_map(|(i, line)| parse_heading(line, i + 1))
        .collect()
}

fn parse_heading(line: &str, line_number: usize) -> Option<Heading> {
    let line = line.trim_end_matches('\r');
    let level = line.bytes().take_while(|&b| b == b'#').count();
    if !(1..=6).contains(&level) {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(|c: char| c.is_whitespace()) {
        return None;
    }
    let text = rest.trim();
    if text.is_empty() {
        return None;
    }
    Some(Heading {
        text: text.to_string(),
        level: level as u8,
        line_number,
    })
}

/// The closest heading at or before `start_line`, if any.
///
/// `headings` must be sorted by line number, as [`heading_index`] returns
/// them.
pub fn nearest_heading(
    headings: &[Heading],
    start_line: usize,
) -> Option<&Heading> {
    let after = headings.partition_point(|h| h.line_number <= start_line);
    after.checked_sub(1).map(|i| &headings[i])
}

/// Find the line range of `chunk` inside `body`, shifted by `line_offset`.
///
/// Tries, in order: a line-by-line window match ignoring surrounding
/// whitespace, an exact substring match, a match on the first (and then
/// last) chunk line, and finally an estimate anchored at line 1.
pub fn locate_lines(body: &str, chunk: &str, line_offset: usize) -> LineRange {
    let body_lines: Vec<&str> = body.split('\n').map(str::trim).collect();
    let chunk_lines: Vec<&str> = chunk.split('\n').map(str::trim).collect();
    let span = chunk_lines.len();
    let shifted = |start: usize, end: usize| LineRange {
        start: start + line_offset,
        end: end + line_offset,
    };

    if span <= body_lines.len()
        && let Some(i) = body_lines
            .windows(span)
            .position(|window| window == chunk_lines.as_slice())
    {
        return shifted(i + 1, i + span);
    }

    if let Some(byte) = body.find(chunk) {
        let start = body[..byte].split('\n').count();
        return shifted(start, start + span - 1);
    }

    let first = chunk_lines[0];
    let last = chunk_lines[span - 1];
    if !first.is_empty()
        && let Some(i) = body_lines.iter().position(|l| *l == first)
    {
        if let Some(j) = body_lines[i..].iter().position(|l| *l == last) {
            return shifted(i + 1, i + j + 1);
        }
        return shifted(i + 1, (i + span).min(body_lines.len()));
    }

    shifted(1, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_markdown() -> String {
        let mut doc = String::from("Intro paragraph before any heading.\n\n");
        for section in 0..6 {
            doc.push_str(&format!("## Section {section}\n\n"));
            for para in 0..4 {
                doc.push_str(&format!(
                    "Paragraph {para} of section {section}. {}\n\n",
                    "Lorem ipsum dolor sit amet. ".repeat(6)
                ));
            }
        }
        doc
    }

    #[test]
    fn empty_body_yields_no_chunks() {
        let config = ChunkingConfig::default();
        assert!(chunk_document("", "", 0, &config).is_empty());
        assert!(chunk_document("\n  \n", "\n  \n", 0, &config).is_empty());
    }

    #[test]
    fn short_text_single_chunk() {
        let chunks = split_text("Hello, world!", &ChunkingConfig::default());
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn chunks_respect_size_limit() {
        let doc = long_markdown();
        let chunks = split_text(&doc, &ChunkingConfig::default());
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= DEFAULT_CHUNK_SIZE);
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let doc = long_markdown();
        let config = ChunkingConfig::default();
        let a = chunk_document(&doc, &doc, 0, &config);
        let b = chunk_document(&doc, &doc, 0, &config);
        assert_eq!(a, b);
        for (i, chunk) in a.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn word_level_chunks_overlap() {
        let text = (0..600)
            .map(|i| format!("w{i:03}"))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = split_text(&text, &ChunkingConfig::default());
        assert!(chunks.len() >= 3);
        for pair in chunks.windows(2) {
            let head = &pair[1][..20];
            assert!(pair[0].contains(head), "missing overlap for {head:?}");
        }
    }

    #[test]
    fn separator_is_kept_with_following_piece() {
        let config = ChunkingConfig {
            chunk_size: 30,
            overlap: 0,
        };
        let text = "alpha beta gamma\n## Heading two\nmore text here";
        let chunks = split_text(text, &config);
        assert!(chunks.iter().any(|c| c.starts_with("## Heading two")));
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "café ☕ naïve 日本語 🎉 ".repeat(80);
        let config = ChunkingConfig {
            chunk_size: 100,
            overlap: 20,
        };
        let chunks = split_text(&text, &config);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
    }

    #[test]
    fn heading_before_any_heading_is_none() {
        let raw = "intro line\n\n# Title\n\nbody";
        let headings = heading_index(raw, 0);
        assert_eq!(headings.len(), 1);
        assert_eq!(nearest_heading(&headings, 1), None);
        assert_eq!(nearest_heading(&headings, 2), None);
    }

    #[test]
    fn chunk_starting_on_heading_line_gets_it() {
        let raw = "intro line\n\n# Title\n\nbody\n## Sub\ntext";
        let headings = heading_index(raw, 0);
        let on_line = nearest_heading(&headings, 3).unwrap();
        assert_eq!(on_line.text, "Title");
        assert_eq!(on_line.level, 1);
        assert_eq!(on_line.line_number, 3);

        let later = nearest_heading(&headings, 7).unwrap();
        assert_eq!(later.text, "Sub");
        assert_eq!(later.level, 2);
    }

    #[test]
    fn heading_requires_space_and_text() {
        let headings = heading_index("#hashtag\n#######x\n#   \n### ok", 0);
        assert_eq!(headings.len(), 1);
        assert_eq!(headings[0].text, "ok");
        assert_eq!(headings[0].line_number, 4);
    }

    #[test]
    fn document_without_headings_has_null_context() {
        let doc = "plain text\n\nmore plain text";
        let chunks = chunk_document(doc, doc, 0, &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].heading.is_none());
    }

    #[test]
    fn frontmatter_offset_shifts_lines() {
        let raw = "---\ntitle: X\n---\n# Hello\nworld";
        let parsed = crate::frontmatter::parse(raw);
        let chunks = chunk_document(
            raw,
            &parsed.body,
            parsed.line_offset,
            &ChunkingConfig::default(),
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].lines, LineRange { start: 4, end: 5 });
        let heading = chunks[0].heading.as_ref().unwrap();
        assert_eq!(heading.text, "Hello");
        assert_eq!(heading.line_number, 4);
    }

    #[test]
    fn locate_tolerates_indentation() {
        let body = "a\n    indented line\nnext\nz";
        let range = locate_lines(body, "indented line\nnext", 0);
        assert_eq!(range, LineRange { start: 2, end: 3 });
    }

    #[test]
    fn locate_mid_line_chunk_uses_substring() {
        let body = "first line\nsecond half of line\nthird";
        let range = locate_lines(body, "half of line\nthird", 2);
        assert_eq!(range, LineRange { start: 4, end: 5 });
    }

    #[test]
    fn locate_falls_back_to_estimate() {
        let body = "one\ntwo\nthree";
        let range = locate_lines(body, "nothing\nmatches\nhere", 1);
        assert_eq!(range, LineRange { start: 2, end: 4 });
    }

    #[test]
    fn counts_characters_and_words() {
        let doc = "## Über\n\nzwei Wörter";
        let chunks = chunk_document(doc, doc, 0, &ChunkingConfig::default());
        assert_eq!(chunks[0].character_count, doc.chars().count());
        assert_eq!(chunks[0].word_count, 4);
    }
}
