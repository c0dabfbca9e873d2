//! Source attributions attached to generated answers.

use serde::Serialize;

use crate::{search::SearchResult, text_util};

/// Root of every citation URL.
pub const DOCS_BASE_URL: &str = "https://developer.mozilla.org/en-US/docs/";

/// A cited chunk, numbered in the order it appeared in the prompt context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    /// 1-based, matching `<document index="N">` in the prompt.
    pub citation_number: usize,
    pub chunk_id: String,
    pub title: String,
    pub source_path: String,
    pub slug: Option<String>,
    pub heading: Option<String>,
    pub url: String,
    pub snippet: String,
    /// Fused retrieval score.
    pub similarity: f32,
    pub rerank_score: Option<f32>,
}

impl Citation {
    pub fn from_result(citation_number: usize, result: &SearchResult) -> Self {
        let heading = result.heading.as_ref().map(|h| h.text.clone());
        Self {
            citation_number,
            chunk_id: result.chunk_id.clone(),
            title: result.title.clone(),
            source_path: result.source_path.clone(),
            slug: result.slug.clone(),
            url: citation_url(result.slug.as_deref(), heading.as_deref()),
            heading,
            snippet: text_util::snippet(
                &result.content,
                text_util::SNIPPET_CHARS,
            ),
            similarity: result.score,
            rerank_score: result.rerank_score,
        }
    }
}

/// Number `results` as citations, in order.
pub fn citations(results: &[SearchResult]) -> Vec<Citation> {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| Citation::from_result(i + 1, r))
        .collect()
}

/// Fragment identifier for a heading.
///
/// Lowercases, removes periods, turns whitespace runs into `_` and drops
/// any other character that is not alphanumeric, `-` or `_`.
///
/// ```
/// use docrag::citation::heading_to_slug;
///
/// assert_eq!(heading_to_slug("Basic usage"), "basic_usage");
/// assert_eq!(
///     heading_to_slug("Using Array.prototype.map()"),
///     "using_arrayprototypemap"
/// );
/// ```
pub fn heading_to_slug(heading: &str) -> String {
    let mut out = String::with_capacity(heading.len());
    let mut pending_gap = false;

    for c in heading.trim().chars().flat_map(char::to_lowercase) {
        if c.is_whitespace() {
            pending_gap = true;
        } else if c.is_alphanumeric() || c == '-' || c == '_' {
            if pending_gap && !out.is_empty() {
                out.push('_');
            }
            pending_gap = false;
            out.push(c);
        }
    }

    out.trim_matches('_').to_string()
}

/// URL of a document, anchored at `heading` when it yields a non-empty
/// fragment. A document without a slug links to the docs root.
pub fn citation_url(slug: Option<&str>, heading: Option<&str>) -> String {
    let slug = slug.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty());
    let base = match slug {
        Some(slug) => format!("{DOCS_BASE_URL}{slug}"),
        None => DOCS_BASE_URL.to_string(),
    };

    match heading.map(heading_to_slug).filter(|f| !f.is_empty()) {
        Some(fragment) => format!("{base}#{fragment}"),
        None => base,
    }
}
