//! YAML frontmatter handling for markdown sources.
//!
//! A document may open with a `---` delimited YAML block. The block is
//! parsed into [`Frontmatter`] and stripped from the body; the number of
//! lines it occupied is kept so chunk line numbers still point into the
//! raw file.

use std::path::Path;

use serde_yaml_ng::Value;

use crate::error::Result;

/// Title used when no other source provides one.
pub const DEFAULT_TITLE: &str = "Untitled";

/// Typed frontmatter fields. Unknown keys are ignored.
///
/// Each field is read on its own: a number or boolean is kept as its text,
/// and a list or map is dropped without affecting the other fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frontmatter {
    pub title: Option<String>,
    pub slug: Option<String>,
    /// `page-type` in the YAML.
    pub page_type: Option<String>,
    pub sidebar: Option<String>,
}

impl Frontmatter {
    /// Read the known fields out of a YAML block. Fails only when the block
    /// is not valid YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: Value = serde_yaml_ng::from_str(yaml)?;
        let field = |key: &str| {
            let found = value.get(key)?;
            let text = scalar_text(found);
            if text.is_none() {
                tracing::debug!(key, "ignoring non-scalar frontmatter field");
            }
            text
        };
        Ok(Self {
            title: field("title"),
            slug: field("slug"),
            page_type: field("page-type"),
            sidebar: field("sidebar"),
        })
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A markdown source split into frontmatter and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMarkdown {
    pub frontmatter: Frontmatter,
    pub body: String,
    /// Raw line count minus body line count.
    pub line_offset: usize,
}

/// Split raw markdown into frontmatter and body.
///
/// Malformed YAML is logged and treated as empty frontmatter; the block is
/// still removed from the body so it never ends up in a chunk.
pub fn parse(raw: &str) -> ParsedMarkdown {
    let Some((yaml, body)) = split_block(raw) else {
        return ParsedMarkdown {
            frontmatter: Frontmatter::default(),
            body: raw.to_string(),
            line_offset: 0,
        };
    };

    let frontmatter = if yaml.trim().is_empty() {
        Frontmatter::default()
    } else {
        match Frontmatter::from_yaml(yaml) {
            Ok(fm) => fm,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed frontmatter");
                Frontmatter::default()
            }
        }
    };

    let line_offset = line_count(raw).saturating_sub(line_count(body));
    ParsedMarkdown {
        frontmatter,
        body: body.to_string(),
        line_offset,
    }
}

/// Returns `(yaml, body)` when `raw` opens with a closed `---` block.
fn split_block(raw: &str) -> Option<(&str, &str)> {
    let first_end = raw.find('\n')?;
    if raw[..first_end].trim_end() != "---" {
        return None;
    }

    let yaml_start = first_end + 1;
    let mut cursor = yaml_start;
    while cursor <= raw.len() {
        let line_end = raw[cursor..].find('\n').map(|i| cursor + i);
        let line = &raw[cursor..line_end.unwrap_or(raw.len())];
        if line.trim_end() == "---" {
            let yaml = &raw[yaml_start..cursor];
            let body = match line_end {
                Some(end) => &raw[end + 1..],
                None => "",
            };
            return Some((yaml, body));
        }
        cursor = line_end? + 1;
    }
    None
}

fn line_count(text: &str) -> usize {
    text.split('\n').count()
}

/// Resolve a document title.
///
/// Precedence: frontmatter `title`, then the first `# ` heading of the
/// body, then the file stem of `path`, then [`DEFAULT_TITLE`].
pub fn resolve_title(fm: &Frontmatter, body: &str, path: &Path) -> String {
    non_blank(fm.title.as_deref())
        .or_else(|| first_h1(body))
        .or_else(|| non_blank(path.file_stem().and_then(|s| s.to_str())))
        .unwrap_or(DEFAULT_TITLE)
        .to_string()
}

/// Resolve a document slug: frontmatter `slug`, otherwise none.
pub fn resolve_slug(fm: &Frontmatter) -> Option<String> {
    non_blank(fm.slug.as_deref()).map(|s| s.trim_matches('/').to_string())
}

fn first_h1(body: &str) -> Option<&str> {
    body.lines()
        .find_map(|line| line.strip_prefix("# "))
        .and_then(|rest| non_blank(Some(rest)))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
