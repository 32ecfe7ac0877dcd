// src/expression/template.rs

//! Command template parsing.
//!
//! A template is literal text with `{{ path | filter | ... }}` placeholders.
//! Paths are dotted (`reads.fastq.file`, `proc.data_id`); list elements may
//! be addressed by index (`files.0`). Filters:
//!
//! - `quote`: shell-quote the rendered value
//! - `basename`: last path component
//! - `default("x")`: used when the value is missing or null
//! - `join(" ")`: join a list with the given separator

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::ResolutionError;

static EXPR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)((?:\s*\|\s*[A-Za-z_]+\s*(?:\(\s*"[^"]*"\s*\))?)*)$"#)
        .expect("placeholder regex is valid")
});

static FILTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\|\s*([A-Za-z_]+)\s*(?:\(\s*"([^"]*)"\s*\))?"#).expect("filter regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Quote,
    Basename,
    Default(String),
    Join(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder {
        path: Vec<String>,
        filters: Vec<Filter>,
        offset: usize,
    },
}

/// A parsed command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, ResolutionError> {
        let mut segments = Vec::new();
        let mut pos = 0;

        while let Some(rel_start) = source[pos..].find("{{") {
            let start = pos + rel_start;
            if start > pos {
                segments.push(Segment::Literal(source[pos..start].to_string()));
            }

            let body_start = start + 2;
            let Some(rel_end) = source[body_start..].find("}}") else {
                return Err(ResolutionError::Malformed {
                    offset: start,
                    reason: "unterminated '{{'".to_string(),
                });
            };
            let body = source[body_start..body_start + rel_end].trim();
            segments.push(parse_placeholder(body, start)?);
            pos = body_start + rel_end + 2;
        }

        if pos < source.len() {
            segments.push(Segment::Literal(source[pos..].to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// First path component of every placeholder, in order of appearance.
    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder { path, .. } => path.first().map(String::as_str),
            Segment::Literal(_) => None,
        })
    }
}

fn parse_placeholder(body: &str, offset: usize) -> Result<Segment, ResolutionError> {
    if body.is_empty() {
        return Err(ResolutionError::Malformed {
            offset,
            reason: "empty placeholder".to_string(),
        });
    }

    let caps = EXPR_RE.captures(body).ok_or_else(|| ResolutionError::Malformed {
        offset,
        reason: format!("cannot parse '{body}'"),
    })?;

    let path = caps[1].split('.').map(str::to_string).collect();

    let mut filters = Vec::new();
    if let Some(tail) = caps.get(2) {
        for fc in FILTER_RE.captures_iter(tail.as_str()) {
            let name = &fc[1];
            let arg = fc.get(2).map(|m| m.as_str().to_string());
            let filter = match (name, arg) {
                ("quote", None) => Filter::Quote,
                ("basename", None) => Filter::Basename,
                ("default", Some(a)) => Filter::Default(a),
                ("join", Some(a)) => Filter::Join(a),
                ("join", None) => Filter::Join(" ".to_string()),
                ("quote" | "basename", Some(_)) | ("default", None) => {
                    return Err(ResolutionError::Malformed {
                        offset,
                        reason: format!("wrong arguments for filter '{name}'"),
                    });
                }
                (other, _) => return Err(ResolutionError::UnknownFilter(other.to_string())),
            };
            filters.push(filter);
        }
    }

    Ok(Segment::Placeholder {
        path,
        filters,
        offset,
    })
}
