//! Path and host pattern matching with wildcard support.
//!
//! Patterns are split into segments on `/` (paths) or `.` (hosts):
//! - `*` matches exactly one segment, and globs within a segment (`res*`)
//! - `{var}` matches exactly one segment
//! - `**` matches zero or more segments
//! - Literal segments match exactly (hosts case-insensitively)

use crate::error::{GatewayError, Result};
use std::fmt;

/// Which kind of input a pattern matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Path,
    Host,
}

impl PatternKind {
    fn separator(&self) -> char {
        match self {
            PatternKind::Path => '/',
            PatternKind::Host => '.',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*` or `{var}`.
    Any,
    /// Literal text with embedded `*`.
    Glob(String),
    /// `**`.
    AnyDepth,
}

impl Segment {
    fn matches(&self, input: &str) -> bool {
        match self {
            Segment::Literal(literal) => literal == input,
            Segment::Any => !input.is_empty(),
            Segment::Glob(glob) => glob_match(glob.as_bytes(), input.as_bytes()),
            Segment::AnyDepth => true,
        }
    }
}

/// Compiled path or host pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    kind: PatternKind,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Compile a path pattern such as `/proxy/**`.
    pub fn path(pattern: &str) -> Result<Self> {
        if !pattern.starts_with('/') {
            return Err(GatewayError::InvalidPattern(format!(
                "path pattern '{}' must start with '/'",
                pattern
            )));
        }
        Self::compile(pattern, PatternKind::Path)
    }

    /// Compile a host pattern such as `*.spring.io`.
    pub fn host(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(GatewayError::InvalidPattern("empty host pattern".to_string()));
        }
        Self::compile(&pattern.to_ascii_lowercase(), PatternKind::Host)
    }

    fn compile(pattern: &str, kind: PatternKind) -> Result<Self> {
        let mut segments = Vec::new();
        for part in split(pattern, kind.separator()) {
            segments.push(parse_segment(pattern, part)?);
        }
        Ok(Self {
            raw: pattern.to_string(),
            kind,
            segments,
        })
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check if the pattern matches a request path or `Host` header value.
    pub fn matches(&self, input: &str) -> bool {
        match self.kind {
            PatternKind::Path => {
                let parts: Vec<&str> = split(input, '/').collect();
                matches_segments(&self.segments, &parts)
            }
            PatternKind::Host => {
                let host = strip_port(input).to_ascii_lowercase();
                let parts: Vec<&str> = split(&host, '.').collect();
                matches_segments(&self.segments, &parts)
            }
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Split on the separator, ignoring leading and trailing separators.
fn split(input: &str, separator: char) -> impl Iterator<Item = &str> {
    let trimmed = input.trim_matches(separator);
    trimmed
        .split(separator)
        .filter(move |_| !trimmed.is_empty())
}

fn parse_segment(pattern: &str, part: &str) -> Result<Segment> {
    let invalid = |reason: &str| {
        GatewayError::InvalidPattern(format!("'{}': {}", pattern, reason))
    };

    if part.is_empty() {
        return Err(invalid("empty segment"));
    }
    if part == "**" {
        return Ok(Segment::AnyDepth);
    }
    if part.contains("**") {
        return Err(invalid("** must be a whole segment"));
    }
    if part == "*" {
        return Ok(Segment::Any);
    }
    if part.starts_with('{') || part.ends_with('}') {
        let name = part
            .strip_prefix('{')
            .and_then(|p| p.strip_suffix('}'))
            .ok_or_else(|| invalid("unbalanced variable braces"))?;
        if name.is_empty() || name.contains(['{', '}', '*']) {
            return Err(invalid("invalid variable name"));
        }
        return Ok(Segment::Any);
    }
    if part.contains(['{', '}']) {
        return Err(invalid("variables must be a whole segment"));
    }
    if part.contains('*') {
        return Ok(Segment::Glob(part.to_string()));
    }
    Ok(Segment::Literal(part.to_string()))
}

fn matches_segments(pattern: &[Segment], input: &[&str]) -> bool {
    match pattern.split_first() {
        None => input.is_empty(),
        Some((Segment::AnyDepth, rest)) => {
            (0..=input.len()).any(|skip| matches_segments(rest, &input[skip..]))
        }
        Some((segment, rest)) => match input.split_first() {
            Some((head, tail)) => segment.matches(head) && matches_segments(rest, tail),
            None => false,
        },
    }
}

/// Match `*` against any run of characters within one segment.
fn glob_match(glob: &[u8], text: &[u8]) -> bool {
    let (mut g, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if g < glob.len() && glob[g] == b'*' {
            star = Some((g, t));
            g += 1;
        } else if g < glob.len() && glob[g] == text[t] {
            g += 1;
            t += 1;
        } else if let Some((star_g, star_t)) = star {
            // Let the last star absorb one more character.
            g = star_g + 1;
            t = star_t + 1;
            star = Some((star_g, star_t + 1));
        } else {
            return false;
        }
    }

    glob[g..].iter().all(|&c| c == b'*')
}

/// Drop a trailing `:port` from a host header value.
fn strip_port(host: &str) -> &str {
    if host.ends_with(']') {
        return host;
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
