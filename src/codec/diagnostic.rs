//! Diagnostic types produced while parsing documents.
//!
//! A [`ParseError`] marks a malformed structural marker. It is non-fatal for the sync
//! pipeline: the file is still indexed as a minimal entity and the error text is kept on the
//! entity row so status and queries can surface it.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseErrorKind {
    /// File bytes are not valid UTF-8.
    InvalidEncoding,
    /// Frontmatter opened with `---` but never closed.
    UnterminatedFrontmatter,
    /// Frontmatter is not valid YAML.
    InvalidFrontmatter(String),
    /// Frontmatter parsed, but to something other than a mapping.
    FrontmatterNotMapping,
    /// A list item opened a `[[` link that never closes.
    UnterminatedLink,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseErrorKind::InvalidEncoding => write!(f, "content is not valid UTF-8"),
            ParseErrorKind::UnterminatedFrontmatter => write!(f, "frontmatter block is not closed"),
            ParseErrorKind::InvalidFrontmatter(msg) => write!(f, "invalid frontmatter: {msg}"),
            ParseErrorKind::FrontmatterNotMapping => {
                write!(f, "frontmatter must be a mapping of keys to values")
            }
            ParseErrorKind::UnterminatedLink => write!(f, "unterminated [[ link"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    /// Project-relative path of the offending file
    pub path: String,
    pub kind: ParseErrorKind,
    /// 1-based line of the offending marker, when known
    pub line: Option<usize>,
}

impl ParseError {
    pub fn new(path: &str, kind: ParseErrorKind) -> ParseError {
        ParseError {
            path: path.to_string(),
            kind,
            line: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> ParseError {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "Parse error in {}:{}: {}", self.path, line, self.kind),
            None => write!(f, "Parse error in {}: {}", self.path, self.kind),
        }
    }
}

impl std::error::Error for ParseError {}

/// Convert a byte offset into a 1-based line number.
pub fn line_of(content: &str, offset: usize) -> usize {
    content
        .get(..offset)
        .map(|prefix| prefix.matches('\n').count() + 1)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_of() {
        let content = "one\ntwo\nthree";
        assert_eq!(line_of(content, 0), 1);
        assert_eq!(line_of(content, 4), 2);
        assert_eq!(line_of(content, 9), 3);
        assert_eq!(line_of(content, 500), 1);
    }

    #[test]
    fn test_display_includes_line() {
        let err = ParseError::new("notes/a.md", ParseErrorKind::UnterminatedLink).at_line(3);
        assert_eq!(
            err.to_string(),
            "Parse error in notes/a.md:3: unterminated [[ link"
        );
    }
}
