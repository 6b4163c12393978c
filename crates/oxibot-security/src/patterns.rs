//! Pattern compilation shared by the blacklist, whitelist, and confirm lists.
//!
//! An entry is treated as a regular expression if it contains any regex
//! metacharacter, otherwise as a case-insensitive literal substring. Both
//! forms are compiled once up front so `matches` is a cheap scan at
//! dispatch time.

use regex::Regex;

const META_CHARS: &[char] = &[
    '.', '*', '+', '?', '(', ')', '[', ']', '{', '}', '|', '^', '$', '\\',
];

fn looks_like_regex(pattern: &str) -> bool {
    pattern.chars().any(|c| META_CHARS.contains(&c))
}

/// One compiled pattern: either a regex or a lowercased literal substring.
pub struct CompiledPattern {
    source: String,
    kind: PatternKind,
}

enum PatternKind {
    Regex(Regex),
    Literal(String),
}

impl CompiledPattern {
    /// Compile `pattern`. Falls back to literal matching if the string isn't
    /// valid regex syntax despite containing metacharacters — a malformed
    /// pattern should never be silently dropped.
    pub fn compile(pattern: &str) -> Self {
        let kind = if looks_like_regex(pattern) {
            match Regex::new(&format!("(?i){pattern}")) {
                Ok(re) => PatternKind::Regex(re),
                Err(_) => PatternKind::Literal(pattern.to_lowercase()),
            }
        } else {
            PatternKind::Literal(pattern.to_lowercase())
        };
        Self {
            source: pattern.to_string(),
            kind,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, text: &str) -> bool {
        match &self.kind {
            PatternKind::Regex(re) => re.is_match(text),
            PatternKind::Literal(lit) => text.to_lowercase().contains(lit.as_str()),
        }
    }
}

/// A compiled list of patterns, returning the first match (if any).
pub struct PatternList {
    patterns: Vec<CompiledPattern>,
}

impl PatternList {
    pub fn compile(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.iter().map(|p| CompiledPattern::compile(p)).collect(),
        }
    }

    pub fn empty() -> Self {
        Self { patterns: Vec::new() }
    }

    /// The source text of the first pattern matching `text`, if any.
    pub fn first_match(&self, text: &str) -> Option<&str> {
        self.patterns.iter().find(|p| p.matches(text)).map(|p| p.source())
    }
}
