//! String, header, and domain matchers used by validated route
//! configurations. These are plain value types: construction validates the
//! inputs (regex compilation, range ordering) and matching is pure.

use std::fmt;
use std::ops::Deref;

use regex::Regex;

use crate::errors::{MeshwireError, Result};

/// A compiled regex that compares by pattern, so validated resources
/// containing one stay semantically comparable.
#[derive(Clone)]
pub struct SafeRegex {
    pattern: String,
    regex: Regex,
}

impl SafeRegex {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            MeshwireError::validation(format!("invalid regex '{}': {}", pattern, e))
        })?;
        Ok(Self { pattern: pattern.to_string(), regex })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Full-string match, like RE2::FullMatch.
    pub fn full_match(&self, value: &str) -> bool {
        match self.regex.find(value) {
            Some(m) => m.start() == 0 && m.end() == value.len(),
            None => false,
        }
    }
}

impl Deref for SafeRegex {
    type Target = Regex;

    fn deref(&self) -> &Regex {
        &self.regex
    }
}

impl PartialEq for SafeRegex {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for SafeRegex {}

impl fmt::Debug for SafeRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SafeRegex({:?})", self.pattern)
    }
}

/// Matches a string value against a fixed pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum StringMatcher {
    Exact { value: String, case_sensitive: bool },
    Prefix { value: String, case_sensitive: bool },
    Suffix { value: String, case_sensitive: bool },
    Contains { value: String, case_sensitive: bool },
    /// `case_sensitive` does not apply to regex matching.
    SafeRegex(SafeRegex),
}

impl StringMatcher {
    pub fn matches(&self, value: &str) -> bool {
        fn fold<'a>(s: &'a str, case_sensitive: bool) -> std::borrow::Cow<'a, str> {
            if case_sensitive {
                std::borrow::Cow::Borrowed(s)
            } else {
                std::borrow::Cow::Owned(s.to_ascii_lowercase())
            }
        }
        match self {
            StringMatcher::Exact { value: pattern, case_sensitive } => {
                fold(value, *case_sensitive) == fold(pattern, *case_sensitive)
            }
            StringMatcher::Prefix { value: pattern, case_sensitive } => {
                fold(value, *case_sensitive).starts_with(fold(pattern, *case_sensitive).as_ref())
            }
            StringMatcher::Suffix { value: pattern, case_sensitive } => {
                fold(value, *case_sensitive).ends_with(fold(pattern, *case_sensitive).as_ref())
            }
            StringMatcher::Contains { value: pattern, case_sensitive } => {
                fold(value, *case_sensitive).contains(fold(pattern, *case_sensitive).as_ref())
            }
            StringMatcher::SafeRegex(regex) => regex.full_match(value),
        }
    }
}

/// Matches a request header (metadata entry) by name.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderMatcher {
    pub name: String,
    pub kind: HeaderMatcherKind,
    pub invert: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderMatcherKind {
    String(StringMatcher),
    /// Matches integer values in `[start, end)`.
    Range { start: i64, end: i64 },
    /// Matches on header presence/absence.
    Present(bool),
}

impl HeaderMatcher {
    pub fn range(name: impl Into<String>, start: i64, end: i64, invert: bool) -> Result<Self> {
        if end < start {
            return Err(MeshwireError::validation(
                "invalid range specifier: end cannot be smaller than start",
            ));
        }
        Ok(Self { name: name.into(), kind: HeaderMatcherKind::Range { start, end }, invert })
    }

    /// Match against the header value; `None` means the header is absent.
    pub fn matches(&self, value: Option<&str>) -> bool {
        let matched = match &self.kind {
            HeaderMatcherKind::Present(present) => value.is_some() == *present,
            HeaderMatcherKind::Range { start, end } => match value {
                Some(v) => match v.trim().parse::<i64>() {
                    Ok(n) => n >= *start && n < *end,
                    Err(_) => false,
                },
                None => false,
            },
            HeaderMatcherKind::String(matcher) => match value {
                Some(v) => matcher.matches(v),
                None => false,
            },
        };
        matched != self.invert
    }
}

/// How a virtual-host domain pattern matches a host name. Ordered by
/// selection preference: exact beats suffix beats prefix beats universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DomainMatchType {
    Exact,
    Suffix,
    Prefix,
    Universe,
}

/// Classify a domain pattern. Returns `None` for invalid patterns (empty,
/// or `*` in a position that is neither edge).
pub fn domain_pattern_type(pattern: &str) -> Option<DomainMatchType> {
    if pattern.is_empty() {
        return None;
    }
    if !pattern.contains('*') {
        return Some(DomainMatchType::Exact);
    }
    if pattern == "*" {
        return Some(DomainMatchType::Universe);
    }
    if let Some(rest) = pattern.strip_prefix('*') {
        if !rest.contains('*') {
            return Some(DomainMatchType::Suffix);
        }
    }
    if let Some(rest) = pattern.strip_suffix('*') {
        if !rest.contains('*') {
            return Some(DomainMatchType::Prefix);
        }
    }
    None
}

/// Case-insensitive domain match.
pub fn domain_matches(match_type: DomainMatchType, pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    match match_type {
        DomainMatchType::Exact => host == pattern,
        DomainMatchType::Suffix => host.ends_with(&pattern[1..]),
        DomainMatchType::Prefix => host.starts_with(&pattern[..pattern.len() - 1]),
        DomainMatchType::Universe => true,
    }
}
