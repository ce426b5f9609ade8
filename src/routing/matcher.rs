//! Route pattern matching.
//!
//! # Responsibilities
//! - Parse route patterns such as `/messaging` or `/resources/{name}`
//! - Match request paths segment by segment
//! - Capture `{param}` segments by name
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - A parameter captures exactly one non-empty segment
//! - No regex; matching is a single pass over the segments

use std::collections::HashMap;

/// Parameters captured from `{name}` segments.
pub type RouteParams = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A compiled route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Self {
        let segments = split(pattern)
            .map(|segment| {
                match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(name) => Segment::Param(name.to_string()),
                    None => Segment::Literal(segment.to_string()),
                }
            })
            .collect();
        Self { segments }
    }

    /// Whether the pattern has no parameters, i.e. matches one path only.
    pub fn is_static(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Match `path` (without query) and return the captured parameters.
    pub fn matches(&self, path: &str) -> Option<RouteParams> {
        let mut params = RouteParams::new();
        let mut parts = split(path);

        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(expected) if expected == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }

        if parts.next().is_some() {
            return None;
        }
        Some(params)
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_exact_path() {
        let pattern = RoutePattern::parse("/task.js");
        assert!(pattern.is_static());
        assert_eq!(pattern.matches("/task.js"), Some(RouteParams::new()));
        assert!(pattern.matches("/task.js/extra").is_none());
        assert!(pattern.matches("/Task.js").is_none());
    }

    #[test]
    fn captures_parameters() {
        let pattern = RoutePattern::parse("/resources/{kind}/{name}");
        assert!(!pattern.is_static());

        let params = pattern.matches("/resources/img/logo.png").unwrap();
        assert_eq!(params["kind"], "img");
        assert_eq!(params["name"], "logo.png");
    }

    #[test]
    fn missing_segments_do_not_match() {
        let pattern = RoutePattern::parse("/resources/{name}");
        assert!(pattern.matches("/resources").is_none());
        assert!(pattern.matches("/resources/").is_none());
        assert!(pattern.matches("/other/logo.png").is_none());
    }

    #[test]
    fn root_pattern() {
        let pattern = RoutePattern::parse("/");
        assert!(pattern.matches("/").is_some());
        assert!(pattern.matches("/sid/http://e.com/").is_none());
    }
}
