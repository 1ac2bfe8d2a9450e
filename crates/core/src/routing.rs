//! Express-style path matching and the route table.
//!
//! Patterns support literal segments, `:name` captures, and `*` wildcards
//! (`*` swallows the rest of the path). A pattern can also be matched as a
//! boundary prefix, which is what scoped middleware uses: `/api` covers
//! `/api` and `/api/users` but not `/apix`.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};

/// Captured `:name` and wildcard values.
pub type PathParams = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

/// One parsed path pattern.
#[derive(Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Parse a pattern. Leading and trailing slashes are insignificant.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let segments = split(raw)
            .map(|part| {
                if part == "*" {
                    Segment::Wildcard
                } else if let Some(name) = part.strip_prefix(':') {
                    Segment::Param(name.to_owned())
                } else {
                    Segment::Literal(part.to_owned())
                }
            })
            .collect();
        Self {
            raw: raw.to_owned(),
            segments,
        }
    }

    /// The pattern as written.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// `true` when the pattern contains no captures or wildcards.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }

    /// Match the whole path; captures land in the returned params.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        self.match_segments(path, false)
    }

    /// Match as a boundary prefix of `path`.
    #[must_use]
    pub fn matches_prefix(&self, path: &str) -> Option<PathParams> {
        self.match_segments(path, true)
    }

    fn match_segments(&self, path: &str, prefix: bool) -> Option<PathParams> {
        let parts: Vec<&str> = split(path).collect();
        let mut params = PathParams::new();
        let mut wildcard_index = 0usize;
        let mut cursor = 0usize;

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Wildcard => {
                    // The wildcard swallows everything that is left.
                    let rest = parts.get(cursor..).unwrap_or_default().join("/");
                    params.insert(wildcard_index.to_string(), rest);
                    wildcard_index += 1;
                    cursor = parts.len();
                    // Segments after a trailing wildcard cannot match.
                    if index + 1 != self.segments.len() {
                        return None;
                    }
                    break;
                }
                Segment::Param(name) => {
                    let part = parts.get(cursor)?;
                    params.insert(name.clone(), (*part).to_owned());
                    cursor += 1;
                }
                Segment::Literal(expected) => {
                    let part = parts.get(cursor)?;
                    if part != expected {
                        return None;
                    }
                    cursor += 1;
                }
            }
        }

        if cursor == parts.len() || prefix {
            Some(params)
        } else {
            None
        }
    }
}

impl Debug for PathPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PathPattern({})", self.raw)
    }
}
impl Display for PathPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
impl From<&str> for PathPattern {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}
impl From<String> for PathPattern {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.trim_start_matches('/')
        .trim_end_matches('/')
        .split('/')
        .filter(|part| !part.is_empty())
}

/// Any-of set of patterns, the shape route registration accepts.
#[derive(Debug, Clone)]
pub struct PathSet(Vec<PathPattern>);

impl PathSet {
    /// The patterns in this set.
    #[must_use]
    pub fn patterns(&self) -> &[PathPattern] {
        &self.0
    }

    /// First pattern that matches the whole path.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        self.0.iter().find_map(|pattern| pattern.matches(path))
    }

    /// First pattern that matches as a boundary prefix.
    #[must_use]
    pub fn matches_prefix(&self, path: &str) -> Option<PathParams> {
        self.0
            .iter()
            .find_map(|pattern| pattern.matches_prefix(path))
    }

    /// `true` when some member is the literal `path`.
    #[must_use]
    pub fn contains_raw(&self, path: &str) -> bool {
        self.0.iter().any(|pattern| pattern.raw == path)
    }
}

impl From<PathPattern> for PathSet {
    fn from(pattern: PathPattern) -> Self {
        Self(vec![pattern])
    }
}
impl From<&str> for PathSet {
    fn from(raw: &str) -> Self {
        Self(vec![PathPattern::parse(raw)])
    }
}
impl From<String> for PathSet {
    fn from(raw: String) -> Self {
        Self(vec![PathPattern::parse(&raw)])
    }
}
impl From<Vec<&str>> for PathSet {
    fn from(patterns: Vec<&str>) -> Self {
        Self(patterns.into_iter().map(PathPattern::parse).collect())
    }
}
impl From<Vec<String>> for PathSet {
    fn from(patterns: Vec<String>) -> Self {
        Self(patterns.iter().map(|raw| PathPattern::parse(raw)).collect())
    }
}

/// Token for removing a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(u64);

struct RouteEntry<T> {
    id: u64,
    paths: PathSet,
    value: T,
}

/// Registration-ordered route table.
///
/// Resolution prefers a literal pattern equal to the requested path (the
/// most specific literal wins) and only then walks parameterized patterns in
/// registration order.
pub struct RouteTable<T> {
    routes: Vec<RouteEntry<T>>,
    next_id: u64,
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RouteTable<T> {
    /// New, empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            next_id: 1,
        }
    }

    /// Register `value` under `paths`.
    pub fn add(&mut self, paths: impl Into<PathSet>, value: T) -> RouteId {
        let id = self.next_id;
        self.next_id += 1;
        self.routes.push(RouteEntry {
            id,
            paths: paths.into(),
            value,
        });
        RouteId(id)
    }

    /// Remove one registration by token.
    pub fn remove(&mut self, id: RouteId) {
        self.routes.retain(|entry| entry.id != id.0);
    }

    /// Remove every registration that listed the literal `path`.
    pub fn remove_path(&mut self, path: &str) {
        self.routes.retain(|entry| !entry.paths.contains_raw(path));
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Resolve a request path to a handler and its captures.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<(&T, PathParams)> {
        // Literal routes first; the longest literal is the most specific.
        let mut best_literal: Option<(&RouteEntry<T>, usize)> = None;
        for entry in &self.routes {
            for pattern in entry.paths.patterns() {
                if pattern.is_literal() && pattern.matches(path).is_some() {
                    let length = pattern.raw().len();
                    if best_literal.is_none_or(|(_, best)| length > best) {
                        best_literal = Some((entry, length));
                    }
                }
            }
        }
        if let Some((entry, _)) = best_literal {
            return Some((&entry.value, PathParams::new()));
        }

        // Then parameterized patterns, in registration order.
        for entry in &self.routes {
            for pattern in entry.paths.patterns() {
                if pattern.is_literal() {
                    continue;
                }
                if let Some(params) = pattern.matches(path) {
                    return Some((&entry.value, params));
                }
            }
        }
        None
    }
}

impl<T> Debug for RouteTable<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_param_matching() {
        let pattern = PathPattern::parse("/users/:id/posts");
        let params = pattern.matches("/users/42/posts").expect("match");
        assert_eq!(params["id"], "42");
        assert!(pattern.matches("/users/42").is_none());
        assert!(pattern.matches("/users/42/posts/7").is_none());

        // Slashes are normalized.
        assert!(PathPattern::parse("users").matches("/users/").is_some());
    }

    #[test]
    fn wildcard_swallows_the_rest() {
        let pattern = PathPattern::parse("/files/*");
        let params = pattern.matches("/files/a/b/c.txt").expect("match");
        assert_eq!(params["0"], "a/b/c.txt");
        // A bare wildcard also matches the empty remainder.
        assert!(pattern.matches("/files").is_some());
        assert!(pattern.matches("/docs/a").is_none());
    }

    #[test]
    fn prefix_matching_respects_boundaries() {
        let pattern = PathPattern::parse("/api");
        assert!(pattern.matches_prefix("/api").is_some());
        assert!(pattern.matches_prefix("/api/users").is_some());
        assert!(pattern.matches_prefix("/apix").is_none());
    }

    #[test]
    fn any_of_sets() {
        let set: PathSet = vec!["/a", "/b/:x"].into();
        assert!(set.matches("/a").is_some());
        assert_eq!(set.matches("/b/7").expect("match")["x"], "7");
        assert!(set.matches("/c").is_none());
    }

    #[test]
    fn resolution_prefers_literal_over_param() {
        let mut table = RouteTable::new();
        table.add("/users/:id", "param");
        table.add("/users/me", "literal");
        let (value, params) = table.resolve("/users/me").expect("match");
        assert_eq!(*value, "literal");
        assert!(params.is_empty());

        let (value, params) = table.resolve("/users/42").expect("match");
        assert_eq!(*value, "param");
        assert_eq!(params["id"], "42");
    }

    #[test]
    fn removal_by_token_and_by_path() {
        let mut table = RouteTable::new();
        let id = table.add("/a", 1);
        table.add("/b", 2);
        table.remove(id);
        assert!(table.resolve("/a").is_none());
        table.remove_path("/b");
        assert!(table.is_empty());
    }
}
