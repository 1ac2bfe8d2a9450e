//! Client-side cookie jar.
//!
//! Cookies are keyed by `(name, path)` and selected for a request by
//! RFC-style path matching, most specific path first. `Set-Cookie` lines
//! from replies are ingested as-is; a removal cookie (empty value with a
//! zero max-age or a past expiry) deletes the stored entry.

use std::fmt::{self, Debug, Formatter};

use cookie::Cookie;
use cookie::time::{Duration as CookieDuration, OffsetDateTime};
use parking_lot::Mutex;
use serde_json::{Map, Value};

struct StoredCookie {
    name: String,
    value: String,
    path: String,
    expires_at: Option<OffsetDateTime>,
}

impl StoredCookie {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Cookie jar attached to a client endpoint.
#[derive(Default)]
pub struct CookieStore {
    entries: Mutex<Vec<StoredCookie>>,
}

impl CookieStore {
    /// New, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cookie. Replaces an entry with the same `(name, path)`.
    pub fn set(&self, cookie: &Cookie<'_>) {
        let now = OffsetDateTime::now_utc();
        let path = cookie.path().unwrap_or("/").to_owned();
        let expires_at = expiry_of(cookie, now);
        let removal = cookie.value().is_empty() && expires_at.is_some_and(|at| at <= now);

        let mut entries = self.entries.lock();
        entries.retain(|entry| !(entry.name == cookie.name() && entry.path == path));
        if removal {
            return;
        }
        entries.push(StoredCookie {
            name: cookie.name().to_owned(),
            value: cookie.value().to_owned(),
            path,
            expires_at,
        });
    }

    /// Convenience setter for a session cookie on `/`.
    pub fn set_value(&self, name: &str, value: &str) {
        self.set(&Cookie::new(name.to_owned(), value.to_owned()));
    }

    /// First live value of `name` on any path, most specific path first.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        let now = OffsetDateTime::now_utc();
        let entries = self.entries.lock();
        let mut candidates: Vec<&StoredCookie> = entries
            .iter()
            .filter(|entry| entry.name == name && !entry.is_expired(now))
            .collect();
        candidates.sort_by_key(|entry| std::cmp::Reverse(entry.path.len()));
        candidates.first().map(|entry| entry.value.clone())
    }

    /// Remove `name`; with `path` given, only that entry.
    pub fn clear(&self, name: &str, path: Option<&str>) {
        self.entries
            .lock()
            .retain(|entry| entry.name != name || path.is_some_and(|p| p != entry.path));
    }

    /// Drop everything.
    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    /// Ingest `Set-Cookie` lines from a reply.
    pub fn ingest_set_cookie<'a>(&self, lines: impl IntoIterator<Item = &'a str>) {
        for line in lines {
            match Cookie::parse(line.to_owned()) {
                Ok(cookie) => self.set(&cookie),
                Err(error) => {
                    tracing::debug!(%error, line, "ignoring unparseable Set-Cookie line");
                }
            }
        }
    }

    /// Cookies applicable to `path` as a JSON object for the wire, most
    /// specific path last so it wins on name collisions at the receiver.
    #[must_use]
    pub fn cookies_for(&self, path: &str) -> Map<String, Value> {
        let now = OffsetDateTime::now_utc();
        let entries = self.entries.lock();
        let mut matching: Vec<&StoredCookie> = entries
            .iter()
            .filter(|entry| !entry.is_expired(now) && path_matches(path, &entry.path))
            .collect();
        matching.sort_by_key(|entry| entry.path.len());
        let mut map = Map::new();
        for entry in matching {
            map.insert(entry.name.clone(), Value::String(entry.value.clone()));
        }
        map
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        self.entries
            .lock()
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Whether no live entries exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for CookieStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieStore")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

fn expiry_of(cookie: &Cookie<'_>, now: OffsetDateTime) -> Option<OffsetDateTime> {
    if let Some(max_age) = cookie.max_age() {
        return Some(if max_age <= CookieDuration::ZERO {
            now - CookieDuration::seconds(1)
        } else {
            now + max_age
        });
    }
    cookie.expires_datetime().map(Into::into)
}

/// RFC 6265 path matching: equal, or a prefix ending at a `/` boundary.
fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if cookie_path == "/" || request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}
