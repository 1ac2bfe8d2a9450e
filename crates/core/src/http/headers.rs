//! A small case-insensitive header map with the Set-Cookie special case.

use serde_json::{Map, Value};

/// Ordered, case-insensitive header collection.
///
/// `set` replaces an existing header, except for `Set-Cookie`, which is
/// always accumulated: a reply legitimately carries several of those.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

const SET_COOKIE: &str = "set-cookie";

impl Headers {
    /// New, empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of `name`, case-insensitive.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entry(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Every value of `name`.
    #[must_use]
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entry(name).map_or(&[], Vec::as_slice)
    }

    /// Whether `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// Set `name` to `value`. Replaces existing values; `Set-Cookie`
    /// accumulates instead.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        if name.eq_ignore_ascii_case(SET_COOKIE) {
            return self.append(name, value);
        }
        match self.entry_mut(&name) {
            Some(values) => {
                values.clear();
                values.push(value);
            }
            None => self.entries.push((name, vec![value])),
        }
        self
    }

    /// Append `value` to `name` without replacing anything.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.entry_mut(&name) {
            Some(values) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }
        self
    }

    /// Remove `name` entirely.
    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.entries
            .retain(|(entry, _)| !entry.eq_ignore_ascii_case(name));
        self
    }

    /// All `Set-Cookie` lines.
    #[must_use]
    pub fn set_cookie_lines(&self) -> &[String] {
        self.get_all(SET_COOKIE)
    }

    /// Number of distinct header names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no headers are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, values)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Encode as a JSON object: single values as strings, multi values as
    /// arrays.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (name, values) in &self.entries {
            let value = if values.len() == 1 {
                Value::String(values[0].clone())
            } else {
                Value::Array(values.iter().cloned().map(Value::String).collect())
            };
            map.insert(name.clone(), value);
        }
        Value::Object(map)
    }

    /// Decode from the JSON object shape produced by
    /// [`to_value`](Self::to_value). Non-string items are ignored.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let mut headers = Self::new();
        let Some(map) = value.as_object() else {
            return headers;
        };
        for (name, value) in map {
            match value {
                Value::String(single) => {
                    headers.append(name.clone(), single.clone());
                }
                Value::Array(items) => {
                    for item in items {
                        if let Some(text) = item.as_str() {
                            headers.append(name.clone(), text.to_owned());
                        }
                    }
                }
                _ => {}
            }
        }
        headers
    }

    fn entry(&self, name: &str) -> Option<&Vec<String>> {
        self.entries
            .iter()
            .find(|(entry, _)| entry.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
        self.entries
            .iter_mut()
            .find(|(entry, _)| entry.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_is_case_insensitive_replace() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        headers.set("content-type", "application/json");
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn set_cookie_accumulates() {
        let mut headers = Headers::new();
        headers.set("Set-Cookie", "a=1");
        headers.set("Set-Cookie", "b=2");
        assert_eq!(headers.set_cookie_lines(), ["a=1", "b=2"]);
    }

    #[test]
    fn value_round_trip() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "application/json");
        headers.set("Set-Cookie", "a=1");
        headers.set("Set-Cookie", "b=2");
        let value = headers.to_value();
        assert_eq!(value["Content-Type"], json!("application/json"));
        assert_eq!(value["Set-Cookie"], json!(["a=1", "b=2"]));

        let back = Headers::from_value(&value);
        assert_eq!(back, headers);
    }
}
