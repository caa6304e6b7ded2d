//! HTTP header list
//!
//! Headers keep insertion order, allow repeated names and look names up
//! case-insensitively. The same list type is used for HTTP/1.1 messages and
//! for decoded HTTP/2 header blocks (where names arrive lower-cased).

use super::{Error, Result, MAX_HEADERS};
use std::fmt;

/// Ordered, case-insensitive header list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header list
    pub fn new() -> Self {
        Headers { fields: Vec::new() }
    }

    /// Append a header, keeping any existing value with the same name
    ///
    /// Headers beyond [`MAX_HEADERS`] are dropped; parsers check
    /// [`Headers::is_full`] first and reject the message instead.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.is_full() {
            return;
        }
        self.fields.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.insert(name, value);
    }

    /// First value for a header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for a header, in order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Check whether a comma-separated header (such as `Connection` or
    /// `Upgrade`) lists `token`, across all of its values
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .iter()
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    /// Remove every value of a header, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.fields.len()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True once the list holds [`MAX_HEADERS`] entries
    pub fn is_full(&self) -> bool {
        self.fields.len() >= MAX_HEADERS
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Iterate over `(name, value)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parse an HTTP/1.1 field line (`Name: value`)
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::InvalidHeader(format!("No colon in header: {}", line)));
        };

        // RFC 9112 forbids whitespace between the field name and the colon
        if name.is_empty() || name.ends_with(|c: char| c.is_ascii_whitespace()) {
            return Err(Error::InvalidHeader(format!("Invalid header name: {:?}", name)));
        }
        if !name.bytes().all(is_token_byte) {
            return Err(Error::InvalidHeader(format!("Invalid header name: {:?}", name)));
        }

        Ok((name.to_string(), value.trim().to_string()))
    }
}

/// RFC 9110 `tchar`
pub(crate) fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}
