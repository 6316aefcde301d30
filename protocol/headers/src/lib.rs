//! HTTP header lines and header blocks.
//!
//! A [`HeaderBlock`] is the ordered set of name/value pairs carried by one
//! message (or one set of trailers). It is the unit exchanged between the
//! HTTP/1.1 parser and the HTTP/2 stream layer.
//!
//! - Names keep the case they arrived with but are matched case-insensitively.
//! - Insertion order is preserved and duplicate names are allowed.
//! - Scalar lookups ([`HeaderBlock::get`]) return the first match, list
//!   lookups ([`HeaderBlock::get_all`]) return every match.
//!
//! # Example
//!
//! ```
//! use protocol_headers::HeaderBlock;
//!
//! let mut headers = HeaderBlock::new();
//! headers.insert("Accept", "text/html, application/json").unwrap();
//! headers.insert("x-trace", "a").unwrap();
//! headers.insert("X-Trace", "b").unwrap();
//!
//! assert_eq!(headers.get_str("accept"), Some("text/html, application/json"));
//! assert!(headers.contains_value("accept", "application/json"));
//! assert_eq!(headers.get_all("x-trace").count(), 2);
//! ```

use bytes::Bytes;
use std::fmt;

/// Header names whose values are replaced by `(hidden)` when a block is
/// formatted for logs.
const SENSITIVE: &[&str] = &["authorization", "cookie", "set-cookie"];

/// Errors raised when constructing a header line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// The name is empty or contains a byte outside the token grammar.
    #[error("invalid header name {0:?}")]
    InvalidName(String),
    /// The value contains a control character other than horizontal tab.
    #[error("invalid value for header {0}")]
    InvalidValue(String),
}

/// Returns true if `b` is a `tchar` as defined by RFC 7230 section 3.2.6.
#[inline]
pub fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
    ) || b.is_ascii_alphanumeric()
}

/// Returns true if `bytes` is a non-empty token.
pub fn is_token(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().all(|&b| is_tchar(b))
}

/// Returns true if `bytes` is a legal field value.
///
/// Visible ASCII, space, horizontal tab and obs-text (0x80-0xff) are allowed.
pub fn is_valid_value(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .all(|&b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}

fn is_valid_name(bytes: &[u8]) -> bool {
    match bytes.split_first() {
        Some((b':', rest)) => is_token(rest),
        _ => is_token(bytes),
    }
}

/// A single header name/value pair.
///
/// The name is a token (optionally prefixed with `:` for HTTP/2
/// pseudo-headers) and the value contains no control characters except
/// horizontal tab. Lines are immutable once built.
#[derive(Clone)]
pub struct HeaderLine {
    name: Bytes,
    value: Bytes,
}

impl HeaderLine {
    /// Create a header line, copying the name and value.
    pub fn new(name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<Self, HeaderError> {
        Self::from_bytes(
            Bytes::copy_from_slice(name.as_ref()),
            Bytes::copy_from_slice(value.as_ref()),
        )
    }

    /// Create a header line from owned buffers without copying.
    pub fn from_bytes(name: Bytes, value: Bytes) -> Result<Self, HeaderError> {
        if !is_valid_name(&name) {
            return Err(HeaderError::InvalidName(
                String::from_utf8_lossy(&name).into_owned(),
            ));
        }
        if !is_valid_value(&value) {
            return Err(HeaderError::InvalidValue(
                String::from_utf8_lossy(&name).into_owned(),
            ));
        }
        Ok(Self { name, value })
    }

    /// The header name as it was received.
    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// The header name as a string slice.
    ///
    /// Names are validated tokens, so this only yields an empty string if
    /// that invariant is broken.
    pub fn name_str(&self) -> &str {
        std::str::from_utf8(&self.name).unwrap_or_default()
    }

    #[inline]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// The value as UTF-8, if it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Cheap clone of the underlying name buffer.
    pub fn name_bytes(&self) -> Bytes {
        self.name.clone()
    }

    /// Cheap clone of the underlying value buffer.
    pub fn value_bytes(&self) -> Bytes {
        self.value.clone()
    }

    /// Returns true for HTTP/2 pseudo-headers such as `:method`.
    #[inline]
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }

    /// Case-insensitive name comparison.
    #[inline]
    pub fn name_eq(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }

    /// Credentials and cookies: redacted in logs, never indexed by HPACK.
    pub fn is_sensitive(&self) -> bool {
        SENSITIVE.iter().any(|s| self.name_eq(s))
    }
}

impl PartialEq for HeaderLine {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self.value == other.value
    }
}

impl Eq for HeaderLine {}

impl fmt::Debug for HeaderLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for HeaderLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sensitive() {
            write!(f, "{}: (hidden)", self.name_str())
        } else {
            write!(
                f,
                "{}: {}",
                self.name_str(),
                String::from_utf8_lossy(&self.value)
            )
        }
    }
}

/// An ordered collection of header lines.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    lines: Vec<HeaderLine>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Vec::with_capacity(capacity),
        }
    }

    /// Append a line, keeping any existing lines with the same name.
    pub fn add(&mut self, line: HeaderLine) {
        self.lines.push(line);
    }

    /// Validate and append a name/value pair.
    pub fn insert(
        &mut self,
        name: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<(), HeaderError> {
        self.lines.push(HeaderLine::new(name, value)?);
        Ok(())
    }

    /// Replace every line named `name` with a single new line.
    ///
    /// The new line takes the position of the first removed line, or is
    /// appended if there was none.
    pub fn set(&mut self, name: &str, value: impl AsRef<[u8]>) -> Result<(), HeaderError> {
        let line = HeaderLine::new(name, value)?;
        match self.lines.iter().position(|l| l.name_eq(name)) {
            Some(first) => {
                self.lines[first] = line;
                let mut index = 0;
                self.lines.retain(|l| {
                    let keep = index <= first || !l.name_eq(name);
                    index += 1;
                    keep
                });
            }
            None => self.lines.push(line),
        }
        Ok(())
    }

    /// Remove every line named `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.lines.len();
        self.lines.retain(|l| !l.name_eq(name));
        before - self.lines.len()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.lines
            .iter()
            .find(|l| l.name_eq(name))
            .map(|l| l.value())
    }

    /// First value for `name` as UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|l| l.name_eq(name))
            .and_then(|l| l.value_str())
    }

    /// Every value for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.lines
            .iter()
            .filter(move |l| l.name_eq(name))
            .map(|l| l.value())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lines.iter().any(|l| l.name_eq(name))
    }

    /// Returns true if any comma-separated member of any `name` line equals
    /// `value`, ignoring case and surrounding whitespace.
    pub fn contains_value(&self, name: &str, value: &str) -> bool {
        self.get_all(name).any(|v| {
            v.split(|&b| b == b',')
                .any(|member| member.trim_ascii().eq_ignore_ascii_case(value.as_bytes()))
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HeaderLine> {
        self.lines.iter()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

impl fmt::Debug for HeaderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.lines.iter()).finish()
    }
}

impl fmt::Display for HeaderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", line)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<HeaderLine> for HeaderBlock {
    fn from_iter<I: IntoIterator<Item = HeaderLine>>(iter: I) -> Self {
        Self {
            lines: iter.into_iter().collect(),
        }
    }
}

impl Extend<HeaderLine> for HeaderBlock {
    fn extend<I: IntoIterator<Item = HeaderLine>>(&mut self, iter: I) {
        self.lines.extend(iter);
    }
}

impl<'a> IntoIterator for &'a HeaderBlock {
    type Item = &'a HeaderLine;
    type IntoIter = std::slice::Iter<'a, HeaderLine>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.iter()
    }
}

impl IntoIterator for HeaderBlock {
    type Item = HeaderLine;
    type IntoIter = std::vec::IntoIter<HeaderLine>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.into_iter()
    }
}
