//! HPACK static and dynamic tables.
//!
//! Absolute indices are 1-based: 1..=61 address the static table and
//! 62.. address the dynamic table, newest entry first (RFC 7541 Section 2.3.3).

use std::collections::VecDeque;

use ahash::AHashSet;
use bytes::Bytes;

use super::HpackError;

/// Per-entry overhead added to name and value length (RFC 7541 Section 4.1).
pub const ENTRY_OVERHEAD: usize = 32;

/// A header field (name-value pair).
///
/// `sensitive` fields are never placed in a dynamic table and are encoded as
/// never-indexed literals, which intermediaries must preserve.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
    pub sensitive: bool,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    /// A field that must never be indexed.
    pub fn sensitive(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            sensitive: true,
            ..Self::new(name, value)
        }
    }

    /// Size of this field for table accounting.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }

    fn from_static(entry: &(&'static [u8], &'static [u8])) -> Self {
        Self::new(Bytes::from_static(entry.0), Bytes::from_static(entry.1))
    }
}

/// The HPACK static table (RFC 7541 Appendix A).
pub struct StaticTable;

static ENTRIES: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

impl StaticTable {
    /// Number of entries.
    pub const LEN: usize = 61;

    /// Entry at a 1-based index.
    pub fn get(index: usize) -> Option<(&'static [u8], &'static [u8])> {
        index
            .checked_sub(1)
            .and_then(|i| ENTRIES.get(i))
            .map(|&(n, v)| (n, v))
    }

    /// Index of an exact name and value match.
    pub fn find(name: &[u8], value: &[u8]) -> Option<usize> {
        ENTRIES
            .iter()
            .position(|&(n, v)| n == name && v == value)
            .map(|i| i + 1)
    }

    /// Index of the first entry with this name.
    pub fn find_name(name: &[u8]) -> Option<usize> {
        ENTRIES.iter().position(|&(n, _)| n == name).map(|i| i + 1)
    }
}

/// The HPACK dynamic table: a FIFO with the newest entry at the front.
#[derive(Debug)]
pub struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Entry by position, 0 being the most recently inserted.
    pub fn get(&self, index: usize) -> Option<&HeaderField> {
        self.entries.get(index)
    }

    /// Insert at the front, evicting from the back until the new entry fits.
    /// An entry larger than the table empties it and is not stored.
    pub fn insert(&mut self, field: HeaderField) {
        let entry_size = field.size();
        if entry_size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - entry_size);
        self.size += entry_size;
        self.entries.push_front(field);
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    fn evict_to(&mut self, target: usize) {
        while self.size > target {
            match self.entries.pop_back() {
                Some(evicted) => self.size -= evicted.size(),
                None => break,
            }
        }
    }

    pub fn find(&self, name: &[u8], value: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name == name && e.value == value)
    }

    pub fn find_name(&self, name: &[u8]) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

/// Combined static and dynamic addressing space for one direction of a
/// connection.
#[derive(Debug)]
pub struct HpackTable {
    dynamic: DynamicTable,
    never_indexed: AHashSet<(Bytes, Bytes)>,
}

impl HpackTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            dynamic: DynamicTable::new(max_size),
            never_indexed: AHashSet::new(),
        }
    }

    /// Absolute index of an exact name and value match, static table first.
    /// Never-indexed fields have no code.
    pub fn code_for(&self, field: &HeaderField) -> Option<usize> {
        if self.is_never_indexed(field) {
            return None;
        }
        StaticTable::find(&field.name, &field.value).or_else(|| {
            self.dynamic
                .find(&field.name, &field.value)
                .map(|i| StaticTable::LEN + 1 + i)
        })
    }

    /// Absolute index of any entry carrying this name.
    pub fn code_for_name(&self, name: &[u8]) -> Option<usize> {
        StaticTable::find_name(name).or_else(|| {
            self.dynamic
                .find_name(name)
                .map(|i| StaticTable::LEN + 1 + i)
        })
    }

    /// Field at an absolute index. Index 0 and indices past the end of the
    /// dynamic table are compression errors.
    pub fn get_value(&self, index: usize) -> Result<HeaderField, HpackError> {
        if index == 0 {
            return Err(HpackError::InvalidIndex(0));
        }
        if let Some(entry) = ENTRIES.get(index - 1) {
            return Ok(HeaderField::from_static(entry));
        }
        self.dynamic
            .get(index - StaticTable::LEN - 1)
            .cloned()
            .ok_or(HpackError::InvalidIndex(index))
    }

    /// Insert a field at dynamic index 0 (absolute index 62).
    pub fn index_field(&mut self, field: HeaderField) {
        if self.is_never_indexed(&field) {
            return;
        }
        self.dynamic.insert(field);
    }

    /// Mark a name and value so it is only ever emitted as a literal.
    ///
    /// Encoder side only. The decoder does not record never-indexed
    /// literals here: it flags them `sensitive` on the decoded field, and
    /// the set would otherwise grow with every distinct literal a peer
    /// sends.
    pub fn never_index(&mut self, field: &HeaderField) {
        self.never_indexed
            .insert((field.name.clone(), field.value.clone()));
    }

    pub fn is_never_indexed(&self, field: &HeaderField) -> bool {
        field.sensitive
            || (!self.never_indexed.is_empty()
                && self
                    .never_indexed
                    .contains(&(field.name.clone(), field.value.clone())))
    }

    pub fn dynamic_table_size_in_bytes(&self) -> usize {
        self.dynamic.size()
    }

    pub fn max_size(&self) -> usize {
        self.dynamic.max_size()
    }

    /// Change the dynamic table bound, evicting the oldest entries at once.
    pub fn change_max_size(&mut self, max_size: usize) {
        self.dynamic.set_max_size(max_size);
    }

    pub fn dynamic(&self) -> &DynamicTable {
        &self.dynamic
    }
}
