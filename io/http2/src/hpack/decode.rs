//! HPACK header block decoding.

use bytes::Bytes;

use super::huffman::{self, HuffmanError};
use super::table::{HeaderField, HpackTable};
use crate::frame::ErrorCode;

/// HPACK decoding error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HpackError {
    #[error("incomplete HPACK data")]
    Incomplete,
    #[error("HPACK integer overflow")]
    IntegerOverflow,
    #[error("invalid table index: {0}")]
    InvalidIndex(usize),
    #[error("invalid huffman encoding: {0}")]
    InvalidHuffman(#[from] HuffmanError),
    #[error("table size update {size} exceeds limit {max}")]
    TableSizeExceeded { size: usize, max: usize },
    #[error("table size update after a header field")]
    LateTableSizeUpdate,
    #[error("header list size {size} exceeds limit {max}")]
    HeaderListTooLarge { size: usize, max: usize },
}

impl HpackError {
    /// Whether the decoding context is lost. Only an oversized header list
    /// leaves the dynamic table synchronised with the peer's encoder.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, HpackError::HeaderListTooLarge { .. })
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            HpackError::HeaderListTooLarge { .. } => ErrorCode::RefusedStream,
            _ => ErrorCode::CompressionError,
        }
    }
}

/// HPACK decoder holding the peer encoder's dynamic table.
#[derive(Debug)]
pub struct HpackDecoder {
    table: HpackTable,
    /// Largest table size we advertised; size updates above it are errors.
    max_table_size: usize,
    max_header_list_size: usize,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new(super::DEFAULT_TABLE_SIZE)
    }
}

impl HpackDecoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: HpackTable::new(max_table_size),
            max_table_size,
            max_header_list_size: usize::MAX,
        }
    }

    /// Apply an acknowledged `SETTINGS_HEADER_TABLE_SIZE`.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.max_table_size = size;
        if self.table.max_size() > size {
            self.table.change_max_size(size);
        }
    }

    pub fn set_max_header_list_size(&mut self, size: usize) {
        self.max_header_list_size = size;
    }

    pub fn table(&self) -> &HpackTable {
        &self.table
    }

    /// Decode a complete header block.
    ///
    /// The whole block is always processed so the dynamic table stays in
    /// step with the encoder; an oversized header list is reported after
    /// decoding finishes.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut headers = Vec::new();
        let mut list_size = 0usize;
        let mut pos = 0;

        while pos < data.len() {
            let first = data[pos];
            let rest = &data[pos..];

            let (field, consumed) = if first & 0x80 != 0 {
                // 1xxxxxxx indexed
                let (index, n) = decode_integer(rest, 7)?;
                (self.table.get_value(index)?, n)
            } else if first & 0x40 != 0 {
                // 01xxxxxx literal with incremental indexing
                let (field, n) = self.decode_literal(rest, 6, false)?;
                self.table.index_field(field.clone());
                (field, n)
            } else if first & 0x20 != 0 {
                // 001xxxxx dynamic table size update
                if !headers.is_empty() {
                    return Err(HpackError::LateTableSizeUpdate);
                }
                let (size, n) = decode_integer(rest, 5)?;
                if size > self.max_table_size {
                    return Err(HpackError::TableSizeExceeded {
                        size,
                        max: self.max_table_size,
                    });
                }
                self.table.change_max_size(size);
                pos += n;
                continue;
            } else {
                // 0000xxxx without indexing, 0001xxxx never indexed
                self.decode_literal(rest, 4, first & 0x10 != 0)?
            };

            pos += consumed;
            list_size = list_size.saturating_add(field.size());
            headers.push(field);
        }

        if list_size > self.max_header_list_size {
            return Err(HpackError::HeaderListTooLarge {
                size: list_size,
                max: self.max_header_list_size,
            });
        }
        Ok(headers)
    }

    fn decode_literal(
        &self,
        data: &[u8],
        prefix_bits: u8,
        sensitive: bool,
    ) -> Result<(HeaderField, usize), HpackError> {
        let (name_index, mut consumed) = decode_integer(data, prefix_bits)?;

        let name = if name_index > 0 {
            self.table.get_value(name_index)?.name
        } else {
            let (name, n) = decode_string(&data[consumed..])?;
            consumed += n;
            name
        };

        let (value, n) = decode_string(&data[consumed..])?;
        consumed += n;

        let mut field = HeaderField::new(name, value);
        field.sensitive = sensitive;
        if sensitive {
            tracing::trace!(name = ?field.name, "never-indexed field");
        }
        Ok((field, consumed))
    }
}

/// Decode a prefixed integer (RFC 7541 Section 5.1).
/// Returns the value and the number of bytes consumed.
pub(crate) fn decode_integer(data: &[u8], prefix_bits: u8) -> Result<(usize, usize), HpackError> {
    let Some(&first) = data.first() else {
        return Err(HpackError::Incomplete);
    };

    let max_prefix = (1usize << prefix_bits) - 1;
    let mut value = first as usize & max_prefix;
    if value < max_prefix {
        return Ok((value, 1));
    }

    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate().skip(1) {
        let add = ((byte & 0x7f) as usize)
            .checked_shl(shift)
            .filter(|v| v >> shift == (byte & 0x7f) as usize)
            .ok_or(HpackError::IntegerOverflow)?;
        value = value.checked_add(add).ok_or(HpackError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift > 28 {
            return Err(HpackError::IntegerOverflow);
        }
    }

    Err(HpackError::Incomplete)
}

/// Decode a string literal (RFC 7541 Section 5.2).
fn decode_string(data: &[u8]) -> Result<(Bytes, usize), HpackError> {
    let Some(&first) = data.first() else {
        return Err(HpackError::Incomplete);
    };

    let (length, consumed) = decode_integer(data, 7)?;
    let end = consumed
        .checked_add(length)
        .filter(|&end| end <= data.len())
        .ok_or(HpackError::Incomplete)?;

    let raw = &data[consumed..end];
    let value = if first & 0x80 != 0 {
        Bytes::from(huffman::decode(raw)?)
    } else {
        Bytes::copy_from_slice(raw)
    };

    Ok((value, end))
}
