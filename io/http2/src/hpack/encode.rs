//! HPACK header block encoding.

use super::huffman;
use super::table::{HeaderField, HpackTable};

/// HPACK encoder holding our side of the compression context.
#[derive(Debug)]
pub struct HpackEncoder {
    table: HpackTable,
    use_huffman: bool,
    /// Smallest and latest size set since the last block was encoded.
    pending_size_update: Option<(usize, usize)>,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new(super::DEFAULT_TABLE_SIZE)
    }
}

impl HpackEncoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: HpackTable::new(max_table_size),
            use_huffman: true,
            pending_size_update: None,
        }
    }

    pub fn set_huffman(&mut self, use_huffman: bool) {
        self.use_huffman = use_huffman;
    }

    /// Apply the peer's `SETTINGS_HEADER_TABLE_SIZE`. The change is
    /// signalled at the start of the next encoded block.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.table.change_max_size(size);
        self.pending_size_update = Some(match self.pending_size_update {
            Some((min, _)) => (min.min(size), size),
            None => (size, size),
        });
    }

    pub fn table(&self) -> &HpackTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut HpackTable {
        &mut self.table
    }

    /// Encode a header list as one header block.
    pub fn encode<'a, I>(&mut self, headers: I, buf: &mut Vec<u8>)
    where
        I: IntoIterator<Item = &'a HeaderField>,
    {
        if let Some((min, last)) = self.pending_size_update.take() {
            if min < last {
                encode_integer(min, 5, 0x20, buf);
            }
            encode_integer(last, 5, 0x20, buf);
        }

        for header in headers {
            self.encode_field(header, buf);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, buf: &mut Vec<u8>) {
        if self.table.is_never_indexed(field) {
            // 0001xxxx literal never indexed
            let name_index = self.table.code_for_name(&field.name).unwrap_or(0);
            self.encode_literal(name_index, 4, 0x10, field, buf);
            return;
        }

        if let Some(index) = self.table.code_for(field) {
            // 1xxxxxxx indexed
            encode_integer(index, 7, 0x80, buf);
            return;
        }

        // 01xxxxxx literal with incremental indexing
        let name_index = self.table.code_for_name(&field.name).unwrap_or(0);
        self.encode_literal(name_index, 6, 0x40, field, buf);
        self.table.index_field(field.clone());
    }

    fn encode_literal(
        &self,
        name_index: usize,
        prefix_bits: u8,
        prefix: u8,
        field: &HeaderField,
        buf: &mut Vec<u8>,
    ) {
        encode_integer(name_index, prefix_bits, prefix, buf);
        if name_index == 0 {
            self.encode_string(&field.name, buf);
        }
        self.encode_string(&field.value, buf);
    }

    /// Write a string literal, Huffman coded when that is strictly shorter.
    fn encode_string(&self, data: &[u8], buf: &mut Vec<u8>) {
        if self.use_huffman {
            let huffman_len = huffman::encoded_len(data);
            if huffman_len < data.len() {
                encode_integer(huffman_len, 7, 0x80, buf);
                huffman::encode(data, buf);
                return;
            }
        }
        encode_integer(data.len(), 7, 0x00, buf);
        buf.extend_from_slice(data);
    }
}

/// Encode an integer with an N-bit prefix (RFC 7541 Section 5.1).
pub(crate) fn encode_integer(mut value: usize, prefix_bits: u8, prefix: u8, buf: &mut Vec<u8>) {
    let max_prefix: usize = (1 << prefix_bits) - 1;

    if value < max_prefix {
        buf.push(prefix | value as u8);
        return;
    }

    buf.push(prefix | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        buf.push((value % 128) as u8 | 0x80);
        value /= 128;
    }
    buf.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpack::HpackDecoder;
    use crate::hpack::decode::decode_integer;

    fn encode(encoder: &mut HpackEncoder, fields: &[HeaderField]) -> Vec<u8> {
        let mut buf = Vec::new();
        encoder.encode(fields, &mut buf);
        buf
    }

    #[test]
    fn test_encode_integer_small() {
        let mut buf = Vec::new();
        encode_integer(10, 5, 0x00, &mut buf);
        assert_eq!(buf, vec![10]);
    }

    #[test]
    fn test_encode_integer_max_prefix() {
        let mut buf = Vec::new();
        encode_integer(31, 5, 0x00, &mut buf);
        assert_eq!(buf, vec![31, 0]);
    }

    #[test]
    fn test_encode_integer_large() {
        let mut buf = Vec::new();
        encode_integer(1337, 5, 0x00, &mut buf);
        assert_eq!(buf, vec![31, 154, 10]);
        assert_eq!(decode_integer(&buf, 5).unwrap(), (1337, 3));
    }

    #[test]
    fn test_status_200_is_single_byte() {
        let mut encoder = HpackEncoder::default();
        let buf = encode(&mut encoder, &[HeaderField::new(":status", "200")]);
        assert_eq!(buf, vec![0x88]);
    }

    #[test]
    fn test_rfc_c3_first_request() {
        let mut encoder = HpackEncoder::default();
        encoder.set_huffman(false);
        let buf = encode(
            &mut encoder,
            &[
                HeaderField::new(":method", "GET"),
                HeaderField::new(":scheme", "http"),
                HeaderField::new(":path", "/"),
                HeaderField::new(":authority", "www.example.com"),
            ],
        );
        let mut expected = vec![0x82, 0x86, 0x84, 0x41, 0x0f];
        expected.extend_from_slice(b"www.example.com");
        assert_eq!(buf, expected);
        assert_eq!(encoder.table().dynamic_table_size_in_bytes(), 57);
    }

    #[test]
    fn test_repeated_field_uses_dynamic_index() {
        let mut encoder = HpackEncoder::default();
        let fields = [HeaderField::new("x-request-id", "abc")];
        encode(&mut encoder, &fields);
        assert_eq!(encode(&mut encoder, &fields), vec![0x80 | 62]);
    }

    #[test]
    fn test_huffman_used_when_shorter() {
        let mut encoder = HpackEncoder::default();
        let buf = encode(&mut encoder, &[HeaderField::new(":authority", "www.example.com")]);
        // name index 1, huffman length 12
        assert_eq!(&buf[..2], &[0x41, 0x8c]);
        assert_eq!(buf.len(), 14);
    }

    #[test]
    fn test_sensitive_field_is_never_indexed() {
        let mut encoder = HpackEncoder::default();
        encoder.set_huffman(false);
        let secret = HeaderField::sensitive("authorization", "token");
        let first = encode(&mut encoder, &[secret.clone()]);
        // 0001 + 4-bit prefix holding 15, then 23 - 15 = 8
        assert_eq!(&first[..2], &[0x1f, 0x08]);
        assert!(encoder.table().dynamic().is_empty());
        assert_eq!(encode(&mut encoder, &[secret]), first);
    }

    #[test]
    fn test_never_index_marked_in_table() {
        let mut encoder = HpackEncoder::default();
        let field = HeaderField::new("x-token", "secret");
        encoder.table_mut().never_index(&field);
        let buf = encode(&mut encoder, &[field]);
        assert_eq!(buf[0], 0x10);
        assert!(encoder.table().dynamic().is_empty());
    }

    #[test]
    fn test_pending_size_update_emitted_once() {
        let mut encoder = HpackEncoder::default();
        encoder.set_max_table_size(0);
        encoder.set_max_table_size(256);
        let buf = encode(&mut encoder, &[HeaderField::new(":method", "GET")]);
        // 0 then 256 (31 + 225 → 0xe1 0x01)
        assert_eq!(buf, vec![0x20, 0x3f, 0xe1, 0x01, 0x82]);
        assert_eq!(encode(&mut encoder, &[HeaderField::new(":method", "GET")]), vec![0x82]);
    }

    #[test]
    fn test_roundtrip_through_decoder() {
        let mut encoder = HpackEncoder::default();
        let mut decoder = HpackDecoder::default();
        let blocks = [
            vec![
                HeaderField::new(":status", "200"),
                HeaderField::new("content-type", "text/html; charset=utf-8"),
                HeaderField::new("x-custom", "one"),
                HeaderField::sensitive("set-cookie", "id=42"),
            ],
            vec![
                HeaderField::new(":status", "404"),
                HeaderField::new("x-custom", "one"),
                HeaderField::new("x-custom", "two"),
            ],
        ];
        for block in &blocks {
            let buf = encode(&mut encoder, block);
            assert_eq!(&decoder.decode(&buf).unwrap(), block);
        }
        assert_eq!(
            encoder.table().dynamic_table_size_in_bytes(),
            decoder.table().dynamic_table_size_in_bytes()
        );
    }

    #[test]
    fn test_roundtrip_with_small_table() {
        let mut encoder = HpackEncoder::new(64);
        let mut decoder = HpackDecoder::new(64);
        for i in 0..20 {
            let block = vec![
                HeaderField::new(format!("x-{}", i % 3), format!("{i}")),
                HeaderField::new("accept", "*/*"),
            ];
            let buf = encode(&mut encoder, &block);
            assert_eq!(decoder.decode(&buf).unwrap(), block);
            assert!(decoder.table().dynamic_table_size_in_bytes() <= 64);
        }
    }
}
