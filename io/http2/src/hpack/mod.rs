//! HPACK header compression (RFC 7541).
//!
//! HPACK is the header compression algorithm used by HTTP/2. It uses:
//! - A static table of 61 common header fields
//! - A dynamic table of recently used headers, one per direction
//! - Huffman coding for string literals
//! - Variable-length integer encoding

mod decode;
mod encode;
pub mod huffman;
mod table;

pub use decode::{HpackDecoder, HpackError};
pub use encode::HpackEncoder;
pub use huffman::HuffmanError;
pub use table::{DynamicTable, ENTRY_OVERHEAD, HeaderField, HpackTable, StaticTable};

/// Default dynamic table size (4096 bytes).
pub const DEFAULT_TABLE_SIZE: usize = 4096;
