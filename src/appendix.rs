//! Appendix: append-only overflow region for multi-value keys.
//!
//! Keys with more than one value keep an appendix handle in their bucket
//! slot instead of an inline value. Once a handle is issued, the payload
//! bytes at its offset never move.
//!
//! Handle encodings:
//! - 64-bit mode: `(byte_offset << 32) | count`; payload is `count` raw
//!   little-endian u64 values, sorted ascending.
//! - 32-bit mode: the byte offset of a u32 count word followed by `count`
//!   u32 values, sorted ascending.

#[derive(Default)]
pub struct Appendix {
    data: Vec<u8>,
}

impl Appendix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a sorted u64 value list, returning the bucket-slot handle.
    pub fn add_u64_list(&mut self, values: &mut Vec<u64>) -> u64 {
        values.sort_unstable();
        let offset = self.data.len() as u64;
        for &value in values.iter() {
            self.data.extend_from_slice(&value.to_le_bytes());
        }
        (offset << 32) | values.len() as u64
    }

    /// Appends a sorted u32 value list, returning the bucket-slot handle.
    /// The count word lives at the returned offset, the values follow it.
    pub fn add_u32_list(&mut self, values: &mut Vec<u32>) -> u32 {
        values.sort_unstable();
        let offset = self.data.len() as u32;
        self.data
            .extend_from_slice(&(values.len() as u32).to_le_bytes());
        for &value in values.iter() {
            self.data.extend_from_slice(&value.to_le_bytes());
        }
        offset
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
