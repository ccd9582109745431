//! Append-only section buffers.
//!
//! [`TextBuffer`] receives machine code during generation and is then handed
//! by value to the relocation resolver, which is the only code allowed to
//! rewrite bytes in place. [`RodataBuffer`] collects constants and hands out
//! [`DataId`]s that relocations refer to until the section gets an address.

use hashbrown::HashMap;

/// Machine code for the whole program.
#[derive(Debug, Clone, Default)]
pub struct TextBuffer {
    bytes: Vec<u8>,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current end of the buffer, the offset the next byte lands at.
    pub fn offset(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Pad with `fill` until the offset is a multiple of `align`.
    pub fn align(&mut self, align: usize, fill: u8) {
        while self.bytes.len() % align != 0 {
            self.bytes.push(fill);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable view for the patching phase.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Handle to one item in the rodata section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataId(pub u32);

/// Constant data: string bytes, non-integral literals, collection literals.
#[derive(Debug, Clone, Default)]
pub struct RodataBuffer {
    bytes: Vec<u8>,
    items: Vec<u32>,
    f64_cache: HashMap<u64, DataId>,
    bytes_cache: HashMap<Vec<u8>, DataId>,
}

impl RodataBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` at `align` and return its handle.
    pub fn add_bytes(&mut self, data: &[u8], align: usize) -> DataId {
        if let Some(&id) = self.bytes_cache.get(data) {
            if self.items[id.0 as usize] as usize % align == 0 {
                return id;
            }
        }
        while self.bytes.len() % align != 0 {
            self.bytes.push(0);
        }
        let id = DataId(self.items.len() as u32);
        self.items.push(self.bytes.len() as u32);
        self.bytes.extend_from_slice(data);
        self.bytes_cache.insert(data.to_vec(), id);
        id
    }

    /// A NUL-terminated copy of `s`.
    pub fn add_cstring(&mut self, s: &str) -> DataId {
        let mut data = Vec::with_capacity(s.len() + 1);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
        self.add_bytes(&data, 1)
    }

    pub fn add_f64(&mut self, value: f64) -> DataId {
        let bits = value.to_bits();
        if let Some(&id) = self.f64_cache.get(&bits) {
            return id;
        }
        let id = self.add_bytes(&bits.to_le_bytes(), 8);
        self.f64_cache.insert(bits, id);
        id
    }

    /// A sequence of doubles, 8-byte aligned.
    pub fn add_f64_slice(&mut self, values: &[f64]) -> DataId {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        self.add_bytes(&data, 8)
    }

    pub fn offset_of(&self, id: DataId) -> Option<u32> {
        self.items.get(id.0 as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_alignment() {
        let mut text = TextBuffer::new();
        text.append(&[0xc3]);
        text.align(16, 0xcc);
        assert_eq!(text.offset(), 16);
        assert_eq!(text.as_slice()[15], 0xcc);
    }

    #[test]
    fn test_rodata_dedup_and_alignment() {
        let mut ro = RodataBuffer::new();
        let s = ro.add_cstring("hi");
        let a = ro.add_f64(1.5);
        let b = ro.add_f64(1.5);
        assert_eq!(a, b);
        assert_eq!(ro.offset_of(s), Some(0));
        assert_eq!(ro.offset_of(a), Some(8));
        assert_eq!(&ro.as_slice()[8..16], &1.5f64.to_le_bytes());
        assert_eq!(ro.add_cstring("hi"), s);
        assert_eq!(ro.offset_of(DataId(99)), None);
    }
}
