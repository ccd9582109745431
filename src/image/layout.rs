//! Build phases and file placement shared by the image writers.

use hashbrown::HashMap;

use crate::arch::encoder_for;
use crate::codegen::CodeUnit;
use crate::core::{CompilationSession, CompileError, CompileResult};
use crate::reloc::{AddressMap, RelocationResolver};

/// The phases of one image build, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildPhase {
    /// Count headers, tables and imports.
    Sizing,
    /// Assign file offsets and addresses; header sizes are fixed here.
    PreliminaryLayout,
    /// Patch relocation sites against the final addresses.
    RelocationPatch,
    /// Emit headers and sections in file order.
    FinalWrite,
}

impl BuildPhase {
    fn successor(phase: Option<BuildPhase>) -> Option<BuildPhase> {
        match phase {
            None => Some(BuildPhase::Sizing),
            Some(BuildPhase::Sizing) => Some(BuildPhase::PreliminaryLayout),
            Some(BuildPhase::PreliminaryLayout) => Some(BuildPhase::RelocationPatch),
            Some(BuildPhase::RelocationPatch) => Some(BuildPhase::FinalWrite),
            Some(BuildPhase::FinalWrite) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PhaseTracker {
    current: Option<BuildPhase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<BuildPhase> {
        self.current
    }

    pub fn enter(&mut self, next: BuildPhase) -> CompileResult<()> {
        if BuildPhase::successor(self.current) != Some(next) {
            return Err(CompileError::internal(format!(
                "image build entered {next:?} after {:?}",
                self.current
            )));
        }
        log::trace!("image phase {next:?}");
        self.current = Some(next);
        Ok(())
    }
}

pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Where one piece of the image lives in the file and in memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placement {
    pub offset: u64,
    pub addr: u64,
    pub size: u64,
}

impl Placement {
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }

    pub fn end_addr(&self) -> u64 {
        self.addr + self.size
    }
}

/// Hands out file offsets in order; addresses follow at a fixed distance.
#[derive(Debug, Clone)]
pub struct Cursor {
    base_addr: u64,
    offset: u64,
}

impl Cursor {
    /// `base_addr` is the address of file offset 0.
    pub fn new(base_addr: u64) -> Self {
        Self { base_addr, offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn addr(&self) -> u64 {
        self.base_addr + self.offset
    }

    pub fn align(&mut self, align: u64) {
        self.offset = align_up(self.offset, align);
    }

    pub fn place(&mut self, size: u64, align: u64) -> Placement {
        self.align(align);
        let placement = Placement {
            offset: self.offset,
            addr: self.addr(),
            size,
        };
        self.offset += size;
        placement
    }
}

/// NUL-terminated names with deduplicated offsets.
#[derive(Debug, Clone)]
pub struct StringTable {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringTable {
    /// Start the table with `prefix`, which no name offset points into.
    pub fn new(prefix: &[u8]) -> Self {
        Self {
            bytes: prefix.to_vec(),
            offsets: HashMap::new(),
        }
    }

    pub fn add(&mut self, name: &str) -> u32 {
        if let Some(&offset) = self.offsets.get(name) {
            return offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name.to_string(), offset);
        offset
    }

    pub fn offset(&self, name: &str) -> Option<u32> {
        self.offsets.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// The output file, filled piece by piece at planned offsets.
#[derive(Debug, Default)]
pub struct FileImage {
    bytes: Vec<u8>,
}

impl FileImage {
    pub fn with_size(size: u64) -> Self {
        Self {
            bytes: vec![0; size as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Copy `data` to `placement`, which must hold exactly that many bytes.
    pub fn write(&mut self, what: &str, placement: Placement, data: &[u8]) -> CompileResult<()> {
        if data.len() as u64 != placement.size {
            return Err(CompileError::internal(format!(
                "{what}: planned {} bytes, produced {}",
                placement.size,
                data.len()
            )));
        }
        let start = placement.offset as usize;
        let target = self
            .bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| CompileError::internal(format!("{what} extends past the end of the image")))?;
        target.copy_from_slice(data);
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// One executable format, driven through the build phases by [`build_image`].
pub trait ImageWriter {
    fn name(&self) -> &'static str;

    fn size(&mut self, unit: &CodeUnit) -> CompileResult<()>;

    /// Fix every offset and address; relocations resolve against the result.
    fn layout(&mut self, unit: &CodeUnit) -> CompileResult<AddressMap>;

    /// Bytes of headers (and program headers or load commands) the layout reserved.
    fn planned_header_size(&self) -> u64;

    /// Emit the image; returns it with the header bytes actually written.
    fn write(&mut self, unit: &CodeUnit) -> CompileResult<(Vec<u8>, u64)>;
}

pub fn build_image(
    session: &CompilationSession<'_>,
    mut unit: CodeUnit,
    writer: &mut dyn ImageWriter,
) -> CompileResult<Vec<u8>> {
    let mut phases = PhaseTracker::new();

    phases.enter(BuildPhase::Sizing)?;
    writer.size(&unit)?;

    phases.enter(BuildPhase::PreliminaryLayout)?;
    let map = writer.layout(&unit)?;
    let planned = writer.planned_header_size();
    log::debug!(
        "{} layout: text at {:#x}, rodata at {:#x}, {} stub(s), {planned} header bytes",
        writer.name(),
        map.text,
        map.rodata,
        map.stubs.len()
    );

    phases.enter(BuildPhase::RelocationPatch)?;
    let encoder = encoder_for(unit.target);
    let resolver = RelocationResolver::new(encoder.as_ref(), &map);
    resolver.resolve(session, &mut unit)?;
    resolver.verify(&unit)?;

    phases.enter(BuildPhase::FinalWrite)?;
    let (image, written) = writer.write(&unit)?;
    if written != planned {
        return Err(CompileError::internal(format!(
            "{} headers: planned {planned} bytes, wrote {written}",
            writer.name()
        )));
    }
    log::debug!("{} image: {} bytes", writer.name(), image.len());
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_run_in_order() {
        let mut phases = PhaseTracker::new();
        assert!(phases.enter(BuildPhase::PreliminaryLayout).is_err());
        phases.enter(BuildPhase::Sizing).unwrap();
        phases.enter(BuildPhase::PreliminaryLayout).unwrap();
        assert!(phases.enter(BuildPhase::FinalWrite).is_err());
        phases.enter(BuildPhase::RelocationPatch).unwrap();
        phases.enter(BuildPhase::FinalWrite).unwrap();
        assert!(phases.enter(BuildPhase::Sizing).is_err());
        assert_eq!(phases.current(), Some(BuildPhase::FinalWrite));
    }

    #[test]
    fn test_cursor_keeps_addresses_congruent() {
        let mut cursor = Cursor::new(0x40_0000);
        let header = cursor.place(120, 8);
        assert_eq!(header, Placement { offset: 0, addr: 0x40_0000, size: 120 });
        cursor.align(0x1000);
        let text = cursor.place(0x10, 16);
        assert_eq!(text.offset, 0x1000);
        assert_eq!(text.addr, 0x40_1000);
        assert_eq!(text.end_addr(), 0x40_1010);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
    }

    #[test]
    fn test_string_table_dedups() {
        let mut table = StringTable::new(&[0]);
        let a = table.add("printf");
        let b = table.add("libc.so.6");
        assert_eq!(a, 1);
        assert_eq!(table.add("printf"), a);
        assert_eq!(table.offset("libc.so.6"), Some(b));
        assert_eq!(table.as_bytes(), b"\0printf\0libc.so.6\0");
    }

    #[test]
    fn test_file_image_rejects_size_mismatch() {
        let mut image = FileImage::with_size(16);
        let placement = Placement { offset: 8, addr: 0, size: 4 };
        assert!(image.write("piece", placement, &[1, 2, 3]).is_err());
        image.write("piece", placement, &[1, 2, 3, 4]).unwrap();
        let past = Placement { offset: 14, addr: 0, size: 4 };
        assert!(image.write("tail", past, &[0; 4]).is_err());
        assert_eq!(&image.into_bytes()[8..12], &[1, 2, 3, 4]);
    }
}
