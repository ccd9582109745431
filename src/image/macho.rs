// This module writes Mach-O 64 executables for macOS. The layout follows what dyld expects
// of a modern position-independent executable: __PAGEZERO reserves the low 4 GiB, __TEXT
// starts at file offset 0 and holds the header, load commands, __text, __stubs and the
// read-only data in __const, __DATA_CONST holds the __got with one pointer per import, and
// __LINKEDIT carries the chained fixups, the symbol table, the indirect symbol table and
// the string table. Imports are bound through LC_DYLD_CHAINED_FIXUPS: each GOT slot is a
// DYLD_CHAINED_PTR_64 bind entry naming its import ordinal, and slots in the same page
// are chained together. LC_MAIN points the loader at `main`. No code signature is
// produced; arm64 binaries must be signed (ad hoc is enough) before the kernel runs them.

//! Mach-O 64 executable writer.

use object::endian::{BigEndian, LittleEndian, U32, U64};
use object::macho;
use object::pod::bytes_of;

use super::layout::{align_up, Cursor, FileImage, ImageWriter, Placement, StringTable};
use crate::arch::{encoder_for, Encoder};
use crate::codegen::CodeUnit;
use crate::core::{Arch, CompileError, CompileOptions, CompileResult, ImageFormat, Target};
use crate::reloc::AddressMap;

/// Address of the Mach-O header; everything below is __PAGEZERO.
pub const TEXT_BASE: u64 = 0x1_0000_0000;

pub const DYLD_PATH: &str = "/usr/lib/dyld";
pub const LIBSYSTEM: &str = "/usr/lib/libSystem.B.dylib";

const HEADER_SIZE: u64 = 32;
const SEGMENT_SIZE: u64 = 72;
const SECTION_SIZE: u64 = 80;
const NLIST_SIZE: u64 = 16;

pub const DYLD_CHAINED_PTR_64: u16 = 2;
pub const DYLD_CHAINED_IMPORT: u32 = 1;
const DYLD_CHAINED_PTR_START_NONE: u16 = 0xFFFF;
const SG_READ_ONLY: u32 = 0x10;
/// 11.0.0 in `xxxx.yy.zz` nibble form.
const MACOS_11: u32 = 0x000B_0000;

const LE: LittleEndian = LittleEndian;

fn u32(value: u32) -> U32<LittleEndian> {
    U32::new(LE, value)
}

fn u64(value: u64) -> U64<LittleEndian> {
    U64::new(LE, value)
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

/// Size of a command carrying a path at `fixed` bytes, padded to 8.
fn path_command_size(fixed: u64, path: &str) -> u64 {
    align_up(fixed + path.len() as u64 + 1, 8)
}

fn cpu(arch: Arch) -> CompileResult<(u32, u32)> {
    match arch {
        Arch::X86_64 => Ok((macho::CPU_TYPE_X86_64, macho::CPU_SUBTYPE_X86_64_ALL)),
        Arch::Arm64 => Ok((macho::CPU_TYPE_ARM64, macho::CPU_SUBTYPE_ARM64_ALL)),
        Arch::Riscv64 => Err(CompileError::unsupported("Mach-O images for RISC-V", arch.name())),
    }
}

/// One chained-fixup bind pointer.
pub fn chained_bind(ordinal: u32, next: u64) -> u64 {
    (1 << 63) | ((next & 0xFFF) << 51) | u64::from(ordinal & 0xFF_FFFF)
}

#[derive(Debug, Default)]
struct MachLayout {
    header: Placement,
    text: Placement,
    stubs: Placement,
    rodata: Placement,
    text_segment: Placement,
    data_segment: Placement,
    got: Placement,
    linkedit: Placement,
    fixups: Placement,
    symtab: Placement,
    indirect: Placement,
    strtab: Placement,
    file_size: u64,
}

pub struct MachOWriter {
    target: Target,
    encoder: Box<dyn Encoder>,
    emit_symbols: bool,
    imports: Vec<String>,
    /// Library path and the 1-based ordinal of every import.
    libraries: Vec<String>,
    ordinals: Vec<u32>,
    locals: Vec<(String, u64)>,
    strtab: StringTable,
    has_rodata: bool,
    ncmds: u32,
    sizeofcmds: u64,
    fixups: Vec<u8>,
    layout: MachLayout,
}

impl MachOWriter {
    pub fn new(target: Target, options: &CompileOptions) -> CompileResult<Self> {
        if target.format != ImageFormat::MachO {
            return Err(CompileError::internal(format!("Mach-O writer used for {target}")));
        }
        cpu(target.arch)?;
        Ok(Self {
            target,
            encoder: encoder_for(target),
            emit_symbols: options.emit_symbols,
            imports: Vec::new(),
            libraries: Vec::new(),
            ordinals: Vec::new(),
            locals: Vec::new(),
            strtab: StringTable::new(&[b' ', 0]),
            has_rodata: false,
            ncmds: 0,
            sizeofcmds: 0,
            fixups: Vec::new(),
            layout: MachLayout::default(),
        })
    }

    fn has_imports(&self) -> bool {
        !self.imports.is_empty()
    }

    fn symbol_name(import: &str) -> String {
        format!("_{import}")
    }

    fn symbol_count(&self) -> usize {
        self.locals.len() + self.imports.len()
    }

    fn text_sections(&self) -> u64 {
        1 + u64::from(self.has_imports()) + u64::from(self.has_rodata)
    }

    fn stub_address(&self, index: usize) -> u64 {
        self.layout.stubs.addr + (index * self.encoder.macho_stub_size()) as u64
    }

    fn got_slot(&self, index: usize) -> u64 {
        self.layout.got.addr + 8 * index as u64
    }

    /// Segments in load-command order.
    fn segment_count(&self) -> u32 {
        3 + u32::from(self.has_imports())
    }

    /// The LC_DYLD_CHAINED_FIXUPS payload; the GOT must already be placed.
    fn chained_fixups(&self) -> Vec<u8> {
        let page = ImageFormat::MachO.page_size();
        let segments = self.segment_count();
        let starts_offset = 32u32;
        let seg_info_size = 4 + 4 * segments;
        let starts_in_segment = align_up(u64::from(seg_info_size), 8) as u32;
        let got = self.layout.got;
        let pages = align_up(got.size.max(1), page) / page;
        let segment_struct = 22 + 2 * pages as u32;
        let imports_offset = align_up(u64::from(starts_offset + starts_in_segment + segment_struct), 4) as u32;
        let symbols_offset = imports_offset + 4 * self.imports.len() as u32;

        let mut symbols = Vec::new();
        let mut imports = Vec::new();
        for (index, name) in self.imports.iter().enumerate() {
            let name_offset = symbols.len() as u32;
            symbols.extend_from_slice(Self::symbol_name(name).as_bytes());
            symbols.push(0);
            imports.push((self.ordinals[index] & 0xFF) | (name_offset << 9));
        }

        let mut blob = Vec::new();
        for word in [
            0,
            starts_offset,
            imports_offset,
            symbols_offset,
            self.imports.len() as u32,
            DYLD_CHAINED_IMPORT,
            0,
        ] {
            blob.extend_from_slice(&word.to_le_bytes());
        }
        blob.resize(starts_offset as usize, 0);

        // starts_in_image: only __DATA_CONST (index 2) has fixups.
        blob.extend_from_slice(&segments.to_le_bytes());
        for segment in 0..segments {
            let offset = if segment == 2 { starts_in_segment } else { 0 };
            blob.extend_from_slice(&offset.to_le_bytes());
        }
        blob.resize((starts_offset + starts_in_segment) as usize, 0);

        blob.extend_from_slice(&segment_struct.to_le_bytes());
        blob.extend_from_slice(&(page as u16).to_le_bytes());
        blob.extend_from_slice(&DYLD_CHAINED_PTR_64.to_le_bytes());
        blob.extend_from_slice(&(self.layout.data_segment.addr - TEXT_BASE).to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.extend_from_slice(&(pages as u16).to_le_bytes());
        for index in 0..pages {
            let first = (0..self.imports.len())
                .map(|slot| got.offset - self.layout.data_segment.offset + 8 * slot as u64)
                .find(|offset| offset / page == index)
                .map_or(DYLD_CHAINED_PTR_START_NONE, |offset| (offset % page) as u16);
            blob.extend_from_slice(&first.to_le_bytes());
        }
        blob.resize(imports_offset as usize, 0);
        for import in imports {
            blob.extend_from_slice(&import.to_le_bytes());
        }
        blob.extend_from_slice(&symbols);
        blob.resize(align_up(blob.len() as u64, 8) as usize, 0);
        blob
    }

    fn got(&self) -> Vec<u8> {
        let page = ImageFormat::MachO.page_size();
        let count = self.imports.len();
        let mut bytes = Vec::with_capacity(8 * count);
        for index in 0..count {
            let here = self.got_slot(index) / page;
            let next = if index + 1 < count && self.got_slot(index + 1) / page == here {
                2
            } else {
                0
            };
            let ordinal = index as u32;
            bytes.extend_from_slice(&chained_bind(ordinal, next).to_le_bytes());
        }
        bytes
    }

    fn stubs(&self) -> CompileResult<Vec<u8>> {
        let mut code = Vec::new();
        for index in 0..self.imports.len() {
            code.extend_from_slice(&self.encoder.macho_stub(self.stub_address(index), self.got_slot(index))?);
        }
        Ok(code)
    }

    fn symbol_table(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut push = |strx: u32, n_type: u8, n_sect: u8, n_desc: u16, value: u64| {
            bytes.extend_from_slice(&strx.to_le_bytes());
            bytes.push(n_type);
            bytes.push(n_sect);
            bytes.extend_from_slice(&n_desc.to_le_bytes());
            bytes.extend_from_slice(&value.to_le_bytes());
        };
        for (name, addr) in &self.locals {
            push(self.strtab.offset(name).unwrap_or(0), macho::N_SECT, 1, 0, *addr);
        }
        for (index, name) in self.imports.iter().enumerate() {
            let strx = self.strtab.offset(&Self::symbol_name(name)).unwrap_or(0);
            let desc = (self.ordinals[index] as u16) << 8;
            push(strx, macho::N_UNDF | macho::N_EXT, 0, desc, 0);
        }
        bytes
    }

    /// `__stubs` entries then `__got` entries, both naming the undefined symbols.
    fn indirect_symbols(&self) -> Vec<u8> {
        let first = self.locals.len() as u32;
        let count = self.imports.len() as u32;
        (0..2)
            .flat_map(|_| (first..first + count).flat_map(|i| i.to_le_bytes()))
            .collect()
    }

    fn section(
        &self,
        sectname: &str,
        segname: &str,
        placement: Placement,
        align_log2: u32,
        flags: u32,
        reserved: (u32, u32),
    ) -> macho::Section64<LittleEndian> {
        macho::Section64 {
            sectname: name16(sectname),
            segname: name16(segname),
            addr: u64(placement.addr),
            size: u64(placement.size),
            offset: u32(placement.offset as u32),
            align: u32(align_log2),
            reloff: u32(0),
            nreloc: u32(0),
            flags: u32(flags),
            reserved1: u32(reserved.0),
            reserved2: u32(reserved.1),
            reserved3: u32(0),
        }
    }

    fn segment(
        name: &str,
        placement: Placement,
        vmsize: u64,
        prot: u32,
        nsects: u32,
        flags: u32,
    ) -> macho::SegmentCommand64<LittleEndian> {
        macho::SegmentCommand64 {
            cmd: u32(macho::LC_SEGMENT_64),
            cmdsize: u32((SEGMENT_SIZE + SECTION_SIZE * u64::from(nsects)) as u32),
            segname: name16(name),
            vmaddr: u64(placement.addr),
            vmsize: u64(vmsize),
            fileoff: u64(placement.offset),
            filesize: u64(placement.size),
            maxprot: u32(prot),
            initprot: u32(prot),
            nsects: u32(nsects),
            flags: u32(flags),
        }
    }

    fn load_commands(&self, unit: &CodeUnit) -> CompileResult<(u32, Vec<u8>)> {
        let l = &self.layout;
        let page = ImageFormat::MachO.page_size();
        let code_flags =
            macho::S_REGULAR | macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS;
        let mut cmds = Vec::new();
        let mut count = 0u32;
        let mut add = |bytes: &[u8], count: &mut u32| {
            cmds.extend_from_slice(bytes);
            *count += 1;
        };

        let zero = Placement { offset: 0, addr: 0, size: 0 };
        add(bytes_of(&Self::segment("__PAGEZERO", zero, TEXT_BASE, 0, 0, 0)), &mut count);

        let rx = macho::VM_PROT_READ | macho::VM_PROT_EXECUTE;
        let nsects = self.text_sections() as u32;
        let mut text = bytes_of(&Self::segment("__TEXT", l.text_segment, l.text_segment.size, rx, nsects, 0)).to_vec();
        text.extend_from_slice(bytes_of(&self.section("__text", "__TEXT", l.text, 4, code_flags, (0, 0))));
        if self.has_imports() {
            let align = if self.target.arch == Arch::X86_64 { 1 } else { 2 };
            let stub_size = self.encoder.macho_stub_size() as u32;
            text.extend_from_slice(bytes_of(&self.section(
                "__stubs",
                "__TEXT",
                l.stubs,
                align,
                macho::S_SYMBOL_STUBS | macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS,
                (0, stub_size),
            )));
        }
        if self.has_rodata {
            text.extend_from_slice(bytes_of(&self.section("__const", "__TEXT", l.rodata, 4, macho::S_REGULAR, (0, 0))));
        }
        add(&text, &mut count);

        if self.has_imports() {
            let rw = macho::VM_PROT_READ | macho::VM_PROT_WRITE;
            let mut data = bytes_of(&Self::segment(
                "__DATA_CONST",
                l.data_segment,
                l.data_segment.size,
                rw,
                1,
                SG_READ_ONLY,
            ))
            .to_vec();
            data.extend_from_slice(bytes_of(&self.section(
                "__got",
                "__DATA_CONST",
                l.got,
                3,
                macho::S_NON_LAZY_SYMBOL_POINTERS,
                (self.imports.len() as u32, 0),
            )));
            add(&data, &mut count);
        }

        let linkedit_vmsize = align_up(l.linkedit.size, page);
        add(
            bytes_of(&Self::segment("__LINKEDIT", l.linkedit, linkedit_vmsize, macho::VM_PROT_READ, 0, 0)),
            &mut count,
        );

        if self.has_imports() {
            let fixups = macho::LinkeditDataCommand {
                cmd: u32(macho::LC_DYLD_CHAINED_FIXUPS),
                cmdsize: u32(16),
                dataoff: u32(l.fixups.offset as u32),
                datasize: u32(l.fixups.size as u32),
            };
            add(bytes_of(&fixups), &mut count);
        }

        let symtab = macho::SymtabCommand {
            cmd: u32(macho::LC_SYMTAB),
            cmdsize: u32(24),
            symoff: u32(l.symtab.offset as u32),
            nsyms: u32(self.symbol_count() as u32),
            stroff: u32(l.strtab.offset as u32),
            strsize: u32(l.strtab.size as u32),
        };
        add(bytes_of(&symtab), &mut count);

        let locals = self.locals.len() as u32;
        let dysymtab = macho::DysymtabCommand {
            cmd: u32(macho::LC_DYSYMTAB),
            cmdsize: u32(80),
            ilocalsym: u32(0),
            nlocalsym: u32(locals),
            iextdefsym: u32(locals),
            nextdefsym: u32(0),
            iundefsym: u32(locals),
            nundefsym: u32(self.imports.len() as u32),
            tocoff: u32(0),
            ntoc: u32(0),
            modtaboff: u32(0),
            nmodtab: u32(0),
            extrefsymoff: u32(0),
            nextrefsyms: u32(0),
            indirectsymoff: u32(if self.has_imports() { l.indirect.offset as u32 } else { 0 }),
            nindirectsyms: u32(2 * self.imports.len() as u32),
            extreloff: u32(0),
            nextrel: u32(0),
            locreloff: u32(0),
            nlocrel: u32(0),
        };
        add(bytes_of(&dysymtab), &mut count);

        let size = path_command_size(12, DYLD_PATH);
        let mut dylinker = bytes_of(&macho::DylinkerCommand {
            cmd: u32(macho::LC_LOAD_DYLINKER),
            cmdsize: u32(size as u32),
            name: macho::LcStr { offset: u32(12) },
        })
        .to_vec();
        dylinker.extend_from_slice(DYLD_PATH.as_bytes());
        dylinker.resize(size as usize, 0);
        add(&dylinker, &mut count);

        let main = macho::EntryPointCommand {
            cmd: u32(macho::LC_MAIN),
            cmdsize: u32(24),
            entryoff: u64(l.text.offset + u64::from(unit.entry_offset()?)),
            stacksize: u64(0),
        };
        add(bytes_of(&main), &mut count);

        for library in &self.libraries {
            let size = path_command_size(24, library);
            let mut dylib = bytes_of(&macho::DylibCommand {
                cmd: u32(macho::LC_LOAD_DYLIB),
                cmdsize: u32(size as u32),
                dylib: macho::Dylib {
                    name: macho::LcStr { offset: u32(24) },
                    timestamp: u32(2),
                    current_version: u32(0x0001_0000),
                    compatibility_version: u32(0x0001_0000),
                },
            })
            .to_vec();
            dylib.extend_from_slice(library.as_bytes());
            dylib.resize(size as usize, 0);
            add(&dylib, &mut count);
        }

        let build = macho::BuildVersionCommand {
            cmd: u32(macho::LC_BUILD_VERSION),
            cmdsize: u32(24),
            platform: u32(macho::PLATFORM_MACOS),
            minos: u32(MACOS_11),
            sdk: u32(MACOS_11),
            ntools: u32(0),
        };
        add(bytes_of(&build), &mut count);
        Ok((count, cmds))
    }

    fn mach_header(&self, ncmds: u32, sizeofcmds: u32) -> CompileResult<macho::MachHeader64<LittleEndian>> {
        let (cputype, cpusubtype) = cpu(self.target.arch)?;
        let mut flags = macho::MH_DYLDLINK | macho::MH_TWOLEVEL | macho::MH_PIE;
        if !self.has_imports() {
            flags |= macho::MH_NOUNDEFS;
        }
        Ok(macho::MachHeader64 {
            magic: U32::new(BigEndian, macho::MH_CIGAM_64),
            cputype: u32(cputype),
            cpusubtype: u32(cpusubtype),
            filetype: u32(macho::MH_EXECUTE),
            ncmds: u32(ncmds),
            sizeofcmds: u32(sizeofcmds),
            flags: u32(flags),
            reserved: u32(0),
        })
    }
}

impl ImageWriter for MachOWriter {
    fn name(&self) -> &'static str {
        "Mach-O"
    }

    fn size(&mut self, unit: &CodeUnit) -> CompileResult<()> {
        self.imports = unit.imports.iter().map(|(_, i)| i.name.clone()).collect();
        self.libraries = unit.imports.libraries().into_iter().map(str::to_string).collect();
        if self.libraries.is_empty() {
            self.libraries.push(LIBSYSTEM.to_string());
        }
        self.ordinals = unit
            .imports
            .iter()
            .map(|(_, import)| {
                self.libraries
                    .iter()
                    .position(|l| *l == import.library)
                    .map_or(1, |i| i as u32 + 1)
            })
            .collect();
        if self.emit_symbols {
            for function in &unit.functions {
                self.strtab.add(&Self::symbol_name(&function.name));
            }
        }
        for name in &self.imports {
            self.strtab.add(&Self::symbol_name(name));
        }
        self.has_rodata = !unit.rodata.is_empty();

        let segments = u64::from(self.segment_count());
        let sections = self.text_sections() + u64::from(self.has_imports());
        let dylibs: u64 = self.libraries.iter().map(|l| path_command_size(24, l)).sum();
        self.sizeofcmds = SEGMENT_SIZE * segments
            + SECTION_SIZE * sections
            + if self.has_imports() { 16 } else { 0 }
            + 24
            + 80
            + path_command_size(12, DYLD_PATH)
            + 24
            + dylibs
            + 24;
        // segments, [fixups], symtab, dysymtab, dylinker, main, dylibs, build version
        self.ncmds = self.segment_count()
            + u32::from(self.has_imports())
            + 5
            + self.libraries.len() as u32;
        log::debug!(
            "Mach-O sizing: {} import(s), {} load commands, {} bytes",
            self.imports.len(),
            self.ncmds,
            self.sizeofcmds
        );
        Ok(())
    }

    fn layout(&mut self, unit: &CodeUnit) -> CompileResult<AddressMap> {
        let page = ImageFormat::MachO.page_size();
        let mut cursor = Cursor::new(TEXT_BASE);
        let mut l = MachLayout {
            header: cursor.place(HEADER_SIZE + self.sizeofcmds, 8),
            ..MachLayout::default()
        };
        l.text = cursor.place(unit.text.len() as u64, 16);
        l.stubs = cursor.place((self.imports.len() * self.encoder.macho_stub_size()) as u64, 4);
        l.rodata = cursor.place(if self.has_rodata { unit.rodata.len() as u64 } else { 0 }, 16);
        cursor.align(page);
        l.text_segment = Placement {
            offset: 0,
            addr: TEXT_BASE,
            size: cursor.offset(),
        };
        if self.has_imports() {
            let start = cursor.clone();
            l.got = cursor.place(8 * self.imports.len() as u64, 8);
            cursor.align(page);
            l.data_segment = Placement {
                offset: start.offset(),
                addr: start.addr(),
                size: cursor.offset() - start.offset(),
            };
        }
        let linkedit_start = cursor.clone();
        self.layout = l;

        if self.has_imports() {
            self.fixups = self.chained_fixups();
            self.layout.fixups = cursor.place(self.fixups.len() as u64, 8);
        }
        if self.emit_symbols {
            self.locals = unit
                .functions
                .iter()
                .map(|f| (Self::symbol_name(&f.name), self.layout.text.addr + u64::from(f.offset)))
                .collect();
        }
        self.layout.symtab = cursor.place(NLIST_SIZE * self.symbol_count() as u64, 8);
        self.layout.indirect = cursor.place(8 * self.imports.len() as u64, 4);
        self.layout.strtab = cursor.place(self.strtab.len() as u64, 8);
        cursor.align(8);
        self.layout.linkedit = Placement {
            offset: linkedit_start.offset(),
            addr: linkedit_start.addr(),
            size: cursor.offset() - linkedit_start.offset(),
        };
        self.layout.file_size = cursor.offset();

        Ok(AddressMap {
            text: self.layout.text.addr,
            rodata: self.layout.rodata.addr,
            stubs: (0..self.imports.len()).map(|i| self.stub_address(i)).collect(),
        })
    }

    fn planned_header_size(&self) -> u64 {
        self.layout.header.size
    }

    fn write(&mut self, unit: &CodeUnit) -> CompileResult<(Vec<u8>, u64)> {
        let l = &self.layout;
        let mut image = FileImage::with_size(l.file_size);

        let (ncmds, cmds) = self.load_commands(unit)?;
        if ncmds != self.ncmds || cmds.len() as u64 != self.sizeofcmds {
            return Err(CompileError::internal(format!(
                "Mach-O load commands: planned {} in {} bytes, built {ncmds} in {}",
                self.ncmds,
                self.sizeofcmds,
                cmds.len()
            )));
        }
        let mut headers = bytes_of(&self.mach_header(ncmds, cmds.len() as u32)?).to_vec();
        headers.extend_from_slice(&cmds);
        image.write("Mach-O header", l.header, &headers)?;

        image.write("__text", l.text, unit.text.as_slice())?;
        if self.has_imports() {
            image.write("__stubs", l.stubs, &self.stubs()?)?;
            image.write("__got", l.got, &self.got())?;
            image.write("chained fixups", l.fixups, &self.fixups)?;
            image.write("indirect symbols", l.indirect, &self.indirect_symbols())?;
        }
        if self.has_rodata {
            image.write("__const", l.rodata, unit.rodata.as_slice())?;
        }
        image.write("symbol table", l.symtab, &self.symbol_table())?;
        image.write("string table", l.strtab, self.strtab.as_bytes())?;

        Ok((image.into_bytes(), headers.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::generate;
    use crate::codegen::samples;
    use crate::core::test_utils::test::TestContext;
    use crate::image::layout::build_image;
    use object::{Object, ObjectSection, ObjectSegment};

    fn build(arch: Arch, sample: &str) -> Vec<u8> {
        let ctx = TestContext::new();
        let target = Target::new(arch, ImageFormat::MachO);
        let session = ctx.session(target);
        let program = samples::find(sample).unwrap().program();
        let unit = generate(&session, &program).unwrap();
        let mut writer = MachOWriter::new(target, session.options()).unwrap();
        build_image(&session, unit, &mut writer).unwrap()
    }

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_static_image_segments() {
        for arch in [Arch::X86_64, Arch::Arm64] {
            let image = build(arch, "sum");
            assert_eq!(&image[..4], &[0xcf, 0xfa, 0xed, 0xfe]);
            let file = object::File::parse(&*image).unwrap();
            assert_eq!(file.format(), object::BinaryFormat::MachO);
            let names: Vec<String> = file
                .segments()
                .filter_map(|s| s.name().ok().flatten().map(str::to_string))
                .collect();
            assert_eq!(names, vec!["__PAGEZERO", "__TEXT", "__LINKEDIT"]);
            assert!(file.section_by_name("__text").is_some());
            assert!(file.imports().unwrap().is_empty());
        }
    }

    #[test]
    fn test_printf_binds_through_chained_fixups() {
        for arch in [Arch::X86_64, Arch::Arm64] {
            let image = build(arch, "printf");
            let file = object::File::parse(&*image).unwrap();
            let imports: Vec<&[u8]> = file.imports().unwrap().iter().map(|i| i.name()).collect();
            assert_eq!(imports, vec![&b"_printf"[..], &b"_exit"[..]]);

            let got = file.section_by_name("__got").unwrap();
            let data = got.data().unwrap();
            let slot = |i: usize| u64::from_le_bytes(data[8 * i..8 * i + 8].try_into().unwrap());
            assert_eq!(slot(0), chained_bind(0, 2));
            assert_eq!(slot(1), chained_bind(1, 0));
            let stubs = file.section_by_name("__stubs").unwrap();
            let stub_size = encoder_for(Target::new(arch, ImageFormat::MachO)).macho_stub_size();
            assert_eq!(stubs.size() as usize, imports.len() * stub_size);
        }
    }

    #[test]
    fn test_chained_fixups_header() {
        let ctx = TestContext::new();
        let target = Target::new(Arch::Arm64, ImageFormat::MachO);
        let session = ctx.session(target);
        let program = samples::find("printf").unwrap().program();
        let unit = generate(&session, &program).unwrap();
        let mut writer = MachOWriter::new(target, session.options()).unwrap();
        writer.size(&unit).unwrap();
        writer.layout(&unit).unwrap();
        let blob = writer.fixups.clone();

        assert_eq!(read_u32(&blob, 0), 0);
        let starts = read_u32(&blob, 4) as usize;
        let imports = read_u32(&blob, 8) as usize;
        let symbols = read_u32(&blob, 12) as usize;
        assert_eq!(read_u32(&blob, 16), 2);
        assert_eq!(read_u32(&blob, 20), DYLD_CHAINED_IMPORT);
        assert_eq!(read_u32(&blob, starts), 4);
        let segment = starts + read_u32(&blob, starts + 4 + 4 * 2) as usize;
        let format = u16::from_le_bytes(blob[segment + 6..segment + 8].try_into().unwrap());
        assert_eq!(format, DYLD_CHAINED_PTR_64);
        let import = read_u32(&blob, imports);
        assert_eq!(import & 0xFF, 1);
        let name_at = symbols + (import >> 9) as usize;
        assert_eq!(&blob[name_at..name_at + 8], b"_printf\0");
    }

    #[test]
    fn test_riscv_is_rejected() {
        let target = Target::new(Arch::Riscv64, ImageFormat::MachO);
        let err = MachOWriter::new(target, &CompileOptions::default()).err().unwrap();
        assert!(matches!(err, CompileError::UnsupportedOperation { .. }));
    }
}
