// This module writes ELF64 executables for Linux. Images are ET_EXEC at a fixed base so
// file offsets and addresses differ by a constant. A program without imports is static:
// a read-only segment with the headers, an executable segment with the text, and a
// read-only rodata segment. With imports the image becomes dynamically linked: the first
// segment also carries the interpreter path, a SysV hash table, .dynsym, .dynstr and the
// .rela.plt jump slots; the text segment gains a PLT with one entry per import; a
// writable segment holds .dynamic and .got.plt. DT_BIND_NOW makes the loader fill every
// GOT slot before the entry point runs. Section headers are written after the loaded
// segments so standard tools can inspect the result.

//! ELF64 executable writer.

use object::elf;
use object::endian::{LittleEndian, I64, U16, U32, U64};
use object::pod::bytes_of;

use super::layout::{Cursor, FileImage, ImageWriter, Placement, StringTable};
use crate::arch::{encoder_for, Encoder};
use crate::codegen::CodeUnit;
use crate::core::{Arch, CompileError, CompileOptions, CompileResult, ImageFormat, Target};
use crate::reloc::AddressMap;

pub const BASE_ADDRESS: u64 = 0x40_0000;

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const SHDR_SIZE: u64 = 64;
const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;
const DYN_SIZE: u64 = 16;
/// `.got.plt` slots reserved for the dynamic linker.
const GOT_RESERVED: u64 = 3;

const LE: LittleEndian = LittleEndian;

fn u16(value: u16) -> U16<LittleEndian> {
    U16::new(LE, value)
}

fn u32(value: u32) -> U32<LittleEndian> {
    U32::new(LE, value)
}

fn u64(value: u64) -> U64<LittleEndian> {
    U64::new(LE, value)
}

/// Per-architecture ELF constants.
#[derive(Debug, Clone, Copy)]
struct Machine {
    machine: u16,
    flags: u32,
    jump_slot: u32,
    interpreter: &'static str,
}

impl Machine {
    fn for_arch(arch: Arch) -> Self {
        match arch {
            Arch::X86_64 => Machine {
                machine: elf::EM_X86_64,
                flags: 0,
                jump_slot: elf::R_X86_64_JUMP_SLOT,
                interpreter: "/lib64/ld-linux-x86-64.so.2",
            },
            Arch::Arm64 => Machine {
                machine: elf::EM_AARCH64,
                flags: 0,
                jump_slot: elf::R_AARCH64_JUMP_SLOT,
                interpreter: "/lib/ld-linux-aarch64.so.1",
            },
            Arch::Riscv64 => Machine {
                machine: elf::EM_RISCV,
                flags: elf::EF_RISCV_FLOAT_ABI_DOUBLE,
                jump_slot: elf::R_RISCV_JUMP_SLOT,
                interpreter: "/lib/ld-linux-riscv64-lp64d.so.1",
            },
        }
    }
}

#[derive(Debug, Clone)]
struct SectionSpec {
    name: &'static str,
    sh_type: u32,
    flags: u32,
    placement: Placement,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
}

#[derive(Debug, Default)]
struct ElfLayout {
    header: Placement,
    interp: Placement,
    hash: Placement,
    dynsym: Placement,
    dynstr: Placement,
    rela: Placement,
    text: Placement,
    plt: Placement,
    rodata: Placement,
    dynamic: Placement,
    got: Placement,
    symtab: Placement,
    strtab: Placement,
    shstrtab: Placement,
    shdrs: Placement,
    file_size: u64,
}

pub struct ElfWriter {
    target: Target,
    machine: Machine,
    encoder: Box<dyn Encoder>,
    emit_symbols: bool,
    imports: Vec<String>,
    libraries: Vec<String>,
    dynstr: StringTable,
    strtab: StringTable,
    shstrtab: StringTable,
    has_rodata: bool,
    phnum: u64,
    sections: Vec<SectionSpec>,
    layout: ElfLayout,
}

impl ElfWriter {
    pub fn new(target: Target, options: &CompileOptions) -> CompileResult<Self> {
        if target.format != ImageFormat::Elf {
            return Err(CompileError::internal(format!("ELF writer used for {target}")));
        }
        Ok(Self {
            target,
            machine: Machine::for_arch(target.arch),
            encoder: encoder_for(target),
            emit_symbols: options.emit_symbols,
            imports: Vec::new(),
            libraries: Vec::new(),
            dynstr: StringTable::new(&[0]),
            strtab: StringTable::new(&[0]),
            shstrtab: StringTable::new(&[0]),
            has_rodata: false,
            phnum: 0,
            sections: Vec::new(),
            layout: ElfLayout::default(),
        })
    }

    fn is_dynamic(&self) -> bool {
        !self.imports.is_empty()
    }

    fn dynamic_entries(&self) -> u64 {
        // DT_NEEDED per library, then HASH STRTAB SYMTAB STRSZ SYMENT PLTGOT PLTRELSZ
        // PLTREL JMPREL BIND_NOW FLAGS FLAGS_1 DEBUG NULL
        self.libraries.len() as u64 + 14
    }

    fn plt_size(&self) -> u64 {
        (self.encoder.plt_header_size() + self.imports.len() * self.encoder.plt_entry_size()) as u64
    }

    fn stub_address(&self, index: usize) -> u64 {
        self.layout.plt.addr
            + (self.encoder.plt_header_size() + index * self.encoder.plt_entry_size()) as u64
    }

    fn got_slot(&self, index: usize) -> u64 {
        self.layout.got.addr + 8 * (GOT_RESERVED + index as u64)
    }

    fn section_index(&self, name: &str) -> u32 {
        self.sections
            .iter()
            .position(|s| s.name == name)
            .map_or(0, |i| i as u32 + 1)
    }

    fn plan_sections(&mut self, function_count: usize) {
        let l = &self.layout;
        let mut specs = Vec::new();
        let alloc = elf::SHF_ALLOC;
        if self.is_dynamic() {
            specs.push(SectionSpec::new(".interp", elf::SHT_PROGBITS, alloc, l.interp, 1, 0));
            specs.push(SectionSpec::new(".hash", elf::SHT_HASH, alloc, l.hash, 8, 4));
            specs.push(SectionSpec::new(".dynsym", elf::SHT_DYNSYM, alloc, l.dynsym, 8, SYM_SIZE));
            specs.push(SectionSpec::new(".dynstr", elf::SHT_STRTAB, alloc, l.dynstr, 1, 0));
            specs.push(SectionSpec::new(
                ".rela.plt",
                elf::SHT_RELA,
                alloc | elf::SHF_INFO_LINK,
                l.rela,
                8,
                RELA_SIZE,
            ));
        }
        let code = alloc | elf::SHF_EXECINSTR;
        specs.push(SectionSpec::new(".text", elf::SHT_PROGBITS, code, l.text, 16, 0));
        if self.is_dynamic() {
            let entsize = self.encoder.plt_entry_size() as u64;
            specs.push(SectionSpec::new(".plt", elf::SHT_PROGBITS, code, l.plt, 16, entsize));
        }
        if self.has_rodata {
            specs.push(SectionSpec::new(".rodata", elf::SHT_PROGBITS, alloc, l.rodata, 16, 0));
        }
        if self.is_dynamic() {
            let data = alloc | elf::SHF_WRITE;
            specs.push(SectionSpec::new(".dynamic", elf::SHT_DYNAMIC, data, l.dynamic, 8, DYN_SIZE));
            specs.push(SectionSpec::new(".got.plt", elf::SHT_PROGBITS, data, l.got, 8, 8));
        }
        if self.emit_symbols {
            let mut symtab = SectionSpec::new(".symtab", elf::SHT_SYMTAB, 0, l.symtab, 8, SYM_SIZE);
            symtab.info = function_count as u32 + 1;
            specs.push(symtab);
            specs.push(SectionSpec::new(".strtab", elf::SHT_STRTAB, 0, l.strtab, 1, 0));
        }
        specs.push(SectionSpec::new(".shstrtab", elf::SHT_STRTAB, 0, l.shstrtab, 1, 0));
        self.sections = specs;

        let dynsym = self.section_index(".dynsym");
        let dynstr = self.section_index(".dynstr");
        let got = self.section_index(".got.plt");
        let strtab = self.section_index(".strtab");
        for section in &mut self.sections {
            match section.name {
                ".hash" => section.link = dynsym,
                ".dynsym" => {
                    section.link = dynstr;
                    section.info = 1;
                }
                ".rela.plt" => {
                    section.link = dynsym;
                    section.info = got;
                }
                ".dynamic" => section.link = dynstr,
                ".symtab" => section.link = strtab,
                _ => {}
            }
        }
    }

    fn file_header(&self, unit: &CodeUnit) -> CompileResult<elf::FileHeader64<LittleEndian>> {
        let entry = self.layout.text.addr + u64::from(unit.entry_offset()?);
        Ok(elf::FileHeader64 {
            e_ident: elf::Ident {
                magic: elf::ELFMAG,
                class: elf::ELFCLASS64,
                data: elf::ELFDATA2LSB,
                version: elf::EV_CURRENT,
                os_abi: elf::ELFOSABI_NONE,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: u16(elf::ET_EXEC),
            e_machine: u16(self.machine.machine),
            e_version: u32(u32::from(elf::EV_CURRENT)),
            e_entry: u64(entry),
            e_phoff: u64(EHDR_SIZE),
            e_shoff: u64(self.layout.shdrs.offset),
            e_flags: u32(self.machine.flags),
            e_ehsize: u16(EHDR_SIZE as u16),
            e_phentsize: u16(PHDR_SIZE as u16),
            e_phnum: u16(self.phnum as u16),
            e_shentsize: u16(SHDR_SIZE as u16),
            e_shnum: u16(self.sections.len() as u16 + 1),
            e_shstrndx: u16(self.section_index(".shstrtab") as u16),
        })
    }

    fn program_headers(&self) -> Vec<elf::ProgramHeader64<LittleEndian>> {
        let l = &self.layout;
        let page = ImageFormat::Elf.page_size();
        let mut headers = Vec::new();
        if self.is_dynamic() {
            let table = Placement {
                offset: EHDR_SIZE,
                addr: BASE_ADDRESS + EHDR_SIZE,
                size: PHDR_SIZE * self.phnum,
            };
            headers.push(segment(elf::PT_PHDR, elf::PF_R, table, 8));
            headers.push(segment(elf::PT_INTERP, elf::PF_R, l.interp, 1));
        }
        let first_end = if self.is_dynamic() { l.rela.end_offset() } else { l.header.end_offset() };
        let first = Placement {
            offset: 0,
            addr: BASE_ADDRESS,
            size: first_end,
        };
        headers.push(segment(elf::PT_LOAD, elf::PF_R, first, page));
        let code_end = if self.is_dynamic() { l.plt.end_offset() } else { l.text.end_offset() };
        let code = Placement {
            size: code_end - l.text.offset,
            ..l.text
        };
        headers.push(segment(elf::PT_LOAD, elf::PF_R | elf::PF_X, code, page));
        if self.has_rodata {
            headers.push(segment(elf::PT_LOAD, elf::PF_R, l.rodata, page));
        }
        if self.is_dynamic() {
            let data = Placement {
                size: l.got.end_offset() - l.dynamic.offset,
                ..l.dynamic
            };
            headers.push(segment(elf::PT_LOAD, elf::PF_R | elf::PF_W, data, page));
            headers.push(segment(elf::PT_DYNAMIC, elf::PF_R | elf::PF_W, l.dynamic, 8));
        }
        headers.push(segment(elf::PT_GNU_STACK, elf::PF_R | elf::PF_W, Placement::default(), 16));
        headers
    }

    /// SysV hash table with a single bucket chaining every symbol.
    fn hash_table(&self) -> Vec<u8> {
        let count = self.imports.len() as u32 + 1;
        let mut words = vec![1, count, if count > 1 { 1 } else { 0 }, 0];
        for index in 1..count {
            words.push(if index + 1 < count { index + 1 } else { 0 });
        }
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn dynamic_symbols(&self) -> Vec<u8> {
        let mut bytes = vec![0; SYM_SIZE as usize];
        for name in &self.imports {
            let sym = elf::Sym64 {
                st_name: u32(self.dynstr.offset(name).unwrap_or(0)),
                st_info: (elf::STB_GLOBAL << 4) | elf::STT_FUNC,
                st_other: elf::STV_DEFAULT,
                st_shndx: u16(elf::SHN_UNDEF),
                st_value: u64(0),
                st_size: u64(0),
            };
            bytes.extend_from_slice(bytes_of(&sym));
        }
        bytes
    }

    fn jump_slots(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for index in 0..self.imports.len() {
            let rela = elf::Rela64 {
                r_offset: u64(self.got_slot(index)),
                r_info: u64(((index as u64 + 1) << 32) | u64::from(self.machine.jump_slot)),
                r_addend: I64::new(LE, 0),
            };
            bytes.extend_from_slice(bytes_of(&rela));
        }
        bytes
    }

    fn plt(&self) -> CompileResult<Vec<u8>> {
        let plt = self.layout.plt.addr;
        let mut code = self.encoder.plt_header(plt, self.layout.got.addr)?;
        for index in 0..self.imports.len() {
            let entry = self
                .encoder
                .plt_entry(self.stub_address(index), self.got_slot(index), index as u32, plt)?;
            code.extend_from_slice(&entry);
        }
        Ok(code)
    }

    fn dynamic_section(&self) -> Vec<u8> {
        let l = &self.layout;
        let mut entries: Vec<(u32, u64)> = Vec::new();
        for library in &self.libraries {
            entries.push((elf::DT_NEEDED, u64::from(self.dynstr.offset(library).unwrap_or(0))));
        }
        entries.extend([
            (elf::DT_HASH, l.hash.addr),
            (elf::DT_STRTAB, l.dynstr.addr),
            (elf::DT_SYMTAB, l.dynsym.addr),
            (elf::DT_STRSZ, l.dynstr.size),
            (elf::DT_SYMENT, SYM_SIZE),
            (elf::DT_PLTGOT, l.got.addr),
            (elf::DT_PLTRELSZ, l.rela.size),
            (elf::DT_PLTREL, u64::from(elf::DT_RELA)),
            (elf::DT_JMPREL, l.rela.addr),
            (elf::DT_BIND_NOW, 0),
            (elf::DT_FLAGS, u64::from(elf::DF_BIND_NOW)),
            (elf::DT_FLAGS_1, u64::from(elf::DF_1_NOW)),
            (elf::DT_DEBUG, 0),
            (elf::DT_NULL, 0),
        ]);
        let mut bytes = Vec::new();
        for (tag, value) in entries {
            let entry = elf::Dyn64 {
                d_tag: u64(u64::from(tag)),
                d_val: u64(value),
            };
            bytes.extend_from_slice(bytes_of(&entry));
        }
        bytes
    }

    fn got(&self) -> Vec<u8> {
        let mut slots = vec![self.layout.dynamic.addr, 0, 0];
        for index in 0..self.imports.len() {
            // Lazy-binding convention; BIND_NOW overwrites these before entry.
            slots.push(match self.target.arch {
                Arch::X86_64 => self.stub_address(index) + 6,
                _ => self.layout.plt.addr,
            });
        }
        slots.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn symbol_table(&self, unit: &CodeUnit) -> Vec<u8> {
        let text_index = self.section_index(".text");
        let mut bytes = vec![0; SYM_SIZE as usize];
        for function in &unit.functions {
            let sym = elf::Sym64 {
                st_name: u32(self.strtab.offset(&function.name).unwrap_or(0)),
                st_info: (elf::STB_LOCAL << 4) | elf::STT_FUNC,
                st_other: elf::STV_DEFAULT,
                st_shndx: u16(text_index as u16),
                st_value: u64(self.layout.text.addr + u64::from(function.offset)),
                st_size: u64(u64::from(function.size)),
            };
            bytes.extend_from_slice(bytes_of(&sym));
        }
        bytes
    }

    fn section_headers(&self) -> Vec<u8> {
        let mut bytes = vec![0; SHDR_SIZE as usize];
        for section in &self.sections {
            let addr = if section.flags & elf::SHF_ALLOC != 0 { section.placement.addr } else { 0 };
            let header = elf::SectionHeader64 {
                sh_name: u32(self.shstrtab.offset(section.name).unwrap_or(0)),
                sh_type: u32(section.sh_type),
                sh_flags: u64(u64::from(section.flags)),
                sh_addr: u64(addr),
                sh_offset: u64(section.placement.offset),
                sh_size: u64(section.placement.size),
                sh_link: u32(section.link),
                sh_info: u32(section.info),
                sh_addralign: u64(section.align),
                sh_entsize: u64(section.entsize),
            };
            bytes.extend_from_slice(bytes_of(&header));
        }
        bytes
    }
}

impl SectionSpec {
    fn new(name: &'static str, sh_type: u32, flags: u32, placement: Placement, align: u64, entsize: u64) -> Self {
        Self {
            name,
            sh_type,
            flags,
            placement,
            link: 0,
            info: 0,
            align,
            entsize,
        }
    }
}

fn segment(p_type: u32, flags: u32, placement: Placement, align: u64) -> elf::ProgramHeader64<LittleEndian> {
    elf::ProgramHeader64 {
        p_type: u32(p_type),
        p_flags: u32(flags),
        p_offset: u64(placement.offset),
        p_vaddr: u64(placement.addr),
        p_paddr: u64(placement.addr),
        p_filesz: u64(placement.size),
        p_memsz: u64(placement.size),
        p_align: u64(align),
    }
}

impl ImageWriter for ElfWriter {
    fn name(&self) -> &'static str {
        "ELF"
    }

    fn size(&mut self, unit: &CodeUnit) -> CompileResult<()> {
        self.imports = unit.imports.iter().map(|(_, i)| i.name.clone()).collect();
        self.libraries = unit.imports.libraries().into_iter().map(str::to_string).collect();
        for library in &self.libraries {
            self.dynstr.add(library);
        }
        for name in &self.imports {
            self.dynstr.add(name);
        }
        if self.emit_symbols {
            for function in &unit.functions {
                self.strtab.add(&function.name);
            }
        }
        self.has_rodata = !unit.rodata.is_empty();

        // load(headers) load(text) gnu_stack [load(rodata)] [phdr interp load(data) dynamic]
        self.phnum = 3 + u64::from(self.has_rodata) + if self.is_dynamic() { 4 } else { 0 };
        log::debug!(
            "ELF sizing: {} import(s) from {} librar(ies), {} program headers",
            self.imports.len(),
            self.libraries.len(),
            self.phnum
        );
        Ok(())
    }

    fn layout(&mut self, unit: &CodeUnit) -> CompileResult<AddressMap> {
        let page = ImageFormat::Elf.page_size();
        let mut cursor = Cursor::new(BASE_ADDRESS);
        let mut l = ElfLayout {
            header: cursor.place(EHDR_SIZE + PHDR_SIZE * self.phnum, 8),
            ..ElfLayout::default()
        };
        if self.is_dynamic() {
            let symbols = self.imports.len() as u64 + 1;
            l.interp = cursor.place(self.machine.interpreter.len() as u64 + 1, 1);
            l.hash = cursor.place(4 * (3 + symbols), 8);
            l.dynsym = cursor.place(SYM_SIZE * symbols, 8);
            l.dynstr = cursor.place(self.dynstr.len() as u64, 1);
            l.rela = cursor.place(RELA_SIZE * self.imports.len() as u64, 8);
        }
        cursor.align(page);
        l.text = cursor.place(unit.text.len() as u64, 16);
        if self.is_dynamic() {
            l.plt = cursor.place(self.plt_size(), 16);
        }
        if self.has_rodata {
            cursor.align(page);
            l.rodata = cursor.place(unit.rodata.len() as u64, 16);
        } else {
            l.rodata = cursor.place(0, 16);
        }
        if self.is_dynamic() {
            cursor.align(page);
            l.dynamic = cursor.place(DYN_SIZE * self.dynamic_entries(), 8);
            l.got = cursor.place(8 * (GOT_RESERVED + self.imports.len() as u64), 8);
        }
        if self.emit_symbols {
            l.symtab = cursor.place(SYM_SIZE * (unit.functions.len() as u64 + 1), 8);
            l.strtab = cursor.place(self.strtab.len() as u64, 1);
        }
        self.layout = l;

        // Section names first: .shstrtab's size depends on them.
        self.plan_sections(unit.functions.len());
        for section in &self.sections {
            self.shstrtab.add(section.name);
        }
        self.layout.shstrtab = cursor.place(self.shstrtab.len() as u64, 1);
        self.layout.shdrs = cursor.place(SHDR_SIZE * (self.sections.len() as u64 + 1), 8);
        self.layout.file_size = cursor.offset();
        if let Some(section) = self.sections.iter_mut().find(|s| s.name == ".shstrtab") {
            section.placement = self.layout.shstrtab;
        }

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

        let mut headers = bytes_of(&self.file_header(unit)?).to_vec();
        let program_headers = self.program_headers();
        if program_headers.len() as u64 != self.phnum {
            return Err(CompileError::internal(format!(
                "ELF program headers: planned {}, built {}",
                self.phnum,
                program_headers.len()
            )));
        }
        for header in &program_headers {
            headers.extend_from_slice(bytes_of(header));
        }
        image.write("ELF headers", l.header, &headers)?;

        if self.is_dynamic() {
            let mut interp = self.machine.interpreter.as_bytes().to_vec();
            interp.push(0);
            image.write(".interp", l.interp, &interp)?;
            image.write(".hash", l.hash, &self.hash_table())?;
            image.write(".dynsym", l.dynsym, &self.dynamic_symbols())?;
            image.write(".dynstr", l.dynstr, self.dynstr.as_bytes())?;
            image.write(".rela.plt", l.rela, &self.jump_slots())?;
        }
        image.write(".text", l.text, unit.text.as_slice())?;
        if self.is_dynamic() {
            image.write(".plt", l.plt, &self.plt()?)?;
        }
        if self.has_rodata {
            image.write(".rodata", l.rodata, unit.rodata.as_slice())?;
        }
        if self.is_dynamic() {
            image.write(".dynamic", l.dynamic, &self.dynamic_section())?;
            image.write(".got.plt", l.got, &self.got())?;
        }
        if self.emit_symbols {
            image.write(".symtab", l.symtab, &self.symbol_table(unit))?;
            image.write(".strtab", l.strtab, self.strtab.as_bytes())?;
        }
        image.write(".shstrtab", l.shstrtab, self.shstrtab.as_bytes())?;
        image.write("section headers", l.shdrs, &self.section_headers())?;

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
    use object::{Object, ObjectSection, ObjectSymbol};

    fn build(target: Target, sample: &str) -> Vec<u8> {
        let ctx = TestContext::new();
        let session = ctx.session(target);
        let program = samples::find(sample).unwrap().program();
        let unit = generate(&session, &program).unwrap();
        let mut writer = ElfWriter::new(target, session.options()).unwrap();
        build_image(&session, unit, &mut writer).unwrap()
    }

    fn dynamic_tags(file: &object::File<'_>) -> Vec<(u64, u64)> {
        let data = file.section_by_name(".dynamic").unwrap().data().unwrap();
        data.chunks(16)
            .map(|entry| {
                let tag = u64::from_le_bytes(entry[..8].try_into().unwrap());
                let value = u64::from_le_bytes(entry[8..].try_into().unwrap());
                (tag, value)
            })
            .collect()
    }

    #[test]
    fn test_static_image_has_no_interpreter() {
        let image = build(Target::new(Arch::X86_64, ImageFormat::Elf), "sum");
        assert_eq!(&image[..4], &[0x7f, b'E', b'L', b'F']);
        let file = object::File::parse(&*image).unwrap();
        assert_eq!(file.architecture(), object::Architecture::X86_64);
        assert!(file.section_by_name(".interp").is_none());
        assert!(file.section_by_name(".dynamic").is_none());
        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.address(), BASE_ADDRESS + 0x1000);
        assert!(file.entry() >= text.address());
        assert!(file.entry() < text.address() + text.size());
    }

    #[test]
    fn test_printf_needs_libc_once_with_one_stub_per_import() {
        for arch in [Arch::X86_64, Arch::Arm64, Arch::Riscv64] {
            let target = Target::new(arch, ImageFormat::Elf);
            let image = build(target, "printf");
            let file = object::File::parse(&*image).unwrap();
            let dynstr = file.section_by_name(".dynstr").unwrap().data().unwrap().to_vec();
            let needed: Vec<String> = dynamic_tags(&file)
                .into_iter()
                .filter(|(tag, _)| *tag == u64::from(elf::DT_NEEDED))
                .map(|(_, offset)| {
                    let rest = &dynstr[offset as usize..];
                    let end = rest.iter().position(|&b| b == 0).unwrap();
                    String::from_utf8(rest[..end].to_vec()).unwrap()
                })
                .collect();
            assert_eq!(needed, vec!["libc.so.6".to_string()], "{target}");

            // main ends through the C exit so stdio is flushed.
            let imports: Vec<&[u8]> = file.imports().unwrap().iter().map(|i| i.name()).collect();
            assert_eq!(imports, vec![&b"printf"[..], &b"exit"[..]], "{target}");

            let encoder = encoder_for(target);
            let plt = file.section_by_name(".plt").unwrap();
            assert_eq!(
                plt.size() as usize,
                encoder.plt_header_size() + imports.len() * encoder.plt_entry_size(),
                "{target}"
            );
            let got = file.section_by_name(".got.plt").unwrap();
            assert_eq!(got.size(), 8 * (GOT_RESERVED + imports.len() as u64));
        }
    }

    #[test]
    fn test_dynamic_image_binds_now() {
        let image = build(Target::new(Arch::X86_64, ImageFormat::Elf), "printf");
        let file = object::File::parse(&*image).unwrap();
        let tags = dynamic_tags(&file);
        assert!(tags.contains(&(u64::from(elf::DT_BIND_NOW), 0)));
        assert_eq!(tags.last(), Some(&(u64::from(elf::DT_NULL), 0)));
        let interp = file.section_by_name(".interp").unwrap().data().unwrap();
        assert_eq!(interp, b"/lib64/ld-linux-x86-64.so.2\0");
    }

    #[test]
    fn test_riscv_header_flags() {
        let image = build(Target::new(Arch::Riscv64, ImageFormat::Elf), "arith");
        let flags = u32::from_le_bytes(image[48..52].try_into().unwrap());
        assert_eq!(flags, elf::EF_RISCV_FLOAT_ABI_DOUBLE);
        let machine = u16::from_le_bytes(image[18..20].try_into().unwrap());
        assert_eq!(machine, elf::EM_RISCV);
    }

    #[test]
    fn test_function_symbols_are_listed() {
        let image = build(Target::new(Arch::Arm64, ImageFormat::Elf), "tailsum");
        let file = object::File::parse(&*image).unwrap();
        let names: Vec<&str> = file.symbols().filter_map(|s| s.name().ok()).collect();
        for expected in ["_start", "main", "sum", "__print_number"] {
            assert!(names.contains(&expected), "{expected} missing from {names:?}");
        }
    }
}
