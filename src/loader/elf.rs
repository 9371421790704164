//! Minimal `ELF` object views used by the native loader.
//!
//! Only what image loading needs: the file header, program headers (loadable
//! segments and note segments), section headers, and note record parsing. All
//! multi-byte fields are little-endian on disk; accessors convert explicitly.

use bytemuck::{Pod, Zeroable};

use crate::errors::{FsResult, Status};

/// `ELF` magic number.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// 64-bit file class.
pub const ELF_CLASS_64: u8 = 2;
/// 32-bit file class.
pub const ELF_CLASS_32: u8 = 1;
/// Little-endian data encoding.
pub const ELF_DATA_LSB: u8 = 1;

/// Executable file type.
pub const ET_EXEC: u16 = 2;

/// x86-64 machine.
pub const EM_X86_64: u16 = 62;

/// Loadable segment.
pub const PT_LOAD: u32 = 1;
/// Note segment.
pub const PT_NOTE: u32 = 4;

/// Contains architecture independent information on how to decode the file's content.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ElfIdentification {
    /// Contains a magic number, used to identify `ELF` files.
    pub magic: [u8; 4],

    /// Identifies the file class (or capacity).
    pub class: u8,

    /// Specifies the encoding of the processor-specific data in the object file.
    pub encoding: u8,

    /// `ELF` header version number.
    pub version: u8,

    pub os_abi: u8,
    pub abi_version: u8,
    pub reserved: [u8; 7],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ElfHeader64 {
    /// Contains architecture independent information on how to decode the file's
    /// content.
    pub ident: ElfIdentification,

    /// Identifies the object file type.
    pub file_type: u16,

    /// Used to specify the required architecture for this file.
    pub arch: u16,

    /// Identifies the object file version.
    pub version: u32,

    /// Virtual address used when entering the program.
    pub entry: u64,

    /// Offset of the program header table (in bytes).
    pub prog_header_offset: u64,

    /// Offset of the section header table (in bytes).
    pub sect_header_offset: u64,

    /// Architecture-specific flags associated to this file.
    pub flags: u32,

    /// ELF Header size (in bytes).
    pub header_size: u16,

    /// Size of a single entry in the program header table (in bytes).
    pub prog_header_size: u16,

    /// Number of entries in the program header table.
    pub prog_header_count: u16,

    /// Size of a section header (in bytes).
    pub sect_header_size: u16,

    /// Number of entries in the section header table.
    pub sect_header_count: u16,

    /// Section header table index of the section name string table.
    pub shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ElfProgramHeader64 {
    pub seg_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub virt_addr: u64,
    pub phys_addr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub align: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ElfSectionHeader64 {
    pub name: u32,
    pub section_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addr_align: u64,
    pub entry_size: u64,
}

/// Header of one note record inside a `PT_NOTE` segment.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ElfNoteHeader {
    /// Length of the name field, including its terminating NUL.
    pub name_size: u32,
    pub desc_size: u32,
    pub note_type: u32,
}

/// A borrowed, validated view over a 64-bit `ELF` image.
pub struct ElfView<'a> {
    data: &'a [u8],
    header: ElfHeader64,
}

impl<'a> ElfView<'a> {
    /// Validates the identification and header and builds a view.
    ///
    /// 32-bit images are reported as [`Status::NotSupported`] so the caller can
    /// distinguish "not an ELF" from "wrong bitness".
    pub fn parse(data: &'a [u8]) -> FsResult<Self> {
        if data.len() < core::mem::size_of::<ElfHeader64>() {
            return Err(Status::InvalidArg);
        }

        let ident: ElfIdentification =
            bytemuck::pod_read_unaligned(&data[..core::mem::size_of::<ElfIdentification>()]);
        if ident.magic != ELF_MAGIC {
            return Err(Status::InvalidArg);
        }
        if ident.class == ELF_CLASS_32 {
            return Err(Status::NotSupported);
        }
        if ident.class != ELF_CLASS_64 || ident.encoding != ELF_DATA_LSB {
            return Err(Status::NotSupported);
        }

        let header: ElfHeader64 =
            bytemuck::pod_read_unaligned(&data[..core::mem::size_of::<ElfHeader64>()]);

        Ok(Self { data, header })
    }

    pub fn header(&self) -> &ElfHeader64 {
        &self.header
    }

    pub fn machine(&self) -> u16 {
        u16::from_le(self.header.arch)
    }

    pub fn entry(&self) -> u64 {
        u64::from_le(self.header.entry)
    }

    pub fn is_executable(&self) -> bool {
        u16::from_le(self.header.file_type) == ET_EXEC
    }

    /// All program headers, in table order.
    pub fn program_headers(&self) -> FsResult<alloc::vec::Vec<ElfProgramHeader64>> {
        let offset = u64::from_le(self.header.prog_header_offset) as usize;
        let entry_size = u16::from_le(self.header.prog_header_size) as usize;
        let count = u16::from_le(self.header.prog_header_count) as usize;

        if entry_size < core::mem::size_of::<ElfProgramHeader64>()
            || offset + entry_size * count > self.data.len()
        {
            return Err(Status::InvalidArg);
        }

        Ok((0..count)
            .map(|i| {
                let at = offset + i * entry_size;
                bytemuck::pod_read_unaligned(
                    &self.data[at..at + core::mem::size_of::<ElfProgramHeader64>()],
                )
            })
            .collect())
    }

    /// All section headers, in table order.
    pub fn section_headers(&self) -> FsResult<alloc::vec::Vec<ElfSectionHeader64>> {
        let offset = u64::from_le(self.header.sect_header_offset) as usize;
        let entry_size = u16::from_le(self.header.sect_header_size) as usize;
        let count = u16::from_le(self.header.sect_header_count) as usize;

        if count == 0 {
            return Ok(alloc::vec::Vec::new());
        }
        if entry_size < core::mem::size_of::<ElfSectionHeader64>()
            || offset + entry_size * count > self.data.len()
        {
            return Err(Status::InvalidArg);
        }

        Ok((0..count)
            .map(|i| {
                let at = offset + i * entry_size;
                bytemuck::pod_read_unaligned(
                    &self.data[at..at + core::mem::size_of::<ElfSectionHeader64>()],
                )
            })
            .collect())
    }

    /// The file bytes backing a segment.
    pub fn segment_data(&self, phdr: &ElfProgramHeader64) -> FsResult<&'a [u8]> {
        let offset = u64::from_le(phdr.offset) as usize;
        let size = u64::from_le(phdr.file_size) as usize;

        self.data.get(offset..offset + size).ok_or(Status::InvalidArg)
    }

    /// Collects every note record with the given owner name, across all `PT_NOTE`
    /// segments. Yields `(type, descriptor)` pairs in file order.
    pub fn notes(&self, owner: &str) -> FsResult<alloc::vec::Vec<(u32, &'a [u8])>> {
        let mut found = alloc::vec::Vec::new();

        for phdr in self.program_headers()? {
            if u32::from_le(phdr.seg_type) != PT_NOTE {
                continue;
            }

            let seg = self.segment_data(&phdr)?;
            let mut pos = 0usize;

            while pos + core::mem::size_of::<ElfNoteHeader>() <= seg.len() {
                let note: ElfNoteHeader = bytemuck::pod_read_unaligned(
                    &seg[pos..pos + core::mem::size_of::<ElfNoteHeader>()],
                );
                pos += core::mem::size_of::<ElfNoteHeader>();

                let name_size = u32::from_le(note.name_size) as usize;
                let desc_size = u32::from_le(note.desc_size) as usize;
                if pos + name_size > seg.len() {
                    return Err(Status::InvalidArg);
                }

                let name = &seg[pos..pos + name_size];
                pos += name_size.next_multiple_of(4);

                if pos + desc_size > seg.len() {
                    return Err(Status::InvalidArg);
                }
                let desc = &seg[pos..pos + desc_size];
                pos += desc_size.next_multiple_of(4);

                // The stored name includes its terminating NUL.
                if name.strip_suffix(&[0]) == Some(owner.as_bytes()) {
                    found.push((u32::from_le(note.note_type), desc));
                }
            }
        }

        Ok(found)
    }
}
