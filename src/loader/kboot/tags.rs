//! KBoot protocol structures.
//!
//! The native boot protocol is tag based. The OS image embeds *image tags* as ELF
//! notes named `"KBoot"` describing its requirements; the loader answers with a
//! contiguous list of *information tags* describing the machine, terminated by a
//! `NONE` tag and handed to the kernel with [`KBOOT_MAGIC`] in the agreed register.
//!
//! Every structure here is wire format: `repr(C)`, little-endian, reproduced
//! bit-exactly on both sides of the handoff.

use bytemuck::{Pod, Zeroable};

use crate::errors::{FsResult, Status};

/// Magic value handed to the kernel on entry.
pub const KBOOT_MAGIC: u32 = 0xb007cafe;

/// Owner name of the image-tag ELF notes.
pub const KBOOT_NOTE_NAME: &str = "KBoot";

/// Protocol version the loader implements; the image's `IMAGE` tag must match.
pub const KBOOT_VERSION: u32 = 2;

// Image tag types (notes embedded in the OS image).
pub const ITAG_IMAGE: u32 = 1;
pub const ITAG_LOAD: u32 = 2;
pub const ITAG_OPTION: u32 = 3;
pub const ITAG_MAPPING: u32 = 4;
pub const ITAG_VIDEO: u32 = 5;

// Information tag types (list handed to the kernel).
pub const TAG_NONE: u32 = 0;
pub const TAG_CORE: u32 = 1;
pub const TAG_OPTION: u32 = 2;
pub const TAG_MEMORY: u32 = 3;
pub const TAG_VMEM: u32 = 4;
pub const TAG_PAGETABLES: u32 = 5;
pub const TAG_MODULE: u32 = 6;
pub const TAG_VIDEO: u32 = 7;
pub const TAG_BOOTDEV: u32 = 8;
pub const TAG_LOG: u32 = 9;
pub const TAG_SECTIONS: u32 = 10;
pub const TAG_BIOS_E820: u32 = 11;
pub const TAG_EFI: u32 = 12;
pub const TAG_SERIAL: u32 = 13;

/// `IMAGE` tag flag: the kernel wants its ELF section headers (`SECTIONS` tag).
pub const IMAGE_FLAG_SECTIONS: u32 = 1 << 0;
/// `IMAGE` tag flag: the kernel wants the boot log (`LOG` tag).
pub const IMAGE_FLAG_LOG: u32 = 1 << 1;

/// `LOAD` tag flag: `phys_base` is a fixed physical load address.
pub const LOAD_FLAG_FIXED: u32 = 1 << 0;

/// `MAPPING` tag virtual address meaning "allocate from the virtual map window".
pub const MAPPING_VIRT_ANY: u64 = u64::MAX;

/// Required `IMAGE` note: protocol version and feature request flags.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ItagImage {
    pub version: u32,
    pub flags: u32,
}

/// `LOAD` note: physical placement constraints and the virtual map window.
///
/// A zero `alignment` requests the architecture default; `min_alignment` bounds how
/// far the loader may relax the alignment under memory pressure. A zero-sized virtual
/// map window likewise selects the architecture default.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ItagLoad {
    pub flags: u32,
    pub _pad: u32,
    pub alignment: u64,
    pub min_alignment: u64,
    pub phys_base: u64,
    pub virt_map_base: u64,
    pub virt_map_size: u64,
}

/// `OPTION` note header: a typed, user-configurable parameter. The name,
/// description and default value follow the header in that order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ItagOption {
    pub option_type: u8,
    pub _pad: [u8; 3],
    pub name_size: u32,
    pub desc_size: u32,
    pub default_size: u32,
}

pub const OPTION_TYPE_BOOLEAN: u8 = 0;
pub const OPTION_TYPE_STRING: u8 = 1;
pub const OPTION_TYPE_INTEGER: u8 = 2;

/// `MAPPING` note: an extra virtual mapping request.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ItagMapping {
    /// Requested virtual address, or [`MAPPING_VIRT_ANY`].
    pub virt: u64,
    pub phys: u64,
    pub size: u64,
    pub cache: u32,
    pub _pad: u32,
}

pub const CACHE_DEFAULT: u32 = 0;
pub const CACHE_WRITE_THROUGH: u32 = 1;
pub const CACHE_UNCACHED: u32 = 2;

/// `VIDEO` note: mode types the kernel accepts and its preferred dimensions.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ItagVideo {
    pub types: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
    pub _pad: [u8; 3],
}

pub const VIDEO_TYPE_VGA: u32 = 1 << 0;
pub const VIDEO_TYPE_LFB: u32 = 1 << 1;

/// Header common to every information tag. `size` is the whole tag length in bytes
/// including the header; the next tag starts at the size rounded up to 8.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagHeader {
    pub tag_type: u32,
    pub size: u32,
}

/// `CORE`: always first in the list.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct TagCore {
    pub tags_phys: u64,
    pub tags_size: u32,
    pub _pad: u32,
    pub kernel_phys: u64,
    pub stack_base: u64,
    pub stack_phys: u64,
    pub stack_size: u32,
    pub _pad2: u32,
}

/// `OPTION`: one per image `OPTION` note; the name and the value follow.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagOption {
    pub option_type: u8,
    pub _pad: [u8; 3],
    pub name_size: u32,
    pub value_size: u32,
    pub _pad2: u32,
}

/// `MEMORY`: one per range of the final physical memory map.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagMemory {
    pub start: u64,
    pub size: u64,
    pub memory_type: u8,
    pub _pad: [u8; 7],
}

/// `VMEM`: one per virtual mapping established for the kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagVmem {
    pub start: u64,
    pub size: u64,
    pub phys: u64,
    pub cache: u8,
    pub _pad: [u8; 7],
}

/// `PAGETABLES` (amd64): root table and the recursive-mapping base address.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagPagetables {
    pub pml4: u64,
    pub mapping: u64,
}

/// `MODULE`: one per user-supplied boot module; the name follows.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagModule {
    pub addr: u64,
    pub size: u32,
    pub name_size: u32,
}

/// `VIDEO`: the mode the machine was left in.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct TagVideo {
    pub video_type: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
    pub _pad: [u8; 3],
    pub framebuffer: u64,
    pub pitch: u32,
    pub _pad2: u32,
}

/// `BOOTDEV`: where the kernel was loaded from.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagBootdev {
    pub bootdev_type: u32,
    pub _pad: u32,
    /// Filesystem UUID, NUL-padded.
    pub uuid: [u8; 64],
}

pub const BOOTDEV_NONE: u32 = 0;
pub const BOOTDEV_FS: u32 = 1;
pub const BOOTDEV_NET: u32 = 2;
pub const BOOTDEV_OTHER: u32 = 3;

/// `LOG`: the loader's boot log buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagLog {
    pub log_virt: u64,
    pub log_phys: u64,
    pub log_size: u32,
    pub _pad: u32,
}

/// `SECTIONS`: raw ELF section headers of the kernel image; the table follows.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagSections {
    pub num: u32,
    pub entry_size: u32,
    pub shstrndx: u32,
    pub _pad: u32,
}

/// `BIOS_E820`: the raw firmware map on BIOS platforms; entries follow.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagBiosE820 {
    pub num_entries: u32,
    pub entry_size: u32,
}

/// `EFI`: firmware system table on EFI platforms.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagEfi {
    pub system_table: u64,
}

/// `SERIAL`: the serial console the loader was using.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TagSerial {
    pub addr: u64,
    pub mmio: u8,
    pub _pad: [u8; 3],
    pub baud_rate: u32,
}

/// Sequential information-tag writer over the (physically allocated) tag area.
pub struct TagWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> TagWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far, including padding.
    pub fn written(&self) -> usize {
        self.pos
    }

    /// Appends a tag with a fixed body and optional trailing payload. Returns the tag
    /// offset, for later patching.
    pub fn push<T: Pod>(&mut self, tag_type: u32, body: &T, payload: &[u8]) -> FsResult<usize> {
        let body_bytes = bytemuck::bytes_of(body);
        let size = core::mem::size_of::<TagHeader>() + body_bytes.len() + payload.len();
        let padded = size.next_multiple_of(8);

        if self.pos + padded > self.buf.len() {
            return Err(Status::NoMemory);
        }

        let offset = self.pos;
        let header = TagHeader {
            tag_type: tag_type.to_le(),
            size: (size as u32).to_le(),
        };
        self.buf[offset..offset + 8].copy_from_slice(bytemuck::bytes_of(&header));
        self.buf[offset + 8..offset + 8 + body_bytes.len()].copy_from_slice(body_bytes);
        self.buf[offset + 8 + body_bytes.len()..offset + size].copy_from_slice(payload);
        self.buf[offset + size..offset + padded].fill(0);

        self.pos += padded;
        Ok(offset)
    }

    /// Rewrites the body of a previously pushed tag, keeping its header.
    pub fn patch<T: Pod>(&mut self, offset: usize, body: &T) {
        let body_bytes = bytemuck::bytes_of(body);
        self.buf[offset + 8..offset + 8 + body_bytes.len()].copy_from_slice(body_bytes);
    }

    /// Terminates the list with the `NONE` tag and returns the total list size.
    pub fn finish(mut self) -> FsResult<usize> {
        let header = TagHeader {
            tag_type: TAG_NONE.to_le(),
            size: 8u32.to_le(),
        };
        if self.pos + 8 > self.buf.len() {
            return Err(Status::NoMemory);
        }
        self.buf[self.pos..self.pos + 8].copy_from_slice(bytemuck::bytes_of(&header));
        self.pos += 8;
        Ok(self.pos)
    }
}

/// Walks an information-tag list. Yields `(type, payload)` pairs, the payload being
/// everything after the header; stops at the `NONE` terminator.
pub struct TagIter<'a> {
    buf: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> TagIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for TagIter<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos + 8 > self.buf.len() {
            return None;
        }

        let header: TagHeader = bytemuck::pod_read_unaligned(&self.buf[self.pos..self.pos + 8]);
        let tag_type = u32::from_le(header.tag_type);
        let size = u32::from_le(header.size) as usize;

        if tag_type == TAG_NONE {
            self.done = true;
            return Some((TAG_NONE, &[]));
        }
        if size < 8 || self.pos + size > self.buf.len() {
            self.done = true;
            return None;
        }

        let payload = &self.buf[self.pos + 8..self.pos + size];
        self.pos += size.next_multiple_of(8);
        Some((tag_type, payload))
    }
}

/// The image tags recovered from an OS image's notes.
#[derive(Clone, Debug, Default)]
pub struct ImageTags {
    pub image: ItagImage,
    pub load: ItagLoad,
    pub options: alloc::vec::Vec<OptionSpec>,
    pub mappings: alloc::vec::Vec<ItagMapping>,
    pub video: Option<ItagVideo>,
}

/// A decoded `OPTION` note.
#[derive(Clone, Debug)]
pub struct OptionSpec {
    pub option_type: u8,
    pub name: alloc::string::String,
    pub description: alloc::string::String,
    pub default: alloc::vec::Vec<u8>,
}

/// Decodes the `"KBoot"` notes of an image. The `IMAGE` tag is required and its
/// version must match the protocol version.
pub fn parse_image_tags(notes: &[(u32, &[u8])]) -> FsResult<ImageTags> {
    let mut tags = ImageTags::default();
    let mut seen_image = false;

    for (ntype, desc) in notes {
        match *ntype {
            ITAG_IMAGE => {
                if desc.len() < core::mem::size_of::<ItagImage>() {
                    return Err(Status::InvalidArg);
                }
                tags.image =
                    bytemuck::pod_read_unaligned(&desc[..core::mem::size_of::<ItagImage>()]);
                seen_image = true;
            }
            ITAG_LOAD => {
                if desc.len() < core::mem::size_of::<ItagLoad>() {
                    return Err(Status::InvalidArg);
                }
                tags.load =
                    bytemuck::pod_read_unaligned(&desc[..core::mem::size_of::<ItagLoad>()]);
            }
            ITAG_OPTION => {
                let fixed = core::mem::size_of::<ItagOption>();
                if desc.len() < fixed {
                    return Err(Status::InvalidArg);
                }
                let header: ItagOption = bytemuck::pod_read_unaligned(&desc[..fixed]);
                let name_size = u32::from_le(header.name_size) as usize;
                let desc_size = u32::from_le(header.desc_size) as usize;
                let default_size = u32::from_le(header.default_size) as usize;
                if fixed + name_size + desc_size + default_size > desc.len() {
                    return Err(Status::InvalidArg);
                }

                let name = cstr(&desc[fixed..fixed + name_size])?;
                let description = cstr(&desc[fixed + name_size..fixed + name_size + desc_size])?;
                let default = desc
                    [fixed + name_size + desc_size..fixed + name_size + desc_size + default_size]
                    .to_vec();

                tags.options.push(OptionSpec {
                    option_type: header.option_type,
                    name,
                    description,
                    default,
                });
            }
            ITAG_MAPPING => {
                if desc.len() < core::mem::size_of::<ItagMapping>() {
                    return Err(Status::InvalidArg);
                }
                tags.mappings.push(bytemuck::pod_read_unaligned(
                    &desc[..core::mem::size_of::<ItagMapping>()],
                ));
            }
            ITAG_VIDEO => {
                if desc.len() < core::mem::size_of::<ItagVideo>() {
                    return Err(Status::InvalidArg);
                }
                tags.video = Some(bytemuck::pod_read_unaligned(
                    &desc[..core::mem::size_of::<ItagVideo>()],
                ));
            }
            _ => return Err(Status::InvalidArg),
        }
    }

    if !seen_image {
        return Err(Status::InvalidArg);
    }
    if u32::from_le(tags.image.version) != KBOOT_VERSION {
        return Err(Status::NotSupported);
    }

    Ok(tags)
}

fn cstr(bytes: &[u8]) -> FsResult<alloc::string::String> {
    let trimmed = bytes.strip_suffix(&[0]).unwrap_or(bytes);
    core::str::from_utf8(trimmed)
        .map(alloc::string::String::from)
        .map_err(|_| Status::InvalidArg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_and_iterator_round_trip() {
        let mut buf = [0u8; 512];
        let mut writer = TagWriter::new(&mut buf);

        let core_off = writer.push(TAG_CORE, &TagCore::default(), &[]).unwrap();
        assert_eq!(core_off, 0);
        writer
            .push(
                TAG_MEMORY,
                &TagMemory {
                    start: 0x1000u64.to_le(),
                    size: 0x2000u64.to_le(),
                    memory_type: 0,
                    _pad: [0; 7],
                },
                &[],
            )
            .unwrap();
        writer
            .push(
                TAG_MODULE,
                &TagModule {
                    addr: 0x8000u64.to_le(),
                    size: 16u32.to_le(),
                    name_size: 5u32.to_le(),
                },
                b"mod1\0",
            )
            .unwrap();

        writer.patch(
            core_off,
            &TagCore {
                tags_size: 0x40u32.to_le(),
                ..TagCore::default()
            },
        );
        let total = writer.finish().unwrap();
        assert_eq!(total % 8, 0);

        let kinds: alloc::vec::Vec<u32> = TagIter::new(&buf).map(|(t, _)| t).collect();
        assert_eq!(kinds, [TAG_CORE, TAG_MEMORY, TAG_MODULE, TAG_NONE]);

        // Tag payloads are 8-aligned and sized per the header.
        let (_, module_payload) = TagIter::new(&buf)
            .find(|(t, _)| *t == TAG_MODULE)
            .unwrap();
        assert_eq!(&module_payload[16..21], b"mod1\0");
    }

    #[test]
    fn image_note_is_required_and_versioned() {
        assert!(matches!(parse_image_tags(&[]), Err(Status::InvalidArg)));

        let v1 = bytemuck::bytes_of(&ItagImage {
            version: 1u32.to_le(),
            flags: 0,
        })
        .to_vec();
        assert!(matches!(
            parse_image_tags(&[(ITAG_IMAGE, &v1)]),
            Err(Status::NotSupported)
        ));

        let v2 = bytemuck::bytes_of(&ItagImage {
            version: KBOOT_VERSION.to_le(),
            flags: IMAGE_FLAG_LOG.to_le(),
        })
        .to_vec();
        let tags = parse_image_tags(&[(ITAG_IMAGE, &v2)]).unwrap();
        assert_eq!(u32::from_le(tags.image.flags), IMAGE_FLAG_LOG);
    }

    #[test]
    fn option_notes_decode_their_strings() {
        let header = ItagOption {
            option_type: OPTION_TYPE_BOOLEAN,
            _pad: [0; 3],
            name_size: 6u32.to_le(),
            desc_size: 10u32.to_le(),
            default_size: 1u32.to_le(),
        };
        let mut desc = bytemuck::bytes_of(&header).to_vec();
        desc.extend_from_slice(b"debug\0");
        desc.extend_from_slice(b"Debug log\0");
        desc.push(1);

        let image = bytemuck::bytes_of(&ItagImage {
            version: KBOOT_VERSION.to_le(),
            flags: 0,
        })
        .to_vec();

        let tags = parse_image_tags(&[(ITAG_IMAGE, &image), (ITAG_OPTION, &desc)]).unwrap();
        assert_eq!(tags.options.len(), 1);
        assert_eq!(tags.options[0].name, "debug");
        assert_eq!(tags.options[0].description, "Debug log");
        assert_eq!(tags.options[0].default, [1]);
    }
}
