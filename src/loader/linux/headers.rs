//! Linux Kernel headers related to the x86 boot protocol.
//!
//! Everything here is wire format: the setup header lives at a fixed offset inside
//! the kernel image and the "zero page" (`boot_params`) layout is dictated by the
//! kernel. All fields are little-endian.

use bytemuck::{Pod, Zeroable};

/// Offset of the [`SetupHeader`] in the Linux Kernel image.
pub const SETUP_HDR_OFFSET: usize = 0x01f1;

/// Value of [`SetupHeader::header`]: `"HdrS"`, found at file offset `0x202`.
pub const SETUP_HDR_MAGIC: u32 = 0x5372_6448;

/// Value of [`SetupHeader::boot_flag`].
pub const SETUP_BOOT_FLAG: u16 = 0xAA55;

/// Oldest boot protocol this loader speaks (2.06: 32-bit `cmd_line_ptr`, relocatable
/// kernel information).
pub const SETUP_MIN_VERSION: u16 = 0x0206;

/// Default load address of the protected-mode kernel (`bzImage`).
pub const BZIMAGE_LOAD_ADDR: u64 = 0x10_0000;

/// Highest end address of the real-mode area (setup, zero page, command line).
pub const REAL_MODE_AREA_END: u64 = 0x9_0000;

// `loadflags` bits.
pub const LOADED_HIGH: u8 = 1 << 0;
pub const CAN_USE_HEAP: u8 = 1 << 7;

// `xloadflags` bits.
pub const XLF_KERNEL_64: u16 = 1 << 0;
pub const XLF_CAN_BE_LOADED_ABOVE_4G: u16 = 1 << 1;
pub const XLF_EFI_HANDOVER_32: u16 = 1 << 2;
pub const XLF_EFI_HANDOVER_64: u16 = 1 << 3;

/// `type_of_loader` value for loaders without an assigned id.
pub const LOADER_TYPE_UNKNOWN: u8 = 0xFF;

/// Kernel attributes, used by the Linux Kernel during its setup.
///
/// The real-mode code consists of the boot sector plus the setup code; this header
/// sits inside it at [`SETUP_HDR_OFFSET`]. The loader copies it out, fills in the
/// write fields and copies it back into the zero page.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct SetupHeader {
    /// Size of the setup code, in 512-byte sectors (0 means 4).
    pub setup_sects: u8,

    /// If set, root is mounted read-only (deprecated, use `ro` in command line).
    pub root_flags: u16,

    /// Size of the 32-bit code in 16-byte paragraphs.
    pub syssize: u32,

    /// Do not use.
    pub ram_size: u16,

    /// Video mode control.
    pub vid_mode: u16,

    /// Default root device number (deprecated, use `root=` in command line).
    pub root_dev: u16,

    /// `0xAA55` magic number.
    pub boot_flag: u16,

    /// x86 JMP instruction.
    pub jump: u16,

    /// Magic signature, should be `"HdrS"`.
    pub header: u32,

    /// Boot protocol version supported (`major << 8 | minor`).
    pub version: u16,

    /// Boot loader hook (obsolete).
    pub realmode_swtch: u32,

    /// Load-low segment (obsolete).
    pub start_sys_seg: u16,

    /// Pointer to the kernel version string, less 0x200.
    pub kernel_version: u16,

    /// Bootloader identifier.
    pub type_of_loader: u8,

    /// Boot protocol option flags ([`LOADED_HIGH`], [`CAN_USE_HEAP`], ...).
    pub loadflags: u8,

    /// Move to high memory size (obsolete).
    pub setup_move_size: u16,

    /// Address to jump to in protected mode.
    pub code32_start: u32,

    /// initrd load address.
    pub ramdisk_image: u32,

    /// initrd size.
    pub ramdisk_size: u32,

    /// Do not use.
    pub bootsect_kludge: u32,

    /// Offset, from the start of the real-mode code, of the end of the setup
    /// stack/heap, minus 0x200.
    pub heap_end_ptr: u16,

    /// Extended bootloader version.
    pub ext_loader_ver: u8,

    /// Extended bootloader ID.
    pub ext_loader_type: u8,

    /// 32-bit pointer to the kernel command line.
    pub cmd_line_ptr: u32,

    /// Highest legal initrd address.
    pub initrd_addr_max: u32,

    /// Physical address alignment required for the kernel.
    pub kernel_alignment: u32,

    /// Non-zero when the kernel can run from any address satisfying the alignment.
    pub relocatable_kernel: u8,

    /// Minimum alignment the kernel accepts, as a power of two.
    pub min_alignment: u8,

    /// Boot protocol option flags ([`XLF_KERNEL_64`], [`XLF_EFI_HANDOVER_64`], ...).
    pub xloadflags: u16,

    /// Maximum size of the kernel command line, without the terminating NUL.
    pub cmdline_size: u32,

    /// Hardware subarchitecture (paravirtualized environments).
    pub hardware_subarch: u32,

    /// Subarchitecture-specific data.
    pub hardware_subarch_data: u64,

    /// Offset of the (possibly compressed) kernel payload.
    pub payload_offset: u32,

    /// Length of the kernel payload.
    pub payload_length: u32,

    /// 64-bit physical pointer to a linked list of `setup_data` records.
    pub setup_data: u64,

    /// Preferred loading address.
    pub pref_address: u64,

    /// Linear memory required during initialization.
    pub init_size: u32,

    /// Offset of the EFI handover entry point, relative to the protected-mode code.
    pub handover_offset: u32,

    /// Offset of the `kernel_info` structure.
    pub kernel_info_offset: u32,
}

impl SetupHeader {
    /// Copies the `SetupHeader` out of a kernel image.
    ///
    /// The returned header is a copy: the loader fills in its fields and writes it
    /// into the zero page, the image itself stays pristine.
    pub fn copy_from_image(image: &[u8]) -> Option<Self> {
        let end = SETUP_HDR_OFFSET + core::mem::size_of::<Self>();
        let bytes = image.get(SETUP_HDR_OFFSET..end)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    /// Whether the image carries the boot protocol signature.
    pub fn is_valid(&self) -> bool {
        u16::from_le(self.boot_flag) == SETUP_BOOT_FLAG && u32::from_le(self.header) == SETUP_HDR_MAGIC
    }

    pub fn protocol_version(&self) -> u16 {
        u16::from_le(self.version)
    }

    /// Byte size of the real-mode part (boot sector + setup code).
    pub fn setup_size(&self) -> usize {
        let sects = if self.setup_sects == 0 {
            4
        } else {
            self.setup_sects as usize
        };
        (sects + 1) * 512
    }

    pub fn is_relocatable(&self) -> bool {
        self.relocatable_kernel != 0
    }

    pub fn alignment(&self) -> u64 {
        u64::from(u32::from_le(self.kernel_alignment)).max(crate::mem::PAGE_SIZE)
    }

    pub fn initrd_limit(&self) -> u64 {
        match u32::from_le(self.initrd_addr_max) {
            0 => 0x37FF_FFFF,
            max => u64::from(max),
        }
    }
}

/// One E820 memory range inside the zero page.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct BootE820Entry {
    pub addr: u64,
    pub size: u64,
    pub entry_type: u32,
}

pub const E820_TYPE_RAM: u32 = 1;
pub const E820_TYPE_RESERVED: u32 = 2;

/// Maximum number of E820 entries the zero page can carry.
pub const E820_MAX_ENTRIES: usize = 128;

// Zero-page ("boot_params") field offsets the loader writes.
/// `screen_info.orig_video_isvga`.
pub const ZP_VIDEO_ISVGA: usize = 0x0f;
/// `screen_info.lfb_width`.
pub const ZP_LFB_WIDTH: usize = 0x12;
/// `screen_info.lfb_height`.
pub const ZP_LFB_HEIGHT: usize = 0x14;
/// `screen_info.lfb_depth`.
pub const ZP_LFB_DEPTH: usize = 0x16;
/// `screen_info.lfb_base`.
pub const ZP_LFB_BASE: usize = 0x18;
/// `screen_info.lfb_size`.
pub const ZP_LFB_SIZE: usize = 0x1c;
/// `screen_info.lfb_linelength`.
pub const ZP_LFB_LINELENGTH: usize = 0x24;
/// `e820_entries` count byte.
pub const ZP_E820_ENTRIES: usize = 0x1e8;
/// Copy of the (updated) setup header.
pub const ZP_SETUP_HEADER: usize = SETUP_HDR_OFFSET;
/// `e820_table[128]`.
pub const ZP_E820_TABLE: usize = 0x2d0;

/// `screen_info.orig_video_isvga` value for a linear framebuffer.
pub const VIDEO_TYPE_VLFB: u8 = 0x23;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_matches_the_protocol() {
        assert_eq!(core::mem::size_of::<SetupHeader>(), 0x7b);
        assert_eq!(core::mem::offset_of!(SetupHeader, boot_flag), 0x1fe - 0x1f1);
        assert_eq!(core::mem::offset_of!(SetupHeader, header), 0x202 - 0x1f1);
        assert_eq!(core::mem::offset_of!(SetupHeader, version), 0x206 - 0x1f1);
        assert_eq!(core::mem::offset_of!(SetupHeader, cmd_line_ptr), 0x228 - 0x1f1);
        assert_eq!(core::mem::offset_of!(SetupHeader, xloadflags), 0x236 - 0x1f1);
        assert_eq!(core::mem::offset_of!(SetupHeader, pref_address), 0x258 - 0x1f1);
        assert_eq!(
            core::mem::offset_of!(SetupHeader, handover_offset),
            0x264 - 0x1f1
        );
    }

    #[test]
    fn setup_size_follows_the_sector_count() {
        let mut header: SetupHeader = Zeroable::zeroed();
        header.setup_sects = 7;
        assert_eq!(header.setup_size(), 8 * 512);

        // Zero means four sectors, a quirk kept since the dawn of time.
        header.setup_sects = 0;
        assert_eq!(header.setup_size(), 5 * 512);
    }
}
