//! Linux OS loader (x86 boot protocol).
//!
//! The `linux` command validates the image's setup header and binds this loader; the
//! load selects a physical placement honouring the image's alignment and
//! relocatability, copies the protected-mode kernel, builds the zero page (memory
//! map, video mode, loader signature, command line, optional initrd) and transfers
//! either through the EFI handover entry point or the legacy 16-bit entry, with
//! interrupts masked.

pub mod headers;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use headers::*;

use crate::config::{Environment, ValueList};
use crate::errors::{ConfigError, FsResult, Status};
use crate::fs::{HandleKind, OpenFlags};
use crate::loader::LoaderBinding;
use crate::mem::map::{MemoryMap, RangeType};
use crate::mem::phys::{AllocFlags, AllocRequest, PhysMemory};
use crate::mem::{phys_slice_mut, MemoryMapping, PhyAddr, PAGE_SIZE};
use crate::platform::VideoMode;
use crate::utils::align_up;

/// State built by the `linux` command.
pub struct LinuxState {
    pub path: String,
    kernel: Vec<u8>,
    header: SetupHeader,
    pub cmdline: String,
    initrd: Option<(String, Vec<u8>)>,
}

/// The `linux` command: `linux <image> [<command line> [<initrd>]]`. Validates and
/// binds; does not load.
pub fn linux_cmd(env: &mut Environment, args: ValueList) -> Result<(), ConfigError> {
    let path = crate::loader::arg_string(&args, 0, "kernel image path")?;
    let cmdline = match args.get(1) {
        Some(value) => match value.as_str() {
            Some(s) => String::from(s),
            None => config_error!("linux: command line must be a string"),
        },
        None => String::new(),
    };

    let handle = crate::config::exec::open_flags_checked(
        env,
        &path,
        Some(HandleKind::Regular),
        OpenFlags::empty(),
    )?;
    let kernel = crate::fs::read_whole(&handle)
        .map_err(|e| ConfigError::new(alloc::format!("{path}: {e}"), 0, 0))?;

    let Some(header) = SetupHeader::copy_from_image(&kernel) else {
        config_error!("{path}: file is too small to be a Linux kernel");
    };
    if !header.is_valid() {
        config_error!("{path}: image lacks the boot protocol signature");
    }
    if header.protocol_version() < SETUP_MIN_VERSION {
        config_error!(
            "{path}: boot protocol {:#06x} is older than the supported {:#06x}",
            header.protocol_version(),
            SETUP_MIN_VERSION
        );
    }
    if header.loadflags & LOADED_HIGH == 0 {
        config_error!("{path}: zImage kernels are not supported");
    }
    if kernel.len() <= header.setup_size() {
        config_error!("{path}: image is truncated");
    }
    if cmdline.len() as u32 > u32::from_le(header.cmdline_size) {
        config_error!("{path}: command line exceeds the kernel's limit");
    }

    let initrd = match args.get(2) {
        Some(value) => {
            let Some(initrd_path) = value.as_str() else {
                config_error!("linux: initrd path must be a string");
            };
            let handle = crate::config::exec::open_flags_checked(
                env,
                initrd_path,
                Some(HandleKind::Regular),
                OpenFlags::empty(),
            )?;
            let data = crate::fs::read_whole(&handle)
                .map_err(|e| ConfigError::new(alloc::format!("{initrd_path}: {e}"), 0, 0))?;
            Some((String::from(initrd_path), data))
        }
        None => None,
    };

    env.bind_loader(LoaderBinding::new(
        &LinuxLoader,
        Box::new(LinuxState {
            path,
            kernel,
            header,
            cmdline,
            initrd,
        }),
    ));
    Ok(())
}

/// How control reaches the kernel.
pub enum LinuxEntry {
    /// EFI handover protocol: call `entry` with the zero page.
    EfiHandover { entry: PhyAddr },
    /// Legacy path: the platform drops to real mode and jumps into the setup code.
    Legacy { setup_base: PhyAddr },
}

/// The load, short of the actual transfer.
pub struct PreparedLinux {
    pub kernel_phys: PhyAddr,
    /// Zero page ("boot_params") address.
    pub boot_params: PhyAddr,
    pub cmdline_phys: PhyAddr,
    pub initrd: Option<(PhyAddr, u64)>,
    pub entry: LinuxEntry,
}

/// Platform inputs to [`prepare`].
#[derive(Default)]
pub struct PrepareInfo {
    pub video: Option<VideoMode>,
    /// EFI platform: prefer the handover entry when the kernel offers one.
    pub efi: bool,
}

/// Builds everything the kernel will see. Testable against an arena, like the native
/// loader's pipeline.
pub fn prepare<M: MemoryMapping>(
    state: &LinuxState,
    phys: &mut dyn PhysMemory,
    mapping: M,
    info: &PrepareInfo,
) -> FsResult<PreparedLinux> {
    let header = &state.header;
    let setup_size = header.setup_size();
    let prot_data = &state.kernel[setup_size..];

    // The kernel needs `init_size` bytes of room at its load address, not just the
    // file content.
    let prot_size = align_up(
        (prot_data.len() as u64).max(u64::from(u32::from_le(header.init_size))),
        PAGE_SIZE,
    );

    // Placement: preferred address first, then anywhere the alignment allows when
    // relocatable, else exactly the bzImage address.
    let kernel_phys = {
        let pref = match u64::from_le(header.pref_address) {
            0 => BZIMAGE_LOAD_ADDR,
            pref => pref,
        };
        let at_pref = phys.allocate(
            AllocRequest::new(prot_size, RangeType::Allocated)
                .window(pref, pref + prot_size - 1)
                .flags(AllocFlags::CAN_FAIL),
        );

        match at_pref {
            Some(addr) => addr,
            None if header.is_relocatable() => phys
                .allocate(
                    AllocRequest::new(prot_size, RangeType::Allocated)
                        .align(header.alignment())
                        .window(BZIMAGE_LOAD_ADDR, u64::MAX - 1)
                        .flags(AllocFlags::CAN_FAIL),
                )
                .ok_or(Status::NoMemory)?,
            None => return Err(Status::NoMemory),
        }
    };

    // SAFETY: the kernel region was just allocated.
    let out = unsafe { phys_slice_mut(mapping, kernel_phys, prot_size as usize) };
    out[..prot_data.len()].copy_from_slice(prot_data);
    out[prot_data.len()..].fill(0);

    // Real-mode area: setup code + zero page + command line, below 0x90000.
    let cmdline_len = align_up(state.cmdline.len() as u64 + 1, PAGE_SIZE);
    let real_size = align_up(setup_size as u64, PAGE_SIZE) + PAGE_SIZE + cmdline_len;
    let setup_base = phys
        .allocate(
            AllocRequest::new(real_size, RangeType::Allocated)
                .window(PAGE_SIZE, REAL_MODE_AREA_END - 1)
                .flags(AllocFlags::CAN_FAIL),
        )
        .ok_or(Status::NoMemory)?;
    let boot_params = PhyAddr::new(setup_base.as_u64() + align_up(setup_size as u64, PAGE_SIZE));
    let cmdline_phys = PhyAddr::new(boot_params.as_u64() + PAGE_SIZE);

    // Setup code, for the legacy entry path.
    {
        // SAFETY: inside the real-mode area allocated above.
        let out = unsafe { phys_slice_mut(mapping, setup_base, setup_size) };
        out.copy_from_slice(&state.kernel[..setup_size]);
    }

    // Command line.
    {
        // SAFETY: inside the real-mode area allocated above.
        let out = unsafe { phys_slice_mut(mapping, cmdline_phys, cmdline_len as usize) };
        out[..state.cmdline.len()].copy_from_slice(state.cmdline.as_bytes());
        out[state.cmdline.len()..].fill(0);
    }

    // Initial ramdisk, placed high but under the kernel's limit.
    let initrd = match &state.initrd {
        Some((_, data)) => {
            let size = align_up(data.len().max(1) as u64, PAGE_SIZE);
            let addr = phys
                .allocate(
                    AllocRequest::new(size, RangeType::Modules)
                        .window(BZIMAGE_LOAD_ADDR, header.initrd_limit())
                        .flags(AllocFlags::HIGH | AllocFlags::CAN_FAIL),
                )
                .ok_or(Status::NoMemory)?;

            // SAFETY: the initrd region was just allocated.
            let out = unsafe { phys_slice_mut(mapping, addr, size as usize) };
            out[..data.len()].copy_from_slice(data);
            out[data.len()..].fill(0);

            Some((addr, data.len() as u64))
        }
        None => None,
    };

    // Everything is placed: seal the map and build the zero page from it.
    let final_map = phys.finalize();

    // SAFETY: boot_params is a page inside the real-mode area.
    let zero_page = unsafe { phys_slice_mut(mapping, boot_params, PAGE_SIZE as usize) };
    zero_page.fill(0);

    let mut out_header = *header;
    out_header.type_of_loader = LOADER_TYPE_UNKNOWN;
    out_header.loadflags = (out_header.loadflags | CAN_USE_HEAP) & !0x60;
    out_header.code32_start = (kernel_phys.as_u64() as u32).to_le();
    out_header.cmd_line_ptr = (cmdline_phys.as_u64() as u32).to_le();
    out_header.heap_end_ptr = 0xFE00u16.to_le();
    if let Some((addr, size)) = initrd {
        out_header.ramdisk_image = (addr.as_u64() as u32).to_le();
        out_header.ramdisk_size = (size as u32).to_le();
    }

    let header_bytes = bytemuck::bytes_of(&out_header);
    zero_page[ZP_SETUP_HEADER..ZP_SETUP_HEADER + header_bytes.len()]
        .copy_from_slice(header_bytes);

    write_e820(zero_page, &final_map);

    if let Some(video) = &info.video {
        zero_page[ZP_VIDEO_ISVGA] = VIDEO_TYPE_VLFB;
        zero_page[ZP_LFB_WIDTH..ZP_LFB_WIDTH + 2]
            .copy_from_slice(&(video.width as u16).to_le_bytes());
        zero_page[ZP_LFB_HEIGHT..ZP_LFB_HEIGHT + 2]
            .copy_from_slice(&(video.height as u16).to_le_bytes());
        zero_page[ZP_LFB_DEPTH..ZP_LFB_DEPTH + 2]
            .copy_from_slice(&u16::from(video.bits_per_pixel).to_le_bytes());
        zero_page[ZP_LFB_BASE..ZP_LFB_BASE + 4]
            .copy_from_slice(&(video.framebuffer.as_u64() as u32).to_le_bytes());
        zero_page[ZP_LFB_LINELENGTH..ZP_LFB_LINELENGTH + 2]
            .copy_from_slice(&(video.pitch as u16).to_le_bytes());
        let lfb_size = u64::from(video.pitch) * u64::from(video.height);
        zero_page[ZP_LFB_SIZE..ZP_LFB_SIZE + 4]
            .copy_from_slice(&(lfb_size as u32).to_le_bytes());
    }

    // Entry selection: EFI handover when both sides support it, else legacy 16-bit.
    let xlf = u16::from_le(header.xloadflags);
    let handover = u64::from(u32::from_le(header.handover_offset));
    let entry = if info.efi && handover != 0 && xlf & XLF_EFI_HANDOVER_64 != 0 {
        LinuxEntry::EfiHandover {
            // The 64-bit handover entry sits 0x200 past the 32-bit one.
            entry: PhyAddr::new(kernel_phys.as_u64() + handover + 0x200),
        }
    } else {
        LinuxEntry::Legacy { setup_base }
    };

    Ok(PreparedLinux {
        kernel_phys,
        boot_params,
        cmdline_phys,
        initrd,
        entry,
    })
}

/// Serialises the final memory map into the zero page's E820 table, capped at
/// [`E820_MAX_ENTRIES`].
fn write_e820(zero_page: &mut [u8], map: &MemoryMap) {
    let mut count = 0usize;

    for range in map.ranges() {
        if count == E820_MAX_ENTRIES {
            warn!("linux", "memory map truncated to {E820_MAX_ENTRIES} e820 entries");
            break;
        }

        let entry = BootE820Entry {
            addr: range.start.as_u64().to_le(),
            size: range.size.to_le(),
            // The allocator map only describes RAM; everything in it is usable from
            // the kernel's point of view once the loader is gone.
            entry_type: E820_TYPE_RAM.to_le(),
        };

        let at = ZP_E820_TABLE + count * core::mem::size_of::<BootE820Entry>();
        zero_page[at..at + core::mem::size_of::<BootE820Entry>()]
            .copy_from_slice(bytemuck::bytes_of(&entry));
        count += 1;
    }

    zero_page[ZP_E820_ENTRIES] = count as u8;
}

/// The Linux [`LoaderOps`](crate::loader::LoaderOps).
pub struct LinuxLoader;

impl crate::loader::LoaderOps for LinuxLoader {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn load(&self, env: &mut Environment) -> ! {
        let binding = env.loader().expect("bound by linux_cmd");
        let state = binding.state::<LinuxState>().expect("state set by linux_cmd");

        let platform = crate::platform::get();
        let info = PrepareInfo {
            video: platform.video_mode(),
            efi: platform.efi_system_table().is_some(),
        };

        info!("linux", "loading {} ('{}')", state.path, state.cmdline);

        let prepared = crate::mem::phys::with_global(|phys| {
            prepare(state, phys, crate::mem::IdentityMapping, &info)
        });
        let prepared = match prepared {
            Some(Ok(prepared)) => prepared,
            Some(Err(err)) => boot_error!("failed to load {}: {err}", state.path),
            None => boot_error!("physical memory manager is not initialised"),
        };

        // SAFETY: the kernel and zero page are in place; this is the handoff.
        unsafe { crate::x86::interrupts_disable() };
        match prepared.entry {
            LinuxEntry::EfiHandover { entry } => {
                platform.linux_efi_handover(entry, prepared.boot_params)
            }
            LinuxEntry::Legacy { setup_base } => platform.linux_enter_real_mode(setup_base),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::parser::parse_str;
    use crate::config::{exec, Value};
    use crate::device::DeviceRegistry;
    use crate::fs::testfs::{self, TestTree};
    use crate::x86::paging::tests::PhysArena;

    /// Builds a minimal valid bzImage-style blob.
    pub(crate) fn fake_bzimage(version: u16, relocatable: bool) -> Vec<u8> {
        let mut image = alloc::vec![0u8; 0x6000];

        let mut header: SetupHeader = bytemuck::Zeroable::zeroed();
        header.setup_sects = 4;
        header.boot_flag = SETUP_BOOT_FLAG.to_le();
        header.header = SETUP_HDR_MAGIC.to_le();
        header.version = version.to_le();
        header.loadflags = LOADED_HIGH;
        header.kernel_alignment = 0x20_0000u32.to_le();
        header.relocatable_kernel = u8::from(relocatable);
        header.initrd_addr_max = 0x7FFF_FFFFu32.to_le();
        header.cmdline_size = 2047u32.to_le();
        header.pref_address = BZIMAGE_LOAD_ADDR.to_le();
        header.init_size = 0x4000u32.to_le();

        image[SETUP_HDR_OFFSET..SETUP_HDR_OFFSET + core::mem::size_of::<SetupHeader>()]
            .copy_from_slice(bytemuck::bytes_of(&header));

        // Recognisable protected-mode payload.
        let setup = header.setup_size();
        image[setup..setup + 8].copy_from_slice(b"PMKERNEL");
        image
    }

    fn env_with_images() -> (Environment, DeviceRegistry) {
        let mut bad_magic = fake_bzimage(0x020F, true);
        bad_magic[0x202] = b'X';

        let tree = TestTree::dir(&[(
            "hd0",
            TestTree::dir(&[
                ("vmlinuz", TestTree::file(&fake_bzimage(0x020F, true))),
                ("old", TestTree::file(&fake_bzimage(0x0200, true))),
                ("nosig", TestTree::file(&bad_magic)),
                ("initrd.img", TestTree::file(&[0x42; 0x800])),
            ]),
        )]);

        let mut registry = DeviceRegistry::new();
        let device = testfs::mount_tree(&mut registry, "lnxt0", tree, false);

        let mut env = Environment::new(None);
        env.set_device(&device);
        (env, registry)
    }

    #[test]
    fn header_validation_rejects_bad_images() {
        let (mut env, _registry) = env_with_images();

        let err = linux_cmd(
            &mut env,
            alloc::vec![Value::String("/hd0/nosig".into())],
        )
        .unwrap_err();
        assert!(err.message.contains("signature"));

        let err = linux_cmd(&mut env, alloc::vec![Value::String("/hd0/old".into())])
            .unwrap_err();
        assert!(err.message.contains("protocol"));

        assert!(env.loader().is_none());
    }

    #[test]
    fn config_scenario_binds_linux_with_substituted_cmdline() {
        let (mut env, _registry) = env_with_images();

        let cmds = parse_str(concat!(
            "set \"root\" \"hd0\"\n",
            "set \"n\" 3\n",
            "linux \"/${root}/vmlinuz\" \"quiet ${n}\"\n",
        ))
        .unwrap();
        exec::command_list_exec(&cmds, &mut env).unwrap();

        let binding = env.loader().expect("loader bound");
        assert_eq!(binding.ops.name(), "linux");

        let state = binding.state::<LinuxState>().unwrap();
        assert_eq!(state.cmdline, "quiet 3");
        assert_eq!(state.path, "/hd0/vmlinuz");
    }

    #[test]
    fn loader_sentinel_rejects_trailing_commands() {
        let (mut env, _registry) = env_with_images();

        let cmds = parse_str(concat!(
            "linux \"/hd0/vmlinuz\"\n",
            "set \"after\" 1\n",
        ))
        .unwrap();

        let err = exec::command_list_exec(&cmds, &mut env).unwrap_err();
        assert!(err.message.contains("loader"));
        assert!(env.loader().is_none(), "binding must be rolled back");
        assert_eq!(env.lookup("after"), None);
    }

    #[test]
    fn prepare_builds_a_coherent_zero_page() {
        let (mut env, _registry) = env_with_images();
        linux_cmd(
            &mut env,
            alloc::vec![
                Value::String("/hd0/vmlinuz".into()),
                Value::String("console=ttyS0 quiet".into()),
                Value::String("/hd0/initrd.img".into()),
            ],
        )
        .unwrap();
        let state = env.loader().unwrap().state::<LinuxState>().unwrap();

        // Arena covering low RAM including the conventional load address.
        let arena = PhysArena::new(0x1000, 0x200_0000);
        let mut phys = arena.allocator();

        let prepared = prepare(state, &mut phys, arena.mapping(), &PrepareInfo::default())
            .expect("prepare succeeds");

        assert_eq!(prepared.kernel_phys, PhyAddr::new(BZIMAGE_LOAD_ADDR));
        assert!(matches!(prepared.entry, LinuxEntry::Legacy { .. }));

        // The protected-mode payload landed at the load address.
        let kernel = unsafe { crate::mem::phys_slice(arena.mapping(), prepared.kernel_phys, 8) };
        assert_eq!(kernel, b"PMKERNEL");

        let zero_page = unsafe {
            crate::mem::phys_slice(arena.mapping(), prepared.boot_params, PAGE_SIZE as usize)
        };

        // Loader signature and updated header fields.
        let header: SetupHeader = bytemuck::pod_read_unaligned(
            &zero_page[ZP_SETUP_HEADER..ZP_SETUP_HEADER + core::mem::size_of::<SetupHeader>()],
        );
        assert_eq!(header.type_of_loader, LOADER_TYPE_UNKNOWN);
        assert_eq!(
            u64::from(u32::from_le(header.cmd_line_ptr)),
            prepared.cmdline_phys.as_u64()
        );
        let (initrd_addr, initrd_size) = prepared.initrd.unwrap();
        assert_eq!(u64::from(u32::from_le(header.ramdisk_image)), initrd_addr.as_u64());
        assert_eq!(u64::from(u32::from_le(header.ramdisk_size)), initrd_size);
        assert!(initrd_addr.as_u64() + initrd_size <= 0x7FFF_FFFF);

        // Command line is where the header says, NUL terminated.
        let cmdline = unsafe {
            crate::mem::phys_slice(arena.mapping(), prepared.cmdline_phys, 32)
        };
        assert_eq!(&cmdline[..20], b"console=ttyS0 quiet\0");

        // E820: at least one RAM entry, count matches the table.
        let count = zero_page[ZP_E820_ENTRIES] as usize;
        assert!(count >= 1);
        let first: BootE820Entry =
            bytemuck::pod_read_unaligned(&zero_page[ZP_E820_TABLE..ZP_E820_TABLE + 20]);
        assert_eq!(u32::from_le(first.entry_type), E820_TYPE_RAM);

        // The e820 total covers the whole arena.
        let mut total = 0u64;
        for i in 0..count {
            let at = ZP_E820_TABLE + i * 20;
            let entry: BootE820Entry =
                bytemuck::pod_read_unaligned(&zero_page[at..at + 20]);
            total += u64::from_le(entry.size);
        }
        assert_eq!(total, 0x200_0000);
    }

    #[test]
    fn efi_capable_kernels_use_the_handover_entry() {
        let mut image = fake_bzimage(0x020F, true);

        // Advertise a 64-bit handover entry at offset 0x100.
        let xlf_at = 0x236;
        image[xlf_at..xlf_at + 2]
            .copy_from_slice(&(XLF_KERNEL_64 | XLF_EFI_HANDOVER_64).to_le_bytes());
        image[0x264..0x268].copy_from_slice(&0x100u32.to_le_bytes());

        let tree = TestTree::dir(&[("vmlinuz", TestTree::file(&image))]);
        let mut registry = DeviceRegistry::new();
        let device = testfs::mount_tree(&mut registry, "lnxt1", tree, false);
        let mut env = Environment::new(None);
        env.set_device(&device);

        linux_cmd(&mut env, alloc::vec![Value::String("/vmlinuz".into())]).unwrap();
        let state = env.loader().unwrap().state::<LinuxState>().unwrap();

        let arena = PhysArena::new(0x1000, 0x200_0000);
        let mut phys = arena.allocator();
        let prepared = prepare(
            state,
            &mut phys,
            arena.mapping(),
            &PrepareInfo {
                video: None,
                efi: true,
            },
        )
        .unwrap();

        match prepared.entry {
            LinuxEntry::EfiHandover { entry } => {
                assert_eq!(
                    entry.as_u64(),
                    prepared.kernel_phys.as_u64() + 0x100 + 0x200
                );
            }
            LinuxEntry::Legacy { .. } => panic!("expected the EFI handover entry"),
        }
    }
}
