//! Native (KBoot) OS loader.
//!
//! The `kboot` command opens the kernel image, decodes its `"KBoot"` notes and binds
//! this loader. The load itself places the image under the constraints of its `LOAD`
//! tag, builds the kernel's initial page tables (image, extra `MAPPING` requests, the
//! full direct map and a recursive self-map), emits the information-tag list and
//! transfers through the trampoline. There is no rollback: once the memory map has
//! been touched, failure is a fatal boot error.

pub mod tags;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use tags::*;

use crate::config::{Environment, Value, ValueList};
use crate::errors::{ConfigError, FsResult, Status};
use crate::fs::{HandleKind, OpenFlags};
use crate::loader::elf::{ElfView, EM_X86_64};
use crate::loader::LoaderBinding;
use crate::mem::map::RangeType;
use crate::mem::phys::{AllocFlags, AllocRequest, PhysMemory};
use crate::mem::{phys_slice_mut, MemoryMapping, PhyAddr, VirtAddr, PAGE_SIZE};
use crate::platform::{SerialPort, VideoMode};
use crate::utils::{align_up, ranges_overlap};
use crate::x86::paging::{CacheMode, KernelPageTables};
use crate::x86::trampoline::{self, TrampolineArgs};

/// Architecture default physical alignment of the kernel image.
const DEFAULT_ALIGNMENT: u64 = 0x20_0000;
/// Architecture default lower bound when relaxing the alignment.
const DEFAULT_MIN_ALIGNMENT: u64 = 0x10_0000;

/// Architecture default virtual map window: the top 2 GiB.
const DEFAULT_VIRT_MAP_BASE: u64 = 0xFFFF_FFFF_8000_0000;
const DEFAULT_VIRT_MAP_SIZE: u64 = 0x8000_0000;

/// Conventional base of the all-of-RAM direct map.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

const KERNEL_STACK_SIZE: u64 = 0x4000;

/// State built by the `kboot` command and consumed by the load.
pub struct KbootState {
    pub path: String,
    image: Vec<u8>,
    itags: ImageTags,
    /// Option values resolved against the environment at command time, already
    /// encoded for their `OPTION` tags.
    option_values: Vec<(OptionSpec, Vec<u8>)>,
    modules: Vec<(String, Vec<u8>)>,
    bootdev_uuid: Option<String>,
}

/// The `kboot` command: validate the image, bind the loader. Does not load.
pub fn kboot_cmd(env: &mut Environment, args: ValueList) -> Result<(), ConfigError> {
    let path = crate::loader::arg_string(&args, 0, "kernel image path")?;

    let handle = crate::config::exec::open_flags_checked(
        env,
        &path,
        Some(HandleKind::Regular),
        OpenFlags::DECOMPRESS,
    )?;
    let image = crate::fs::read_whole(&handle)
        .map_err(|e| ConfigError::new(alloc::format!("{path}: {e}"), 0, 0))?;

    let elf = match ElfView::parse(&image) {
        Ok(elf) => elf,
        Err(Status::NotSupported) => {
            config_error!("{path}: 32-bit kernels are not supported on this platform")
        }
        Err(_) => config_error!("{path}: not a valid ELF image"),
    };

    if elf.machine() != EM_X86_64 || !elf.is_executable() {
        config_error!("{path}: image does not target this machine");
    }
    if !crate::x86::has_long_mode() {
        config_error!("{path}: 64-bit kernel requires a long-mode capable CPU");
    }

    let notes = elf
        .notes(KBOOT_NOTE_NAME)
        .map_err(|_| ConfigError::new(alloc::format!("{path}: malformed note segment"), 0, 0))?;
    let itags = match parse_image_tags(&notes) {
        Ok(itags) => itags,
        Err(Status::NotSupported) => {
            config_error!("{path}: image speaks an unsupported protocol version")
        }
        Err(_) => config_error!("{path}: image carries no valid KBoot tags"),
    };

    let option_values = resolve_options(&itags, env)?;

    // Modules come from an optional second argument, falling back to the `modules`
    // environment list.
    let module_list = args.get(1).cloned().or_else(|| env.lookup("modules").cloned());
    let mut modules = Vec::new();
    if let Some(value) = &module_list {
        let Value::List(paths) = value else {
            config_error!("kboot: modules argument must be a list");
        };
        for entry in paths {
            let Value::String(mod_path) = entry else {
                config_error!("kboot: module paths must be strings");
            };
            let handle = crate::config::exec::open_flags_checked(
                env,
                mod_path,
                Some(HandleKind::Regular),
                OpenFlags::DECOMPRESS,
            )?;
            let data = crate::fs::read_whole(&handle)
                .map_err(|e| ConfigError::new(alloc::format!("{mod_path}: {e}"), 0, 0))?;

            let name = mod_path.rsplit('/').next().unwrap_or(mod_path);
            modules.push((String::from(name), data));
        }
    }

    let bootdev_uuid = env
        .device()
        .and_then(|dev| dev.mount())
        .and_then(|mount| mount.uuid.clone());

    env.bind_loader(LoaderBinding::new(
        &KbootLoader,
        Box::new(KbootState {
            path,
            image,
            itags,
            option_values,
            modules,
            bootdev_uuid,
        }),
    ));
    Ok(())
}

/// Resolves every image `OPTION` against the environment, falling back to the
/// embedded default, and encodes the value for the information tag.
fn resolve_options(
    itags: &ImageTags,
    env: &Environment,
) -> Result<Vec<(OptionSpec, Vec<u8>)>, ConfigError> {
    let mut resolved = Vec::new();

    for spec in &itags.options {
        let encoded = match (env.lookup(&spec.name), spec.option_type) {
            (Some(Value::Boolean(b)), OPTION_TYPE_BOOLEAN) => alloc::vec![u8::from(*b)],
            (Some(Value::Integer(i)), OPTION_TYPE_INTEGER) => i.to_le_bytes().to_vec(),
            (Some(Value::String(s)), OPTION_TYPE_STRING) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                bytes
            }
            (Some(other), _) => {
                config_error!(
                    "option '{}' has the wrong type ({})",
                    spec.name,
                    other.type_name()
                )
            }
            (None, _) => spec.default.clone(),
        };
        resolved.push((spec.clone(), encoded));
    }

    Ok(resolved)
}

/// Platform-dependent inputs to [`prepare`], collected by the loader before the
/// memory map is disturbed.
#[derive(Default)]
pub struct PrepareInfo<'a> {
    pub use_gbyte_pages: bool,
    pub video: Option<VideoMode>,
    pub serial: Option<SerialPort>,
    pub efi_system_table: Option<PhyAddr>,
    pub bios_e820: Option<&'a [u8]>,
}

/// Everything the trampoline needs, plus what tests verify.
pub struct PreparedKboot {
    pub entry: VirtAddr,
    pub kernel_phys: PhyAddr,
    pub pml4: PhyAddr,
    pub trampoline_pml4: PhyAddr,
    pub trampoline_phys: PhyAddr,
    pub trampoline_virt: VirtAddr,
    pub sp: VirtAddr,
    pub tags_phys: PhyAddr,
    pub tags_virt: VirtAddr,
    pub tags_size: usize,
}

/// First-fit allocator over the virtual map window.
struct VirtWindow {
    base: u64,
    size: u64,
    used: Vec<(u64, u64)>,
}

impl VirtWindow {
    fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            used: Vec::new(),
        }
    }

    fn reserve(&mut self, start: u64, size: u64) {
        if ranges_overlap(start, size, self.base, self.size) {
            self.used.push((start, size));
        }
    }

    fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let mut candidate = align_up(self.base, align);

        'outer: loop {
            if candidate + size > self.base + self.size {
                return None;
            }
            for &(start, used_size) in &self.used {
                if ranges_overlap(candidate, size, start, used_size) {
                    candidate = align_up(start + used_size, align);
                    continue 'outer;
                }
            }
            self.used.push((candidate, size));
            return Some(candidate);
        }
    }
}

/// Steps 1-6 of the load pipeline: everything except the jump. Works purely through
/// the allocator and the physical-memory mapping.
pub fn prepare<M: MemoryMapping>(
    state: &KbootState,
    phys: &mut dyn PhysMemory,
    mapping: M,
    info: &PrepareInfo,
) -> FsResult<PreparedKboot> {
    let elf = ElfView::parse(&state.image)?;
    let load = &state.itags.load;

    // Apply the architecture defaults where the LOAD tag is silent.
    let alignment = match u64::from_le(load.alignment) {
        0 => DEFAULT_ALIGNMENT,
        a => a,
    };
    let min_alignment = match u64::from_le(load.min_alignment) {
        0 => alignment.min(DEFAULT_MIN_ALIGNMENT),
        a => a,
    };
    let (virt_base, virt_size) =
        match (u64::from_le(load.virt_map_base), u64::from_le(load.virt_map_size)) {
            (0, 0) => (DEFAULT_VIRT_MAP_BASE, DEFAULT_VIRT_MAP_SIZE),
            (base, size) => (base, size),
        };

    // Image extent across the loadable segments.
    let loads: Vec<_> = elf
        .program_headers()?
        .into_iter()
        .filter(|p| {
            u32::from_le(p.seg_type) == crate::loader::elf::PT_LOAD && u64::from_le(p.mem_size) > 0
        })
        .collect();
    if loads.is_empty() {
        return Err(Status::InvalidArg);
    }

    let base_vaddr = loads
        .iter()
        .map(|p| u64::from_le(p.virt_addr))
        .min()
        .unwrap_or(0)
        & !(PAGE_SIZE - 1);
    let end_vaddr = loads
        .iter()
        .map(|p| u64::from_le(p.virt_addr) + u64::from_le(p.mem_size))
        .max()
        .unwrap_or(0);
    let image_size = align_up(end_vaddr - base_vaddr, PAGE_SIZE);

    // Step 3: physical placement, relaxing the alignment under pressure.
    let kernel_phys = if u32::from_le(load.flags) & LOAD_FLAG_FIXED != 0 {
        let base = u64::from_le(load.phys_base);
        phys.allocate(
            AllocRequest::new(image_size, RangeType::Allocated)
                .window(base, base + image_size - 1)
                .flags(AllocFlags::CAN_FAIL),
        )
        .ok_or(Status::NoMemory)?
    } else {
        let mut align = alignment;
        loop {
            if let Some(addr) = phys.allocate(
                AllocRequest::new(image_size, RangeType::Allocated)
                    .align(align)
                    .flags(AllocFlags::CAN_FAIL),
            ) {
                break addr;
            }
            if align <= min_alignment {
                return Err(Status::NoMemory);
            }
            align /= 2;
        }
    };

    // Place the segments, zeroing the BSS tails.
    for phdr in &loads {
        let vaddr = u64::from_le(phdr.virt_addr);
        let mem_size = u64::from_le(phdr.mem_size) as usize;
        let dest = PhyAddr::new(kernel_phys.as_u64() + (vaddr - base_vaddr));
        let file_data = elf.segment_data(phdr)?;
        if file_data.len() > mem_size {
            return Err(Status::InvalidArg);
        }

        // SAFETY: dest lies inside the region just allocated for the image.
        let out = unsafe { phys_slice_mut(mapping, dest, mem_size) };
        out[..file_data.len()].copy_from_slice(file_data);
        out[file_data.len()..].fill(0);
    }

    // Step 4: kernel page tables.
    let mut tables = KernelPageTables::new(phys, mapping, info.use_gbyte_pages);
    let mut window = VirtWindow::new(virt_base, virt_size);
    let mut vmem: Vec<TagVmem> = Vec::new();

    tables.map(
        phys,
        VirtAddr::new(base_vaddr),
        kernel_phys,
        image_size,
        CacheMode::WriteBack,
    );
    window.reserve(base_vaddr, image_size);
    vmem.push(TagVmem {
        start: base_vaddr.to_le(),
        size: image_size.to_le(),
        phys: kernel_phys.as_u64().to_le(),
        cache: CACHE_DEFAULT as u8,
        _pad: [0; 7],
    });

    // Explicit MAPPING requests first, then the "pick any" ones from the window.
    for m in &state.itags.mappings {
        let size = u64::from_le(m.size);
        let cache = match u32::from_le(m.cache) {
            CACHE_WRITE_THROUGH => CacheMode::WriteThrough,
            CACHE_UNCACHED => CacheMode::Uncached,
            _ => CacheMode::WriteBack,
        };

        let virt = if u64::from_le(m.virt) == MAPPING_VIRT_ANY {
            window.alloc(size, PAGE_SIZE).ok_or(Status::NoMemory)?
        } else {
            let v = u64::from_le(m.virt);
            window.reserve(v, size);
            v
        };

        tables.map(
            phys,
            VirtAddr::new(virt),
            PhyAddr::new(u64::from_le(m.phys)),
            size,
            cache,
        );
        vmem.push(TagVmem {
            start: virt.to_le(),
            size: size.to_le(),
            phys: m.phys,
            cache: u32::from_le(m.cache) as u8,
            _pad: [0; 7],
        });
    }

    // Direct map of all physical memory at the conventional base.
    let ram_top = phys
        .snapshot()
        .ranges()
        .last()
        .map(|r| r.end())
        .unwrap_or(0);
    let direct_size = align_up(ram_top, crate::x86::paging::SIZE_2M);
    tables.map(
        phys,
        VirtAddr::new(DIRECT_MAP_BASE),
        PhyAddr::new(0),
        direct_size,
        CacheMode::WriteBack,
    );
    vmem.push(TagVmem {
        start: DIRECT_MAP_BASE.to_le(),
        size: direct_size.to_le(),
        phys: 0,
        cache: CACHE_DEFAULT as u8,
        _pad: [0; 7],
    });

    // Step 5: stack.
    let stack_phys = phys
        .allocate(
            AllocRequest::new(KERNEL_STACK_SIZE, RangeType::Stack).flags(AllocFlags::CAN_FAIL),
        )
        .ok_or(Status::NoMemory)?;
    let stack_virt = window
        .alloc(KERNEL_STACK_SIZE, PAGE_SIZE)
        .ok_or(Status::NoMemory)?;
    tables.map(
        phys,
        VirtAddr::new(stack_virt),
        stack_phys,
        KERNEL_STACK_SIZE,
        CacheMode::WriteBack,
    );
    let sp = VirtAddr::new(stack_virt + KERNEL_STACK_SIZE);

    // Trampoline page, visible in every involved address space.
    let trampoline_phys = phys
        .allocate(AllocRequest::new(PAGE_SIZE, RangeType::Pagetables).flags(AllocFlags::CAN_FAIL))
        .ok_or(Status::NoMemory)?;
    let trampoline_virt = window.alloc(PAGE_SIZE, PAGE_SIZE).ok_or(Status::NoMemory)?;
    tables.map(
        phys,
        VirtAddr::new(trampoline_virt),
        trampoline_phys,
        PAGE_SIZE,
        CacheMode::WriteBack,
    );

    let mut trampoline_tables = KernelPageTables::new(phys, mapping, false);
    trampoline_tables.map(
        phys,
        VirtAddr::from_raw(trampoline_phys.as_u64()),
        trampoline_phys,
        PAGE_SIZE,
        CacheMode::WriteBack,
    );
    trampoline_tables.map(
        phys,
        VirtAddr::new(trampoline_virt),
        trampoline_phys,
        PAGE_SIZE,
        CacheMode::WriteBack,
    );

    // Step 6: recursive self-map, outside the window and the direct map.
    let avoid = [
        (virt_base, virt_size),
        (DIRECT_MAP_BASE, direct_size.max(1 << 39)),
    ];
    let (_, self_map_base) = tables.install_self_map(&avoid).ok_or(Status::NoMemory)?;

    // Modules.
    let mut module_tags: Vec<(TagModule, Vec<u8>)> = Vec::new();
    for (name, data) in &state.modules {
        let size = align_up(data.len().max(1) as u64, PAGE_SIZE);
        let addr = phys
            .allocate(
                AllocRequest::new(size, RangeType::Modules).flags(AllocFlags::CAN_FAIL),
            )
            .ok_or(Status::NoMemory)?;

        // SAFETY: freshly allocated module region.
        let out = unsafe { phys_slice_mut(mapping, addr, size as usize) };
        out[..data.len()].copy_from_slice(data);
        out[data.len()..].fill(0);

        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.push(0);
        module_tags.push((
            TagModule {
                addr: addr.as_u64().to_le(),
                size: (data.len() as u32).to_le(),
                name_size: (name_bytes.len() as u32).to_le(),
            },
            name_bytes,
        ));
    }

    // Boot log buffer, when the image asked for it.
    let image_flags = u32::from_le(state.itags.image.flags);
    let log = if image_flags & IMAGE_FLAG_LOG != 0 {
        let log_size = crate::io::log::BOOT_LOG_SIZE as u64;
        let log_phys = phys
            .allocate(
                AllocRequest::new(align_up(log_size, PAGE_SIZE), RangeType::Allocated)
                    .flags(AllocFlags::CAN_FAIL),
            )
            .ok_or(Status::NoMemory)?;

        // SAFETY: freshly allocated log region.
        let out = unsafe { phys_slice_mut(mapping, log_phys, log_size as usize) };
        let copied = crate::io::log::boot_log_snapshot(out);
        Some((log_phys, copied))
    } else {
        None
    };

    // Kernel section headers, when the image asked for them.
    let sections = if image_flags & IMAGE_FLAG_SECTIONS != 0 {
        let headers = elf.section_headers()?;
        let mut raw = Vec::with_capacity(headers.len() * 64);
        for h in &headers {
            raw.extend_from_slice(bytemuck::bytes_of(h));
        }
        Some((headers.len() as u32, raw))
    } else {
        None
    };

    // Tag area, generously sized from what will be written.
    let mut estimate = 1024usize;
    estimate += vmem.len() * 48;
    estimate += (phys.snapshot().ranges().len() + 8) * 40;
    estimate += state
        .option_values
        .iter()
        .map(|(spec, value)| 32 + spec.name.len() + value.len())
        .sum::<usize>();
    estimate += module_tags
        .iter()
        .map(|(_, name)| 24 + name.len())
        .sum::<usize>();
    estimate += sections.as_ref().map_or(0, |(_, raw)| 24 + raw.len());
    estimate += info.bios_e820.map_or(0, |raw| 24 + raw.len());

    let tags_area = align_up(estimate as u64, PAGE_SIZE);
    let tags_phys = phys
        .allocate(AllocRequest::new(tags_area, RangeType::Reclaimable).flags(AllocFlags::CAN_FAIL))
        .ok_or(Status::NoMemory)?;
    let tags_virt = VirtAddr::new(DIRECT_MAP_BASE + tags_phys.as_u64());

    // Every allocation is done: seal the memory map.
    let final_map = phys.finalize();

    // SAFETY: the tag area was allocated above and stays untouched by anyone else.
    let tag_buf = unsafe { phys_slice_mut(mapping, tags_phys, tags_area as usize) };
    let mut writer = TagWriter::new(tag_buf);

    let core_offset = writer.push(TAG_CORE, &TagCore::default(), &[])?;

    for entry in &vmem {
        writer.push(TAG_VMEM, entry, &[])?;
    }

    writer.push(
        TAG_PAGETABLES,
        &TagPagetables {
            pml4: tables.pml4().as_u64().to_le(),
            mapping: self_map_base.as_u64().to_le(),
        },
        &[],
    )?;

    for (spec, value) in &state.option_values {
        let mut name_bytes = spec.name.as_bytes().to_vec();
        name_bytes.push(0);
        let mut payload = name_bytes;
        payload.extend_from_slice(value);

        writer.push(
            TAG_OPTION,
            &TagOption {
                option_type: spec.option_type,
                _pad: [0; 3],
                name_size: ((spec.name.len() + 1) as u32).to_le(),
                value_size: (value.len() as u32).to_le(),
                _pad2: 0,
            },
            &payload,
        )?;
    }

    for (tag, name) in &module_tags {
        writer.push(TAG_MODULE, tag, name)?;
    }

    let mut bootdev = TagBootdev {
        bootdev_type: BOOTDEV_NONE.to_le(),
        _pad: 0,
        uuid: [0; 64],
    };
    if let Some(uuid) = &state.bootdev_uuid {
        bootdev.bootdev_type = BOOTDEV_FS.to_le();
        let len = uuid.len().min(63);
        bootdev.uuid[..len].copy_from_slice(&uuid.as_bytes()[..len]);
    }
    writer.push(TAG_BOOTDEV, &bootdev, &[])?;

    if let Some(video) = &info.video {
        writer.push(
            TAG_VIDEO,
            &TagVideo {
                video_type: VIDEO_TYPE_LFB.to_le(),
                width: video.width.to_le(),
                height: video.height.to_le(),
                bpp: video.bits_per_pixel,
                _pad: [0; 3],
                framebuffer: video.framebuffer.as_u64().to_le(),
                pitch: video.pitch.to_le(),
                _pad2: 0,
            },
            &[],
        )?;
    }

    if let Some(serial) = &info.serial {
        writer.push(
            TAG_SERIAL,
            &TagSerial {
                addr: serial.addr.to_le(),
                mmio: u8::from(serial.mmio),
                _pad: [0; 3],
                baud_rate: serial.baud_rate.to_le(),
            },
            &[],
        )?;
    }

    if let Some((log_phys, log_len)) = log {
        writer.push(
            TAG_LOG,
            &TagLog {
                log_virt: (DIRECT_MAP_BASE + log_phys.as_u64()).to_le(),
                log_phys: log_phys.as_u64().to_le(),
                log_size: (log_len as u32).to_le(),
                _pad: 0,
            },
            &[],
        )?;
    }

    if let Some((num, raw)) = &sections {
        writer.push(
            TAG_SECTIONS,
            &TagSections {
                num: num.to_le(),
                entry_size: (core::mem::size_of::<crate::loader::elf::ElfSectionHeader64>() as u32)
                    .to_le(),
                shstrndx: u32::from(u16::from_le(elf.header().shstrndx)).to_le(),
                _pad: 0,
            },
            raw,
        )?;
    }

    if let Some(raw) = info.bios_e820 {
        writer.push(
            TAG_BIOS_E820,
            &TagBiosE820 {
                num_entries: ((raw.len() / 20) as u32).to_le(),
                entry_size: 20u32.to_le(),
            },
            raw,
        )?;
    }

    if let Some(system_table) = info.efi_system_table {
        writer.push(
            TAG_EFI,
            &TagEfi {
                system_table: system_table.as_u64().to_le(),
            },
            &[],
        )?;
    }

    // One MEMORY tag per final map range. Internal ranges were demoted by finalize.
    for range in final_map.ranges() {
        writer.push(
            TAG_MEMORY,
            &TagMemory {
                start: range.start.as_u64().to_le(),
                size: range.size.to_le(),
                memory_type: range.range_type.tag_encoding(),
                _pad: [0; 7],
            },
            &[],
        )?;
    }

    let tags_size = writer.finish()?;

    // Patch CORE now that the totals are known.
    let tag_buf = unsafe { phys_slice_mut(mapping, tags_phys, tags_area as usize) };
    let mut writer = TagWriter::new(tag_buf);
    writer.patch(
        core_offset,
        &TagCore {
            tags_phys: tags_phys.as_u64().to_le(),
            tags_size: (tags_size as u32).to_le(),
            _pad: 0,
            kernel_phys: kernel_phys.as_u64().to_le(),
            stack_base: stack_virt.to_le(),
            stack_phys: stack_phys.as_u64().to_le(),
            stack_size: (KERNEL_STACK_SIZE as u32).to_le(),
            _pad2: 0,
        },
    );

    // Step 7 setup: the argument block and code go into the scratch page.
    trampoline::install(
        mapping,
        trampoline_phys,
        &TrampolineArgs {
            trampoline_cr3: trampoline_tables.pml4().as_u64(),
            trampoline_virt,
            kernel_cr3: tables.pml4().as_u64(),
            sp: sp.as_u64(),
            entry: elf.entry(),
            tags: tags_virt.as_u64(),
        },
    );

    Ok(PreparedKboot {
        entry: VirtAddr::new(elf.entry()),
        kernel_phys,
        pml4: tables.pml4(),
        trampoline_pml4: trampoline_tables.pml4(),
        trampoline_phys,
        trampoline_virt: VirtAddr::new(trampoline_virt),
        sp,
        tags_phys,
        tags_virt,
        tags_size,
    })
}

/// The KBoot [`LoaderOps`](crate::loader::LoaderOps).
pub struct KbootLoader;

impl crate::loader::LoaderOps for KbootLoader {
    fn name(&self) -> &'static str {
        "kboot"
    }

    fn load(&self, env: &mut Environment) -> ! {
        let binding = env.loader().expect("bound by kboot_cmd");
        let state = binding.state::<KbootState>().expect("state set by kboot_cmd");

        let platform = crate::platform::get();
        let e820 = platform.bios_e820();
        let info = PrepareInfo {
            use_gbyte_pages: crate::x86::has_gbyte_pages(),
            video: platform.video_mode(),
            serial: platform.serial_port(),
            efi_system_table: platform.efi_system_table(),
            bios_e820: e820.as_deref(),
        };

        info!("kboot", "loading {}", state.path);

        let prepared = crate::mem::phys::with_global(|phys| {
            prepare(state, phys, crate::mem::IdentityMapping, &info)
        });
        let prepared = match prepared {
            Some(Ok(prepared)) => prepared,
            Some(Err(err)) => boot_error!("failed to load {}: {err}", state.path),
            None => boot_error!("physical memory manager is not initialised"),
        };

        info!(
            "kboot",
            "entering kernel at {} (tags {})", prepared.entry, prepared.tags_virt
        );

        // SAFETY: prepared by the pipeline above; this is the point of no return.
        unsafe {
            crate::x86::interrupts_disable();
            trampoline::enter(prepared.trampoline_phys)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRegistry;
    use crate::fs::testfs::{self, TestTree};
    use crate::loader::elf::tests::build_elf;
    use crate::x86::paging::tests::PhysArena;

    fn image_note() -> (&'static str, u32, Vec<u8>) {
        (
            KBOOT_NOTE_NAME,
            ITAG_IMAGE,
            bytemuck::bytes_of(&ItagImage {
                version: KBOOT_VERSION.to_le(),
                flags: IMAGE_FLAG_LOG.to_le(),
            })
            .to_vec(),
        )
    }

    fn test_kernel() -> Vec<u8> {
        build_elf(
            0xFFFF_FFFF_8000_0000,
            EM_X86_64,
            &[(0xFFFF_FFFF_8000_0000, b"\x90\x90\x90\x90kernel", 0x2000)],
            &[image_note()],
        )
    }

    fn state_for(image: Vec<u8>) -> KbootState {
        let elf = ElfView::parse(&image).unwrap();
        let notes = elf.notes(KBOOT_NOTE_NAME).unwrap();
        let itags = parse_image_tags(&notes).unwrap();
        drop(elf);

        KbootState {
            path: String::from("/kernel"),
            image,
            itags,
            option_values: Vec::new(),
            modules: alloc::vec![(String::from("initrd"), alloc::vec![0xAB; 100])],
            bootdev_uuid: Some(String::from("0000-4242")),
        }
    }

    #[test]
    fn command_rejects_bad_images() {
        let tree = TestTree::dir(&[
            ("noelf", TestTree::file(b"MZ not an elf at all.......")),
            (
                "nonote",
                TestTree::file(&build_elf(0x1000, EM_X86_64, &[(0x1000, b"x", 0x1000)], &[])),
            ),
            (
                "oldver",
                TestTree::file(&build_elf(
                    0x1000,
                    EM_X86_64,
                    &[(0x1000, b"x", 0x1000)],
                    &[(
                        KBOOT_NOTE_NAME,
                        ITAG_IMAGE,
                        bytemuck::bytes_of(&ItagImage {
                            version: 1u32.to_le(),
                            flags: 0,
                        })
                        .to_vec(),
                    )],
                )),
            ),
            ("kernel", TestTree::file(&test_kernel())),
        ]);

        let mut registry = DeviceRegistry::new();
        let device = testfs::mount_tree(&mut registry, "kbt0", tree, false);

        let mut env = Environment::new(None);
        env.set_device(&device);

        let run = |env: &mut Environment, path: &str| {
            kboot_cmd(env, alloc::vec![Value::String(String::from(path))])
        };

        assert!(run(&mut env, "/noelf").is_err());
        assert!(run(&mut env, "/nonote").is_err());
        assert!(run(&mut env, "/oldver")
            .unwrap_err()
            .message
            .contains("protocol version"));

        run(&mut env, "/kernel").unwrap();
        let binding = env.loader().unwrap();
        assert_eq!(binding.ops.name(), "kboot");
        assert!(binding.state::<KbootState>().is_some());
    }

    #[test]
    fn modules_come_from_the_environment_list() {
        let tree = TestTree::dir(&[
            ("kernel", TestTree::file(&test_kernel())),
            ("initrd.img", TestTree::file(&[0xCD; 64])),
        ]);
        let mut registry = DeviceRegistry::new();
        let device = testfs::mount_tree(&mut registry, "kbt1", tree, false);

        let mut env = Environment::new(None);
        env.set_device(&device);
        env.set(
            "modules",
            Value::List(alloc::vec![Value::String(String::from("/initrd.img"))]),
        )
        .unwrap();

        kboot_cmd(&mut env, alloc::vec![Value::String(String::from("/kernel"))]).unwrap();

        let state = env.loader().unwrap().state::<KbootState>().unwrap();
        assert_eq!(state.modules.len(), 1);
        assert_eq!(state.modules[0].0, "initrd.img");
        assert_eq!(state.modules[0].1.len(), 64);
    }

    #[test]
    fn prepared_tag_list_is_well_formed() {
        let arena = PhysArena::new(0x10_0000, 0x100_0000);
        let mut phys = arena.allocator();
        let state = state_for(test_kernel());

        let prepared = prepare(&state, &mut phys, arena.mapping(), &PrepareInfo::default())
            .expect("prepare succeeds");

        // Walk the emitted list through the same mapping the kernel would use.
        let buf =
            unsafe { crate::mem::phys_slice(arena.mapping(), prepared.tags_phys, prepared.tags_size) };
        let tags: Vec<(u32, &[u8])> = TagIter::new(buf).collect();

        // Exactly one CORE, first in the list; a NONE terminator last.
        assert_eq!(tags.first().map(|(t, _)| *t), Some(TAG_CORE));
        assert_eq!(tags.iter().filter(|(t, _)| *t == TAG_CORE).count(), 1);
        assert_eq!(tags.last().map(|(t, _)| *t), Some(TAG_NONE));

        // At least one MEMORY range, and their sizes sum to all usable RAM.
        let memory_total: u64 = tags
            .iter()
            .filter(|(t, _)| *t == TAG_MEMORY)
            .map(|(_, payload)| {
                let tag: TagMemory = bytemuck::pod_read_unaligned(&payload[..24]);
                u64::from_le(tag.size)
            })
            .sum();
        assert!(tags.iter().any(|(t, _)| *t == TAG_MEMORY));
        assert_eq!(memory_total, 0x100_0000, "memory tags must cover all RAM");

        // One BOOTDEV describing the boot filesystem.
        let bootdevs: Vec<_> = tags.iter().filter(|(t, _)| *t == TAG_BOOTDEV).collect();
        assert_eq!(bootdevs.len(), 1);
        let bootdev: TagBootdev = bytemuck::pod_read_unaligned(bootdevs[0].1);
        assert_eq!(u32::from_le(bootdev.bootdev_type), BOOTDEV_FS);
        assert_eq!(&bootdev.uuid[..9], b"0000-4242");

        // CORE cross-checks.
        let core: TagCore = bytemuck::pod_read_unaligned(tags[0].1);
        assert_eq!(u64::from_le(core.tags_phys), prepared.tags_phys.as_u64());
        assert_eq!(u32::from_le(core.tags_size) as usize, prepared.tags_size);
        assert_eq!(u64::from_le(core.kernel_phys), prepared.kernel_phys.as_u64());

        // The image asked for the boot log.
        assert!(tags.iter().any(|(t, _)| *t == TAG_LOG));

        // Module made it out with its name.
        let (_, module_payload) = tags
            .iter()
            .find(|(t, _)| *t == TAG_MODULE)
            .expect("module tag present");
        assert_eq!(&module_payload[16..23], b"initrd\0");
    }

    #[test]
    fn kernel_mappings_resolve_through_the_built_tables() {
        let arena = PhysArena::new(0x10_0000, 0x100_0000);
        let mut phys = arena.allocator();
        let state = state_for(test_kernel());

        let prepared =
            prepare(&state, &mut phys, arena.mapping(), &PrepareInfo::default()).unwrap();

        // The image bytes landed at the allocated physical base.
        let image = unsafe {
            crate::mem::phys_slice(arena.mapping(), prepared.kernel_phys, 10)
        };
        assert_eq!(&image[4..10], b"kernel");

        // The trampoline page carries the argument block pointing at both roots.
        let page = unsafe {
            crate::mem::phys_slice(
                arena.mapping(),
                prepared.trampoline_phys,
                PAGE_SIZE as usize,
            )
        };
        assert_eq!(
            &page[0..8],
            &prepared.trampoline_pml4.as_u64().to_le_bytes()
        );
        assert_eq!(&page[16..24], &prepared.pml4.as_u64().to_le_bytes());
        assert_eq!(&page[32..40], &prepared.entry.as_u64().to_le_bytes());
    }

    #[test]
    fn fixed_base_images_load_at_their_address() {
        // A LOAD note demanding a fixed physical base.
        let load = ItagLoad {
            flags: LOAD_FLAG_FIXED.to_le(),
            _pad: 0,
            alignment: 0,
            min_alignment: 0,
            phys_base: 0x80_0000u64.to_le(),
            virt_map_base: 0,
            virt_map_size: 0,
        };
        let image = build_elf(
            0xFFFF_FFFF_8000_0000,
            EM_X86_64,
            &[(0xFFFF_FFFF_8000_0000, b"fixed", 0x2000)],
            &[
                image_note(),
                (KBOOT_NOTE_NAME, ITAG_LOAD, bytemuck::bytes_of(&load).to_vec()),
            ],
        );

        let arena = PhysArena::new(0x10_0000, 0x100_0000);
        let mut phys = arena.allocator();
        let mut state = state_for(image);
        state.modules.clear();

        let prepared =
            prepare(&state, &mut phys, arena.mapping(), &PrepareInfo::default()).unwrap();
        assert_eq!(prepared.kernel_phys, PhyAddr::new(0x80_0000));
    }
}
