//! Platform contract and top-level boot flow.
//!
//! Concrete firmware support (BIOS, UEFI, U-Boot, board packages) lives outside the
//! core: a platform crate implements [`Platform`], registers its console and devices,
//! seeds one of the physical allocators, then hands control to [`loader_main`].

use alloc::string::String;
use alloc::vec::Vec;

use conquer_once::spin::OnceCell;

use crate::config::{exec, parser, Environment};
use crate::errors::Status;
use crate::fs::{HandleKind, OpenFlags};
use crate::mem::phys::FirmwareMemoryServices;
use crate::mem::PhyAddr;

/// Current video mode, as reported to kernels through the boot protocols.
#[derive(Clone, Copy, Debug)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u8,
    /// Physical address of the linear framebuffer; null for text modes.
    pub framebuffer: PhyAddr,
    pub pitch: u32,
}

/// Serial console description handed to the OS.
#[derive(Clone, Copy, Debug)]
pub struct SerialPort {
    /// Register block address: an I/O port or an MMIO address, per `mmio`.
    pub addr: u64,
    pub mmio: bool,
    pub baud_rate: u32,
}

/// Services a platform must provide to the core.
pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Milliseconds since an arbitrary epoch, for timeouts and countdowns.
    fn current_time_ms(&self) -> u64;

    /// CPU relaxation hint used inside spin loops.
    fn pause(&self) {
        core::hint::spin_loop();
    }

    fn halt(&self) -> !;

    fn reboot(&self) -> !;

    /// Exits back to the firmware, where that concept exists; otherwise halts.
    fn exit(&self) -> !;

    /// Lowest and highest addressable physical byte.
    fn phys_bounds(&self) -> (u64, u64);

    /// Firmware memory services, when the firmware still owns the memory map.
    fn firmware_memory(&self) -> Option<&dyn FirmwareMemoryServices> {
        None
    }

    /// The device holding the configuration, usually the one the loader was read
    /// from.
    fn boot_device(&self) -> Option<String> {
        None
    }

    /// Configuration file search order on the boot device.
    fn config_paths(&self) -> &[&str] {
        &["boot/kboot.cfg", "kboot.cfg"]
    }

    fn video_mode(&self) -> Option<VideoMode> {
        None
    }

    fn serial_port(&self) -> Option<SerialPort> {
        None
    }

    /// EFI system table address, on EFI platforms.
    fn efi_system_table(&self) -> Option<PhyAddr> {
        None
    }

    /// Raw BIOS E820 map, on BIOS platforms, for the native protocol's `BIOS_E820`
    /// tag.
    fn bios_e820(&self) -> Option<Vec<u8>> {
        None
    }

    /// Enters a Linux kernel through the legacy 16-bit entry point. BIOS platforms
    /// implement the drop to real mode; everywhere else this is unsupported.
    fn linux_enter_real_mode(&self, _setup_base: PhyAddr) -> ! {
        boot_error!("16-bit Linux entry is not supported on this platform");
    }

    /// Transfers to a Linux kernel's EFI handover entry point.
    fn linux_efi_handover(&self, _entry: PhyAddr, _boot_params: PhyAddr) -> ! {
        boot_error!("EFI handover is not supported on this platform");
    }
}

static PLATFORM: OnceCell<&'static dyn Platform> = OnceCell::uninit();

/// Installs the platform. First thing a platform crate does after `platform_init`.
pub fn register(platform: &'static dyn Platform) {
    PLATFORM.init_once(|| platform);
}

/// The installed platform.
///
/// # Panics
///
/// Panics before [`register`]; the initialisation order (platform first) guarantees
/// availability everywhere in the core.
pub fn get() -> &'static dyn Platform {
    *PLATFORM.try_get().expect("platform not registered")
}

pub fn current_time_ms() -> u64 {
    get().current_time_ms()
}

pub fn halt() -> ! {
    get().halt()
}

pub fn reboot() -> ! {
    info!("platform", "rebooting");
    get().reboot()
}

pub fn exit() -> ! {
    get().exit()
}

/// Locates and reads the boot configuration.
///
/// `override_path` replaces the platform search list entirely (set from the loader's
/// own command line by the platform). The search falls through on `NotFound` only;
/// any other failure aborts.
pub fn load_config(env: &Environment, override_path: Option<&str>) -> Option<(String, Vec<u8>)> {
    let platform = get();

    let paths: Vec<String> = match override_path {
        Some(path) => alloc::vec![String::from(path)],
        None => platform
            .config_paths()
            .iter()
            .map(|p| String::from(*p))
            .collect(),
    };

    for path in paths {
        match crate::fs::open(
            &env.open_context(),
            &path,
            Some(HandleKind::Regular),
            OpenFlags::empty(),
        ) {
            Ok(handle) => match crate::fs::read_whole(&handle) {
                Ok(data) => {
                    info!("config", "using configuration {path}");
                    return Some((path, data));
                }
                Err(err) => {
                    boot_error!("failed to read configuration {path}: {err}");
                }
            },
            Err(Status::NotFound) => continue,
            Err(err) => {
                boot_error!("failed to open configuration {path}: {err}");
            }
        }
    }

    None
}

/// Top-level boot flow, entered by the platform once its own bring-up is done
/// (console registered, memory probed and the physical allocator installed, devices
/// registered and partition-probed).
///
/// Mounts the boot device, loads and runs the configuration, and boots the resulting
/// environment. Never returns: every failure path ends in a boot error.
pub fn loader_main(override_config: Option<&str>) -> ! {
    let platform = get();

    let Some(boot_device_name) = platform.boot_device() else {
        boot_error!("platform did not report a boot device");
    };
    let Some(boot_device) = crate::device::lookup(&boot_device_name) else {
        boot_error!("boot device '{boot_device_name}' is not registered");
    };

    if let Err(err) = crate::fs::probe_device(&boot_device) {
        boot_error!("cannot mount boot device '{boot_device_name}': {err}");
    }

    let mut env = Environment::new(None);
    env.set_device(&boot_device);

    let Some((path, data)) = load_config(&env, override_config) else {
        boot_error!("no configuration file found on '{boot_device_name}'");
    };
    let Ok(text) = core::str::from_utf8(&data) else {
        boot_error!("{path}: configuration is not valid UTF-8");
    };

    // File-driven mode: a configuration error is fatal and reports the source
    // location, per the installed-handler model.
    let commands = match parser::parse_str(text) {
        Ok(commands) => commands,
        Err(err) => boot_error!("{path}:{err}"),
    };
    if let Err(err) = exec::command_list_exec(&commands, &mut env) {
        boot_error!("{path}:{err}");
    }

    if env.loader().is_none() {
        boot_error!("{path}: configuration did not bind an operating system");
    }

    crate::loader::environ_boot(&mut env)
}
