//! x86-64 architecture support: CPU capability checks, the kernel page-table
//! builder and the handoff trampoline.

pub mod paging;
pub mod trampoline;

/// Checks long mode support (CPUID leaf `0x80000001`, EDX bit 29).
#[cfg(target_arch = "x86_64")]
pub fn has_long_mode() -> bool {
    // SAFETY: CPUID is unprivileged; the extended leaf range is probed first.
    unsafe {
        if core::arch::x86_64::__cpuid(0x8000_0000).eax < 0x8000_0001 {
            return false;
        }
        core::arch::x86_64::__cpuid(0x8000_0001).edx & (1 << 29) != 0
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn has_long_mode() -> bool {
    false
}

/// Checks 1 GiB page support (CPUID leaf `0x80000001`, EDX bit 26).
#[cfg(target_arch = "x86_64")]
pub fn has_gbyte_pages() -> bool {
    // SAFETY: CPUID is unprivileged; the extended leaf range is probed first.
    unsafe {
        if core::arch::x86_64::__cpuid(0x8000_0000).eax < 0x8000_0001 {
            return false;
        }
        core::arch::x86_64::__cpuid(0x8000_0001).edx & (1 << 26) != 0
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn has_gbyte_pages() -> bool {
    false
}

/// Masks maskable interrupts. Only meaningful in ring 0; the loader calls this on the
/// way into a kernel, never under a host OS.
#[cfg(target_arch = "x86_64")]
pub unsafe fn interrupts_disable() {
    core::arch::asm!("cli", options(nomem, nostack));
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn interrupts_disable() {}

/// Writes every dirty cache line back to memory, so the boot log and tag list survive
/// the address-space switch and a possible warm reset.
#[cfg(target_arch = "x86_64")]
pub unsafe fn cache_flush() {
    core::arch::asm!("wbinvd", options(nostack));
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn cache_flush() {}
