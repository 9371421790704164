//! Kernel entry trampoline.
//!
//! The final control transfer runs from a scratch page that is visible in three
//! address spaces: identity-mapped in the loader's, identity-mapped and aliased in
//! the trampoline tables, and aliased at `trampoline_virt` in the kernel tables. The
//! code switches to the trampoline tables, jumps to the alias, switches to the kernel
//! tables, loads the stack and entry registers and jumps into the kernel with the
//! protocol magic in `eax` and the tag list pointer in `rdi`.
//!
//! The page layout is the argument block at offset 0, code at [`CODE_OFFSET`].

use crate::mem::{phys_slice_mut, MemoryMapping, PhyAddr, PAGE_SIZE};

/// Argument block read by the trampoline code. Field order is baked into the code
/// below; do not reorder.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TrampolineArgs {
    /// Root table of the trampoline address space.
    pub trampoline_cr3: u64,
    /// Address of the scratch page in the trampoline and kernel address spaces.
    pub trampoline_virt: u64,
    /// Root table of the kernel address space.
    pub kernel_cr3: u64,
    /// Initial kernel stack pointer.
    pub sp: u64,
    /// Kernel entry point.
    pub entry: u64,
    /// Tag list address in the kernel address space.
    pub tags: u64,
}

/// Offset of the code within the scratch page.
pub const CODE_OFFSET: usize = 0x40;

/// Offset of the second stage inside [`TRAMPOLINE_CODE`], reached through the
/// `trampoline_virt` alias.
const STAGE2_OFFSET: usize = 0x15;

/// Hand-assembled x86-64 trampoline. Position independent; entered with `rsi`
/// pointing at the [`TrampolineArgs`] block through an identity mapping.
#[rustfmt::skip]
static TRAMPOLINE_CODE: [u8; 0x2F] = [
    // cli
    0xFA,
    // mov rax, [rsi + 0x00]        ; trampoline_cr3
    0x48, 0x8B, 0x46, 0x00,
    // mov cr3, rax                 ; now running identity-mapped in trampoline space
    0x0F, 0x22, 0xD8,
    // mov rbx, [rsi + 0x08]        ; trampoline_virt
    0x48, 0x8B, 0x5E, 0x08,
    // add rbx, CODE_OFFSET + STAGE2_OFFSET
    0x48, 0x81, 0xC3, 0x55, 0x00, 0x00, 0x00,
    // jmp rbx                      ; continue from the alias mapped in both spaces
    0xFF, 0xE3,
    // stage2:
    // mov rax, [rsi + 0x10]        ; kernel_cr3
    0x48, 0x8B, 0x46, 0x10,
    // mov rsp, [rsi + 0x18]        ; sp
    0x48, 0x8B, 0x66, 0x18,
    // mov rbx, [rsi + 0x20]        ; entry
    0x48, 0x8B, 0x5E, 0x20,
    // mov rdi, [rsi + 0x28]        ; tags
    0x48, 0x8B, 0x7E, 0x28,
    // mov cr3, rax                 ; kernel space; rip stays valid via the alias
    0x0F, 0x22, 0xD8,
    // mov eax, 0xb007cafe
    0xB8, 0xFE, 0xCA, 0x07, 0xB0,
    // jmp rbx
    0xFF, 0xE3,
];

/// Writes the argument block and the trampoline code into the scratch page.
pub fn install<M: MemoryMapping>(mapping: M, page: PhyAddr, args: &TrampolineArgs) {
    assert!(CODE_OFFSET >= core::mem::size_of::<TrampolineArgs>());

    // SAFETY: the scratch page was allocated for this purpose and is reachable
    // through `mapping`.
    let slice = unsafe { phys_slice_mut(mapping, page, PAGE_SIZE as usize) };
    slice.fill(0);

    // SAFETY: TrampolineArgs is plain data; the destination is the page start.
    unsafe {
        core::ptr::write_unaligned(slice.as_mut_ptr().cast::<TrampolineArgs>(), *args);
    }
    slice[CODE_OFFSET..CODE_OFFSET + TRAMPOLINE_CODE.len()].copy_from_slice(&TRAMPOLINE_CODE);
}

/// Jumps into the installed trampoline. The scratch page must be identity-mapped in
/// the current address space.
///
/// # Safety
///
/// Last call of the loader's life: interrupts must be masked, the page prepared with
/// [`install`], and both page-table trees valid as described in the module docs.
#[cfg(target_arch = "x86_64")]
pub unsafe fn enter(page: PhyAddr) -> ! {
    crate::x86::cache_flush();

    core::arch::asm!(
        "cli",
        "jmp {entry}",
        entry = in(reg) page.as_u64() + CODE_OFFSET as u64,
        in("rsi") page.as_u64(),
        options(noreturn),
    );
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn enter(_page: PhyAddr) -> ! {
    unimplemented!("trampoline entry is x86-64 only");
}
