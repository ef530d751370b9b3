//! Physical register numbering
//!
//! Allocatable:
//!   RBX=0 RCX=1 RDX=2 RSI=3 RDI=4 R8=5 R9=6 R10=7 R12=9 R13=10 R14=11 R15=12
//!   XMM0=50 .. XMM5=55
//!   FLAG=100 (the EFLAGS pseudo-register for compare-into-branch)
//!
//! Reserved/scratch: RSP, RBP, RAX, R11 (=8, second integer scratch),
//! XMM6/XMM7 (vector scratch pair).

pub const FLAG: i32 = 100;
pub const SPILL: i32 = -1;

pub const GP_SCRATCH: u8 = 0; // RAX hardware id
pub const GP_SCRATCH2: u8 = 11; // R11 hardware id
pub const XMM_SCRATCH: u8 = 7; // XMM7

/// Allocator ids handed out for general-purpose registers. R11 (id 8) stays
/// reserved as the second scratch.
pub const GP_ALLOCATABLE: [i32; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 9, 10, 11, 12];
/// xmm6 stays reserved as the second vector scratch.
pub const XMM_ALLOCATABLE: [i32; 6] = [50, 51, 52, 53, 54, 55];

/// System V integer argument registers (rdi, rsi, rdx, rcx, r8, r9) as
/// allocator ids.
pub const GP_ARG_REGS: [i32; 6] = [4, 3, 2, 1, 5, 6];
/// System V float argument registers xmm0..xmm5 as allocator ids.
pub const XMM_ARG_REGS: [i32; 6] = [50, 51, 52, 53, 54, 55];
/// Caller-saved registers beyond the argument set (r10; r11 is reserved).
pub const GP_CALLER_SAVED_EXTRA: [i32; 1] = [7];

pub fn is_xmm(reg: i32) -> bool {
    (50..=56).contains(&reg)
}

/// Hardware encoding (0-15) of an allocator GP id.
pub fn gp_encoding(reg: i32) -> u8 {
    const MAP: [u8; 13] = [
        3,  // RBX
        1,  // RCX
        2,  // RDX
        6,  // RSI
        7,  // RDI
        8,  // R8
        9,  // R9
        10, // R10
        11, // R11 (reserved; never allocated)
        12, // R12
        13, // R13
        14, // R14
        15, // R15
    ];
    MAP[reg as usize]
}

/// Hardware encoding (0-7) of an allocator XMM id.
pub fn xmm_encoding(reg: i32) -> u8 {
    (reg - 50) as u8
}

/// Callee-saved general-purpose registers the prologue preserves, as
/// hardware encodings (rbx, r12, r13, r14, r15).
pub const CALLEE_SAVED_ENCODINGS: [u8; 5] = [3, 12, 13, 14, 15];

pub fn name(reg: i32) -> &'static str {
    match reg {
        -1 => "spill",
        0 => "rbx",
        1 => "rcx",
        2 => "rdx",
        3 => "rsi",
        4 => "rdi",
        5 => "r8",
        6 => "r9",
        7 => "r10",
        8 => "r11",
        9 => "r12",
        10 => "r13",
        11 => "r14",
        12 => "r15",
        50..=56 => ["xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6"][(reg - 50) as usize],
        100 => "flag",
        _ => "?",
    }
}
