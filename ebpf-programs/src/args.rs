//! Argument extraction, one accessor per program shape.

use aya_ebpf::programs::{ProbeContext, TracePointContext};
#[cfg(feature = "fentry")]
use aya_ebpf::programs::FEntryContext;

use secwatch_common::kernel::Kernel;

use crate::kernel::BpfKernel;

pub trait Args {
    fn arg(&self, n: usize) -> u64;
}

/// A kernel function entered through a kprobe.
pub struct Kprobe<'a>(pub &'a ProbeContext);

impl Args for Kprobe<'_> {
    #[inline(always)]
    fn arg(&self, n: usize) -> u64 {
        self.0.arg::<u64>(n).unwrap_or(0)
    }
}

#[cfg(feature = "fentry")]
pub struct Fentry<'a>(pub &'a FEntryContext);

#[cfg(feature = "fentry")]
impl Args for Fentry<'_> {
    #[inline(always)]
    fn arg(&self, n: usize) -> u64 {
        unsafe { self.0.arg::<u64>(n) }
    }
}

// `struct pt_regs` offsets of the argument registers: di, si, dx, r10, r8,
// r9 for native calls and bx, cx, dx, si, di, bp for 32-bit compat calls.
const X64_ARGS: [u64; 6] = [112, 104, 96, 56, 72, 64];
const IA32_ARGS: [u64; 6] = [40, 88, 96, 104, 112, 32];

/// The user registers a `__x64_sys_*` or `__ia32_*sys_*` wrapper receives as
/// its only argument.
pub struct SyscallRegs {
    regs: u64,
    offsets: &'static [u64; 6],
}

impl SyscallRegs {
    #[inline(always)]
    pub fn native(regs: u64) -> Self {
        Self { regs, offsets: &X64_ARGS }
    }

    #[inline(always)]
    pub fn compat(regs: u64) -> Self {
        Self { regs, offsets: &IA32_ARGS }
    }
}

impl Args for SyscallRegs {
    #[inline(always)]
    fn arg(&self, n: usize) -> u64 {
        match self.offsets.get(n) {
            Some(offset) => BpfKernel.read::<u64>(self.regs.wrapping_add(*offset)).unwrap_or(0),
            None => 0,
        }
    }
}

/// `syscalls:sys_enter_*`: the arguments follow the common header and the
/// syscall number.
pub struct SyscallTracepoint<'a>(pub &'a TracePointContext);

impl Args for SyscallTracepoint<'_> {
    #[inline(always)]
    fn arg(&self, n: usize) -> u64 {
        unsafe { self.0.read_at::<u64>(16 + 8 * n) }.unwrap_or(0)
    }
}

/// Return value of a `syscalls:sys_exit_*` record.
#[inline(always)]
pub fn tracepoint_ret(ctx: &TracePointContext) -> i64 {
    unsafe { ctx.read_at::<i64>(16) }.unwrap_or(0)
}
