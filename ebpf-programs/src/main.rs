//! eBPF object for the secwatch runtime security agent
//!
//! Thin dispatchers around `secwatch-common`: each program pulls its
//! arguments out of its context, runs the shared hook body against the
//! aya-ebpf substrate and carries out the tail call it asks for. The agent
//! loads the whole object, fills the program arrays and attaches what the
//! running kernel offers.

#![no_std]
#![no_main]

mod args;
mod classifier;
mod hooks;
mod kernel;
mod syscalls;
mod tail;

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
