//! Hook bodies, one function per kernel attach point.
//!
//! Each function takes the hook's arguments already extracted by the
//! dispatcher and returns what to do next. The BPF object wraps them in
//! kprobes, fentry programs and tracepoints; the simulation calls them
//! directly.

pub mod callbacks;
pub mod fs;
pub mod mount;
pub mod net;
pub mod process;
pub mod syscalls;
