//! Data plane of the security agent.
//!
//! Everything here runs inside BPF programs, written once against the
//! [`kernel::Kernel`] trait. The BPF object (`secwatch-ebpf`) supplies the
//! aya-ebpf implementation; the `sim` feature supplies an in-process one for
//! tests and for the agent's dry-run mode. Record layouts in [`event`] are
//! shared verbatim with the agent.
#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub mod activity_dump;
pub mod anomaly;
pub mod approvers;
pub mod args;
pub mod consts;
pub mod container;
pub mod dentry;
pub mod discarders;
pub mod emit;
pub mod erpc;
pub mod event;
pub mod filter;
pub mod kernel;
pub mod kobj;
pub mod mount;
pub mod net;
pub mod path;
pub mod probes;
pub mod process;
pub mod programs;
pub mod rate_limiter;
pub mod span;
pub mod stats;
pub mod syscall_cache;
pub mod types;

#[cfg(any(feature = "sim", test))]
pub mod sim;

#[cfg(feature = "user")]
pub mod user;
