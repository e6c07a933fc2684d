//! Program arrays and the programs registered in them.
//!
//! A program array only accepts programs of its owner's type, so each family
//! of callers gets its own array holding its own copy of every target. The
//! agent fills slot `prog as u32` of each array before attaching.

use aya_ebpf::bindings::{TC_ACT_OK, TC_ACT_SHOT};
use aya_ebpf::macros::{classifier, map, tracepoint};
use aya_ebpf::maps::ProgramArray;
use aya_ebpf::programs::{TcContext, TracePointContext};
use aya_ebpf::EbpfContext;
use aya_log_ebpf::warn;

#[cfg(not(feature = "fentry"))]
use aya_ebpf::{macros::kprobe, programs::ProbeContext};
#[cfg(feature = "fentry")]
use aya_ebpf::{macros::fentry, programs::FEntryContext};

use secwatch_common::kernel::{Next, Prog};
use secwatch_common::programs::{run_classifier_prog, run_prog, tail_call_failed};

use crate::classifier::Skb;
use crate::kernel::BpfKernel;

pub const PROG_SLOTS: u32 = 16;

/// Targets for kprobes, or for fentry programs with the `fentry` feature.
#[map]
pub(crate) static HOOK_PROGS: ProgramArray = ProgramArray::with_max_entries(PROG_SLOTS, 0);
/// Targets for the syscall tracepoint fallbacks.
#[map]
pub(crate) static TP_PROGS: ProgramArray = ProgramArray::with_max_entries(PROG_SLOTS, 0);
#[map]
pub(crate) static TC_PROGS: ProgramArray = ProgramArray::with_max_entries(PROG_SLOTS, 0);

/// Carries out `next` from a tracing program.
#[inline(always)]
pub fn follow<C: EbpfContext>(ctx: &C, progs: &ProgramArray, next: Next) {
    let Next::TailCall(prog) = next else {
        return;
    };
    // returns only when the slot is empty or the chain is too deep
    let _ = unsafe { progs.tail_call(ctx, prog as u32) };
    warn!(ctx, "tail call to program {} failed", prog as u32);
    tail_call_failed(&BpfKernel, prog);
}

/// Carries out `next` from a classifier and turns it into a TC action.
#[inline(always)]
pub fn verdict(ctx: &TcContext, next: Next) -> i32 {
    match next {
        Next::Done => TC_ACT_OK,
        Next::Drop => TC_ACT_SHOT,
        Next::TailCall(prog) => {
            let _ = unsafe { TC_PROGS.tail_call(ctx, prog as u32) };
            TC_ACT_OK
        }
    }
}

macro_rules! hook_target {
    ($name:ident, $prog:expr) => {
        #[cfg(not(feature = "fentry"))]
        #[kprobe]
        pub fn $name(ctx: ProbeContext) -> u32 {
            follow(&ctx, &HOOK_PROGS, run_prog(&BpfKernel, $prog));
            0
        }

        // never attached: loaded against a stable symbol so it can sit in
        // the fentry program array
        #[cfg(feature = "fentry")]
        #[fentry(function = "vfs_open")]
        pub fn $name(ctx: FEntryContext) -> i32 {
            follow(&ctx, &HOOK_PROGS, run_prog(&BpfKernel, $prog));
            0
        }
    };
}

macro_rules! tp_target {
    ($name:ident, $prog:expr) => {
        #[tracepoint]
        pub fn $name(ctx: TracePointContext) -> u32 {
            follow(&ctx, &TP_PROGS, run_prog(&BpfKernel, $prog));
            0
        }
    };
}

macro_rules! tc_target {
    ($name:ident, $prog:expr) => {
        #[classifier]
        pub fn $name(ctx: TcContext) -> i32 {
            let next = run_classifier_prog(&BpfKernel, &Skb(&ctx), $prog);
            verdict(&ctx, next)
        }
    };
}

hook_target!(hook_dentry_resolver, Prog::DentryResolver);
hook_target!(hook_dentry_callback, Prog::DentryCallback);
hook_target!(hook_erpc_resolve_path, Prog::ErpcResolvePath);
hook_target!(hook_args_envs_parser, Prog::ArgsEnvsParser);

tp_target!(tp_dentry_resolver, Prog::DentryResolver);
tp_target!(tp_dentry_callback, Prog::DentryCallback);
tp_target!(tp_erpc_resolve_path, Prog::ErpcResolvePath);
tp_target!(tp_args_envs_parser, Prog::ArgsEnvsParser);

tc_target!(tc_dns_request, Prog::DnsRequest);
tc_target!(tc_dns_response, Prog::DnsResponse);
tc_target!(tc_imds, Prog::Imds);
tc_target!(tc_raw_packet, Prog::RawPacket);
tc_target!(tc_raw_packet_drop, Prog::RawPacketDrop);
